//! btleplug implementation of the collaborator traits.
//!
//! This module provides the default [`Transport`](crate::Transport) for
//! discovering devices by address and keeping a session open to them.

pub mod decoder;
pub mod scanner;
pub mod session;

pub use decoder::RawDecoder;
pub use scanner::BtleTransport;
pub use session::BtleSession;
