//! GenLoop wire protocol
//!
//! This crate contains the types shared between the node and the
//! dispatcher: the binary frame codec for node-to-dispatcher traffic, the
//! JSON control messages the dispatcher sends, and the connect-time
//! handshake parameters.

pub mod connect;
pub mod frame;
pub mod message;

// Re-export commonly used types
pub use connect::ConnectParams;
pub use frame::{Frame, FrameError};
pub use message::{ChatMessage, DispatcherMessage, GenerationRequest};
