//! Protocol implementations.

pub mod command;
pub mod frame;

// Re-export common types
pub use command::{CommandFrame, Opcode, Response};
pub use frame::{FrameDecoder, encode};
