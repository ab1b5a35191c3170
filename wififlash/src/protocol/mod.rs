//! Protocol implementations.

pub mod packet;
pub mod slip;

// Re-export common types
pub use packet::{Connection, Frame, Opcode, Response};
