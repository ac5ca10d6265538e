//! nodeinit shared types
//!
//! This crate contains the types a transport implementation needs to talk to
//! the nodeinit engine without depending on the engine itself: node
//! addresses, request/response frames and the error types.

pub mod errors;
pub mod frame;
pub mod node;

pub use errors::{NodeinitError, NodeinitResult};
pub use frame::{FunctionId, RequestFrame, ResponseFrame, TransportError};
pub use node::NodeId;
