//! Request intake and batch emission for a single bidirectional stream.
//!
//! - [`coordinator`] - reads inbound requests and spawns one task per accepted
//!   request.
//! - [`request`] - the per-request state machine.
//! - [`processor`] - generates, sends and paces the batches of one request.

pub mod coordinator;
pub mod processor;
pub mod request;
