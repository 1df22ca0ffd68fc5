//! gRPC service implementation and shutdown coordination.
//!
//! ## Structure
//!
//! - [`handler`] - gRPC service entry point (`ContractStreamService`).

pub mod handler;
