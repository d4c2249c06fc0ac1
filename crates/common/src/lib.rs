//! Shared wire types for the corral workspace.
//!
//! Everything here crosses the RPC boundary between an API front-end and the
//! conductor fleet. Stored shapes live in the conductor crate; the mapping
//! between the two is a pure function there.

#![warn(missing_docs)]

/// Shared API DTOs for cross-crate use.
pub mod api;
/// RPC envelope and reply types.
pub mod rpc;
