//! Pingmesh node library.
//!
//! This library provides the components for building and running a pingmesh
//! node. It is used by the `pingmesh-node` binary and can also be used for
//! testing and embedding.

pub mod cli;
pub mod config;
pub mod node;
pub mod shutdown;
