//! Built-in providers.
//!
//! Only the local-exec provider ships in-tree; infrastructure providers
//! (ssh, k8s, aws) are plugins that implement the same `Provider` contract.

pub mod proc;

pub use proc::ProcProvider;
