//! Cloud provider implementations for the cleanroom platform.
//!
//! Provides the Google Cloud backend for object storage, KMS, workload
//! identity pools and confidential Compute Engine instances.

pub mod gcp;
pub mod token;

pub use cleanroom_core::cloud::{
    CloudProvider, ConfidentialInstanceSpec, Instance, InstanceState,
};
pub use gcp::GcpProvider;
pub use token::TokenSource;
