//! Build job runners for the cleanroom platform.
//!
//! Builds run as Kubernetes batch jobs in the configured namespace.

pub mod kubernetes;

pub use cleanroom_core::runner::{BuildJob, BuildJobSpec, BuildJobState, JobRunner};
pub use kubernetes::KubernetesJobRunner;
