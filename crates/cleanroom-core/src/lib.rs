//! Core domain types and traits for the cleanroom job platform.
//!
//! This crate contains:
//! - The job record and its lifecycle state machine
//! - The deterministic naming scheme for storage paths and cloud resources
//! - Capability traits for the cloud provider and the build job runner
//! - The shared error taxonomy

pub mod cloud;
pub mod error;
pub mod job;
pub mod paths;
pub mod runner;

pub use error::{Error, Result};
pub use job::{Job, JobStatus, NewJob, Transition, UpdateJobRequest, UpdateJobResponse};
