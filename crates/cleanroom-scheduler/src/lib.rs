//! Job orchestration for the cleanroom platform.
//!
//! - [`JobService`] accepts submissions, serves job data and applies status
//!   transitions.
//! - [`BuildOrchestrator`] turns a workspace into a tagged image build.
//! - [`SecurityBinding`] owns each creator's key and identity provider.
//! - [`Monitor`] reconciles build jobs and confidential instances back into
//!   job status through a [`StatusCallback`].

pub mod build;
pub mod callback;
pub mod context;
pub mod monitor;
pub mod security;
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

pub use build::{BuildOrchestrator, BuildRequest};
pub use callback::{HttpStatusCallback, StatusCallback};
pub use monitor::{Monitor, MonitorReport, SweepFailure, SweepReport, extract_digest};
pub use security::SecurityBinding;
pub use service::{JobService, OutputAttrs};
