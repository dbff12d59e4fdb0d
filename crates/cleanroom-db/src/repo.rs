//! Repository traits and implementations.

pub mod job;

pub use job::{JobPage, JobRepo, PgJobRepo};
