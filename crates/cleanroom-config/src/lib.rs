//! KDL configuration parsing for the cleanroom platform.
//!
//! One file describes the cloud project, the build cluster, the builder
//! and the two long-running processes (API server and reconciliation
//! monitor). Everything that names a cloud resource derives from it.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    ApiConfig, BuildConfig, CloudConfig, ClusterConfig, DEFAULT_CONFIG_PATH, MonitorConfig,
    SystemConfig, load_system_config, parse_system_config,
};
