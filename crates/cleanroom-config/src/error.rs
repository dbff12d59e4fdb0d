//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("KDL syntax error at line {line}, column {column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Locate the first diagnostic of a KDL parse failure in `source`.
    pub fn syntax(source: &str, err: kdl::KdlError) -> Self {
        let Some(diagnostic) = err.diagnostics.first() else {
            return ConfigError::Parse(err);
        };

        let offset = diagnostic.span.offset().min(source.len());
        let before = source.get(..offset).unwrap_or(source);
        let line = before.matches('\n').count() + 1;
        let column = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
        let message = diagnostic
            .message
            .clone()
            .unwrap_or_else(|| "invalid syntax".to_string());

        ConfigError::Syntax {
            line,
            column,
            message,
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
