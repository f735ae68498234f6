use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed port range. Fatal at startup.
    #[error("invalid port range: {0}")]
    InvalidRange(String),

    /// Every port in the range is bound or claimed.
    #[error("no ports available in [{start}, {stop})")]
    NoPortsAvailable { start: u16, stop: u16 },

    /// The identifier (with any session suffix) cannot be used as a
    /// gateway session name.
    #[error("invalid identifier {0:?}: session names allow only ASCII letters, digits and -_.~@")]
    InvalidIdentifier(String),

    /// The identifier already owns a running (or starting) worker.
    #[error("{0} already has a process running")]
    DuplicateSession(String),

    /// A registry uniqueness constraint would be violated.
    #[error("duplicate {field} in registry: {value}")]
    Duplicate { field: &'static str, value: String },

    /// Command or template input that does not resolve to exactly one shape.
    #[error("ambiguous command spec: {0}")]
    AmbiguousSpec(String),

    #[error("unknown prebaked project: {0}")]
    UnknownTemplate(String),

    #[error("spawn worker `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker died before it could be registered.
    #[error("worker for {identifier} exited during startup ({status})")]
    WorkerExited { identifier: String, status: String },

    #[error("worker for {identifier} did not accept connections on port {port}")]
    WorkerNotReady { identifier: String, port: u16 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("registry database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A template file that was skipped. Logged, never fatal to the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateLoadWarning {
    pub path: PathBuf,
    pub reason: String,
}

impl std::fmt::Display for TemplateLoadWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}
