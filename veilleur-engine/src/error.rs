//! Engine error taxonomy.
//!
//! Only configuration problems are fatal to a run. Everything that happens
//! at the level of a single host (probe failures, remote execution errors,
//! shutdown refusals) is converted into a per-host classification and
//! recorded as data, so one bad host never aborts the batch.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing group, unparsable fleet file, absent credentials. Aborts the
    /// run before any host is touched.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A remote command could not be executed or returned a failure exit
    /// code. Always caught at the per-host boundary by the orchestrators.
    #[error("remote execution failed on {host}: {reason}")]
    Remote { host: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn remote(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Remote {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// True when the error must terminate the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
