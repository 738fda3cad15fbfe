use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Invalid Key: {0}")]
    InvalidKey(String),

    /// The source object is structurally unusable; retrying will not help
    #[error("Invalid Source {0}: {1}")]
    InvalidSource(String, String),

    #[error("{kind} {key} exists but is not managed by this controller")]
    NotOwned { kind: &'static str, key: String },

    #[error("Reconcile of {0} timed out after {1:?}")]
    Timeout(String, std::time::Duration),

    #[error("Cache did not sync within {0:?}")]
    CacheSync(std::time::Duration),

    /// NB: this is a catch-all for any other errors
    #[error("Other Error: {0}")]
    OtherError(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Errors that a backoff requeue cannot fix. The key is dropped instead.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::InvalidKey(_) | Error::InvalidSource(..) | Error::NotOwned { .. }
        )
    }
}

pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod derived;
pub mod events_helper;
pub mod key;
pub mod queue;
pub mod reconciler;
pub mod router;
pub mod worker;

pub use crate::key::ObjectKey;

/// Log and trace integrations
pub mod telemetry;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_errors_are_not_retried() {
        assert!(Error::InvalidSource("default/web".into(), "no labels".into()).is_permanent());
        assert!(Error::InvalidKey("a/b/c".into()).is_permanent());
        assert!(!Error::Timeout("default/web".into(), std::time::Duration::from_secs(1)).is_permanent());
        assert!(!Error::OtherError("boom".into()).is_permanent());
    }
}
