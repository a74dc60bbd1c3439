use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::classify::FailureKind;

/// A fetch failed in a way the next cycle may recover from.
///
/// Fetchers return this (wrapped in `anyhow::Error`) for network, API and
/// parse errors.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpdateFailed {
    message: String,
}

impl UpdateFailed {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A fetch failed because credentials were rejected.
#[derive(Debug, Clone, thiserror::Error)]
#[error("authentication failed: {message}")]
pub struct AuthFailed {
    message: String,
}

impl AuthFailed {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The fetcher did not complete within the configured timeout.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("fetch timed out after {0:?}")]
pub struct FetchTimeout(pub Duration);

/// A classified fetch failure, as stored in coordinator state.
///
/// Cheap to clone: the underlying error is shared.
#[derive(Clone)]
pub struct UpdateError {
    kind: FailureKind,
    error: Arc<anyhow::Error>,
}

impl UpdateError {
    pub fn new(kind: FailureKind, error: anyhow::Error) -> Self {
        Self {
            kind,
            error: Arc::new(error),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// The error the fetcher returned.
    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    /// Attempt to downcast the underlying error to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl fmt::Debug for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateError")
            .field("kind", &self.kind)
            .field("error", &format_args!("{:#}", self.error))
            .finish()
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

impl std::error::Error for UpdateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Errors surfaced by the coordinator to its callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinatorError {
    /// The setup-time refresh failed transiently; the entry should retry later.
    #[error("{name} is not ready: {source}")]
    NotReady {
        name: String,
        #[source]
        source: UpdateError,
    },

    /// Credentials were rejected; the entry needs re-authentication.
    #[error("{name} failed to authenticate: {source}")]
    AuthFailed {
        name: String,
        #[source]
        source: UpdateError,
    },

    /// The fetcher failed in a way that must abort the caller.
    #[error("{name} failed fatally: {source}")]
    Fatal {
        name: String,
        #[source]
        source: UpdateError,
    },

    /// No refresh has completed yet.
    #[error("{0} has not been refreshed yet")]
    NeverRefreshed(String),

    /// The most recent refresh did not succeed.
    #[error("last update of {name} failed: {source}")]
    LastUpdateFailed {
        name: String,
        #[source]
        source: UpdateError,
    },

    /// The coordinator was shut down.
    #[error("{0} has been shut down")]
    ShutDown(String),
}

impl CoordinatorError {
    /// The classified fetch failure behind this error, if any.
    pub fn update_error(&self) -> Option<&UpdateError> {
        match self {
            CoordinatorError::NotReady { source, .. }
            | CoordinatorError::AuthFailed { source, .. }
            | CoordinatorError::Fatal { source, .. }
            | CoordinatorError::LastUpdateFailed { source, .. } => Some(source),
            CoordinatorError::NeverRefreshed(_) | CoordinatorError::ShutDown(_) => None,
        }
    }
}
