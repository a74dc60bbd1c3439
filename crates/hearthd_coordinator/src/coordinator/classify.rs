//! Failure classification for fetch errors.
//!
//! A fetcher reports failures as `anyhow::Error`. The coordinator asks a
//! [`FailureClassifier`] what kind of failure it is, and the answer decides
//! whether the error is absorbed into state, escalated as a re-auth request, or
//! returned to the caller.

use std::fmt;

use super::error::AuthFailed;

/// How the coordinator should treat a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Recoverable by retrying on the next cycle.
    Transient,

    /// Credentials are invalid or expired; the entry needs re-authentication.
    Auth,

    /// Not survivable; propagated to the caller of `refresh()`.
    Fatal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Auth => write!(f, "auth"),
            FailureKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Maps a fetch error to a [`FailureKind`].
///
/// Implementations must be pure: no I/O, no side effects.
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, error: &anyhow::Error) -> FailureKind;
}

impl<F> FailureClassifier for F
where
    F: Fn(&anyhow::Error) -> FailureKind + Send + Sync,
{
    fn classify(&self, error: &anyhow::Error) -> FailureKind {
        self(error)
    }
}

type Matcher = fn(&anyhow::Error) -> bool;

fn is<E>(error: &anyhow::Error) -> bool
where
    E: std::error::Error + Send + Sync + 'static,
{
    error.chain().any(|cause| cause.is::<E>())
}

/// Classifier used when an integration supplies none.
///
/// Everything is [`FailureKind::Transient`] except the declared auth and fatal
/// error types. [`AuthFailed`] is always declared as auth. Matching walks the
/// error's cause chain, so context added with `anyhow::Context` does not hide
/// the underlying type.
#[derive(Clone)]
pub struct DefaultClassifier {
    auth: Vec<Matcher>,
    fatal: Vec<Matcher>,
}

impl DefaultClassifier {
    pub fn new() -> Self {
        Self {
            auth: vec![is::<AuthFailed>],
            fatal: Vec::new(),
        }
    }

    /// Declare `E` as an authentication failure.
    pub fn auth<E>(mut self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.auth.push(is::<E>);
        self
    }

    /// Declare `E` as a fatal failure.
    pub fn fatal<E>(mut self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.fatal.push(is::<E>);
        self
    }
}

impl Default for DefaultClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DefaultClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultClassifier")
            .field("auth", &self.auth.len())
            .field("fatal", &self.fatal.len())
            .finish()
    }
}

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, error: &anyhow::Error) -> FailureKind {
        // Fatal wins if a type was declared as both.
        if self.fatal.iter().any(|m| m(error)) {
            FailureKind::Fatal
        } else if self.auth.iter().any(|m| m(error)) {
            FailureKind::Auth
        } else {
            FailureKind::Transient
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;
    use crate::coordinator::error::FetchTimeout;
    use crate::coordinator::error::UpdateFailed;

    #[derive(Debug, thiserror::Error)]
    #[error("token expired")]
    struct TokenExpired;

    #[derive(Debug, thiserror::Error)]
    #[error("device removed")]
    struct DeviceRemoved;

    #[test]
    fn test_default_is_transient() {
        let classifier = DefaultClassifier::default();
        let err = anyhow::Error::new(UpdateFailed::new("connection refused"));
        assert_eq!(classifier.classify(&err), FailureKind::Transient);

        let err = anyhow::anyhow!("some io error");
        assert_eq!(classifier.classify(&err), FailureKind::Transient);
    }

    #[test]
    fn test_timeout_is_transient() {
        let classifier = DefaultClassifier::default();
        let err = anyhow::Error::new(FetchTimeout(std::time::Duration::from_secs(10)));
        assert_eq!(classifier.classify(&err), FailureKind::Transient);
    }

    #[test]
    fn test_auth_failed_is_auth() {
        let classifier = DefaultClassifier::default();
        let err = anyhow::Error::new(AuthFailed::new("401 Unauthorized"));
        assert_eq!(classifier.classify(&err), FailureKind::Auth);
    }

    #[test]
    fn test_declared_types() {
        let classifier = DefaultClassifier::new()
            .auth::<TokenExpired>()
            .fatal::<DeviceRemoved>();

        assert_eq!(
            classifier.classify(&anyhow::Error::new(TokenExpired)),
            FailureKind::Auth
        );
        assert_eq!(
            classifier.classify(&anyhow::Error::new(DeviceRemoved)),
            FailureKind::Fatal
        );
    }

    #[test]
    fn test_matches_through_context() {
        let classifier = DefaultClassifier::new().auth::<TokenExpired>();
        let err = Err::<(), _>(TokenExpired)
            .context("polling thermostat")
            .unwrap_err();
        assert_eq!(classifier.classify(&err), FailureKind::Auth);
    }

    #[test]
    fn test_closure_classifier() {
        let classifier = |err: &anyhow::Error| {
            if err.to_string().contains("403") {
                FailureKind::Auth
            } else {
                FailureKind::Transient
            }
        };
        assert_eq!(
            classifier.classify(&anyhow::anyhow!("HTTP 403")),
            FailureKind::Auth
        );
        assert_eq!(
            classifier.classify(&anyhow::anyhow!("HTTP 500")),
            FailureKind::Transient
        );
    }
}
