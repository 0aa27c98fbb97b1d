//! The seam between this crate and whatever runs inference.
//!
//! `lore-core` never chooses what to summarise or curate; it builds a prompt
//! and hands it to a `ModelClient`. The distiller/curator prompt *text* is a
//! configuration artefact supplied by the caller, not authored here.

use std::future::Future;
use std::pin::Pin;

/// A dispatch failure from the external model collaborator.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// The call exceeded its wall-clock deadline.
    #[error("model call timed out")]
    Timeout,
    /// The provider returned an error.
    #[error("model call failed: {0}")]
    Provider(String),
}

/// Result alias for this module.
pub type Result<T> = std::result::Result<T, ModelError>;

/// A hidden child session used to dispatch distillation/curator prompts
/// without polluting a parent session's history or calibration state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerSessionId(pub String);

impl WorkerSessionId {
    /// Derive a worker session id for a given parent session and purpose.
    pub fn for_parent(parent_session_id: &str, purpose: &str) -> Self {
        Self(format!("lore-worker:{purpose}:{parent_session_id}"))
    }
}

/// Dispatches a prompt to an external model and returns its raw text response.
///
/// Implementations own provider selection, retries, and the wall-clock
/// deadline (120s is typical); a timed-out call should resolve to
/// `Err(ModelError::Timeout)` rather than block the caller indefinitely, so
/// the distiller can treat it as "no observation" and retry next idle.
pub trait ModelClient: Send + Sync {
    /// Dispatch `prompt` under `session`, returning the model's raw text.
    fn dispatch<'a>(
        &'a self,
        session: &'a WorkerSessionId,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// In-memory `ModelClient` stub for tests: returns queued canned responses.
    pub struct StubModelClient {
        responses: Mutex<VecDeque<String>>,
    }

    impl StubModelClient {
        pub fn new(responses: Vec<String>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    impl ModelClient for StubModelClient {
        fn dispatch<'a>(
            &'a self,
            _session: &'a WorkerSessionId,
            _prompt: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
            Box::pin(async move {
                let mut responses = self.responses.lock().unwrap();
                responses
                    .pop_front()
                    .ok_or_else(|| ModelError::Provider("stub exhausted".to_string()))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StubModelClient;
    use super::*;

    #[tokio::test]
    async fn stub_returns_queued_responses_in_order() {
        let client = StubModelClient::new(vec!["first".to_string(), "second".to_string()]);
        let session = WorkerSessionId::for_parent("sess-1", "distill");
        assert_eq!(client.dispatch(&session, "p").await.unwrap(), "first");
        assert_eq!(client.dispatch(&session, "p").await.unwrap(), "second");
        assert!(client.dispatch(&session, "p").await.is_err());
    }

    #[test]
    fn worker_session_id_is_namespaced_by_purpose() {
        let a = WorkerSessionId::for_parent("sess-1", "distill");
        let b = WorkerSessionId::for_parent("sess-1", "curate");
        assert_ne!(a, b);
    }
}
