//! Error types for Deckhand

use crate::cluster::ClusterApiError;
use crate::crypto::CipherError;
use thiserror::Error;

/// Result type for Deckhand operations
pub type Result<T> = std::result::Result<T, DeckhandError>;

/// Deckhand error types
#[derive(Error, Debug)]
pub enum DeckhandError {
    #[error("Cluster {0} not found")]
    ClusterNotFound(String),

    #[error("Service not found for task {0}")]
    ServiceNotFound(String),

    #[error("Cluster not found for application {0}")]
    ApplicationClusterMissing(String),

    #[error("Unknown task payload for task {task_id}: {reason}")]
    UnknownPayload { task_id: String, reason: String },

    #[error("Failed to decrypt data: {0}")]
    Decryption(#[from] CipherError),

    #[error("Cluster API error: {0}")]
    ClusterApi(#[from] ClusterApiError),

    #[error("Invalid ingress URL {url}: {reason}")]
    IngressUrlInvalid { url: String, reason: String },

    #[error("Failed to delete ingress {name}: {source}")]
    IngressDeleteFailed {
        name: String,
        #[source]
        source: ClusterApiError,
    },

    #[error("Failed to decrypt env variable {key}: {source}")]
    EnvDecryptFailure {
        key: String,
        #[source]
        source: CipherError,
    },

    #[error("Invalid kubeconfig: {0}")]
    Kubeconfig(String),

    #[error("Pod {pod} not found in namespace {namespace}")]
    PodNotFound { pod: String, namespace: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid task transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("reconciliation timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DeckhandError {
    /// Whether the error is logged and skipped instead of failing a run
    pub fn is_non_fatal(&self) -> bool {
        matches!(
            self,
            DeckhandError::IngressUrlInvalid { .. }
                | DeckhandError::IngressDeleteFailed { .. }
                | DeckhandError::EnvDecryptFailure { .. }
        )
    }
}

impl From<sqlx::Error> for DeckhandError {
    fn from(err: sqlx::Error) -> Self {
        DeckhandError::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_fatal_kinds() {
        let ingress = DeckhandError::IngressUrlInvalid {
            url: "::".to_string(),
            reason: "relative URL without a base".to_string(),
        };
        assert!(ingress.is_non_fatal());

        let env = DeckhandError::EnvDecryptFailure {
            key: "API_TOKEN".to_string(),
            source: CipherError::InvalidHex,
        };
        assert!(env.is_non_fatal());

        let delete = DeckhandError::IngressDeleteFailed {
            name: "web".to_string(),
            source: ClusterApiError::with_status(500, "InternalError", "etcd unavailable"),
        };
        assert!(delete.is_non_fatal());

        assert!(!DeckhandError::ServiceNotFound("t1".to_string()).is_non_fatal());
        assert!(!DeckhandError::from(ClusterApiError::transport("connection refused")).is_non_fatal());
    }

    #[test]
    fn test_decryption_message_mentions_key() {
        let err = DeckhandError::from(CipherError::WrongKey);
        assert!(err.to_string().contains("ENCRYPTION_KEY"));
    }
}
