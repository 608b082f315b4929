//! The error taxonomy surfaced by the queue/worker/maintenance layers.
//!
//! [`CoreError`] is the boundary type between `mineru-db`'s
//! `anyhow::Result` internals and the rest of the crate. Callers that
//! need to render an HTTP response (the `mineru serve` facade) match on
//! [`CoreError::kind`] rather than the error message.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("principal {user_id} is not permitted to {action}")]
    PermissionDenied { user_id: String, action: String },

    #[error("task {0} is in a state that does not allow this operation")]
    Conflict(Uuid),

    #[error("task store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("engine reported a transient failure: {0}")]
    EngineTransient(String),

    #[error("engine reported a permanent failure: {0}")]
    EnginePermanent(String),

    #[error("task {0} exceeded the stale-retry budget")]
    StaleExceeded(Uuid),

    #[error("task {0} was cancelled")]
    Cancelled(Uuid),
}

impl CoreError {
    /// Stable machine-readable tag for this error, used as the `kind`
    /// field of the facade's JSON error body.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Conflict(_) => "conflict",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::EngineTransient(_) => "engine_transient",
            Self::EnginePermanent(_) => "engine_permanent",
            Self::StaleExceeded(_) => "stale_exceeded",
            Self::Cancelled(_) => "cancelled",
        }
    }

    /// Translate a store-layer `anyhow::Error` into a `CoreError`,
    /// distinguishing connectivity failures from other store errors.
    pub fn from_store_error(err: anyhow::Error) -> Self {
        if let Some(sqlx_err) = err.downcast_ref::<sqlx::Error>() {
            if matches!(
                sqlx_err,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ) {
                return Self::StoreUnavailable(sqlx_err.to_string());
            }
        }
        Self::StoreUnavailable(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_per_variant() {
        let id = Uuid::nil();
        assert_eq!(CoreError::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(CoreError::NotFound(id).kind(), "not_found");
        assert_eq!(
            CoreError::PermissionDenied {
                user_id: "u".into(),
                action: "a".into()
            }
            .kind(),
            "permission_denied"
        );
        assert_eq!(CoreError::Conflict(id).kind(), "conflict");
        assert_eq!(CoreError::StoreUnavailable("x".into()).kind(), "store_unavailable");
        assert_eq!(CoreError::EngineTransient("x".into()).kind(), "engine_transient");
        assert_eq!(CoreError::EnginePermanent("x".into()).kind(), "engine_permanent");
        assert_eq!(CoreError::StaleExceeded(id).kind(), "stale_exceeded");
        assert_eq!(CoreError::Cancelled(id).kind(), "cancelled");
    }

    #[test]
    fn from_store_error_wraps_generic_anyhow() {
        let err = anyhow::anyhow!("connection refused");
        let core = CoreError::from_store_error(err);
        assert_eq!(core.kind(), "store_unavailable");
    }
}
