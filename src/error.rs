use thiserror::Error;

/// The closed set of error kinds the core can surface, per the error-handling design.
///
/// Two kinds (`AlreadyExists`, `StateConflict`) are meant to be recovered locally by
/// callers that want find-or-create semantics; everything else is surfaced with the
/// originating entity/worker identifier in the message.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} '{key}' already exists")]
    AlreadyExists { entity: &'static str, key: String },

    #[error("state-predicated update on {entity} '{id}' affected zero rows (expected state '{expected_state}')")]
    StateConflict {
        entity: &'static str,
        id: String,
        expected_state: String,
    },

    #[error("runtime state drift on {entity} '{id}': {detail}")]
    RuntimeStateDrift {
        entity: &'static str,
        id: String,
        detail: String,
    },

    #[error("transient store error: {0}")]
    TransientStore(String),

    #[error("transient runtime error: {0}")]
    TransientRuntime(String),

    #[error("worker '{name}' has not checked in recently")]
    WorkerStalled { name: String },

    #[error("worker '{name}' address is missing")]
    WorkerAddressMissing { name: String },

    #[error("worker '{name}' is unknown")]
    WorkerUnknown { name: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn already_exists(entity: &'static str, key: impl Into<String>) -> Self {
        CoreError::AlreadyExists {
            entity,
            key: key.into(),
        }
    }

    pub fn state_conflict(
        entity: &'static str,
        id: impl Into<String>,
        expected_state: impl Into<String>,
    ) -> Self {
        CoreError::StateConflict {
            entity,
            id: id.into(),
            expected_state: expected_state.into(),
        }
    }

    /// True for the two kinds local callers are expected to recover from by
    /// re-reading or re-finding, per §7's policy section.
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::AlreadyExists { .. } | CoreError::StateConflict { .. }
        )
    }

    /// True for kinds that should be retried with backoff at the component boundary.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::TransientStore(_) | CoreError::TransientRuntime(_)
        )
    }
}

/// Classify a sqlx error into the taxonomy above. Connection resets and timeouts
/// become `TransientStore`; a unique-violation becomes `AlreadyExists` when the
/// caller supplies the entity/key context (see [`classify_unique_violation`]).
pub fn classify_sqlx_error(entity: &'static str, id: impl Into<String>, err: sqlx::Error) -> CoreError {
    let id = id.into();
    match &err {
        sqlx::Error::RowNotFound => CoreError::not_found(entity, id),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            CoreError::TransientStore(err.to_string())
        }
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            CoreError::already_exists(entity, id)
        }
        _ => CoreError::Other(anyhow::Error::new(err)),
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
