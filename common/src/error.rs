use uuid::Uuid;

/// Fault taxonomy surfaced to callers of the engine. The API layer maps
/// these onto HTTP responses via [`crate::response::fault`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} \"{id}\" not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{target_type} {target} is busy: {current}")]
    ActionInProgress {
        target_type: &'static str,
        target: Uuid,
        current: String,
    },

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Stable tag for logs and wire payloads.
    pub fn tag(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NotFound",
            Error::Invalid(_) => "Invalid",
            Error::Forbidden(_) => "Forbidden",
            Error::ActionInProgress { .. } => "ActionInProgress",
            Error::NotSupported(_) => "NotSupported",
            Error::Conflict(_) => "Conflict",
            Error::Internal(_) => "Internal",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_stable() {
        assert_eq!(Error::not_found("cluster", "c1").tag(), "NotFound");
        assert_eq!(Error::Invalid("bad sort key".into()).tag(), "Invalid");
        assert_eq!(
            Error::Internal(anyhow::anyhow!("boom")).tag(),
            "Internal"
        );
    }

    #[test]
    fn display_includes_target() {
        let e = Error::ActionInProgress {
            target_type: "cluster",
            target: Uuid::nil(),
            current: "CLUSTER_SCALE".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("cluster"));
        assert!(msg.contains("CLUSTER_SCALE"));
    }
}
