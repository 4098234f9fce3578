pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum DcronError {
    #[error("job '{name}' is already registered")]
    DuplicateJob { name: String },

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("invalid namespace '{namespace}': use only [A-Za-z0-9_-]")]
    InvalidNamespace { namespace: String },

    #[error("liveness backend unavailable during {operation}: {source}")]
    BackendUnavailable {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("connect error: {0}")]
    Connect(String),
}

impl DcronError {
    pub(crate) fn backend<E>(operation: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::BackendUnavailable {
            operation,
            source: Box::new(source),
        }
    }

    /// True for the failures a caller fixes by changing its inputs rather than retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::DuplicateJob { .. } | Self::InvalidSchedule { .. } | Self::InvalidNamespace { .. }
        )
    }
}

/// Namespaces become key segments in every backend, so they are restricted to
/// characters that are legal in NATS KV keys and cannot collide with the `:`
/// and `.` separators.
pub(crate) fn validate_namespace(namespace: &str) -> Result<(), DcronError> {
    let valid = !namespace.is_empty()
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(DcronError::InvalidNamespace {
            namespace: namespace.to_string(),
        })
    }
}
