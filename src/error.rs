/// Error classification for outbound delivery calls.
///
/// Categories:
/// - Network: transport never reached the provider (timeout, reset,
///   DNS failure); always retryable
/// - Http: the provider answered with an error status; 429 and 5xx
///   are retryable, other 4xx are permanent
/// - Invalid: a request the provider will never accept, raised to
///   the caller and never deferred
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl DeliveryError {
    /// Returns true if the failure is transient and the operation
    /// belongs in the outbox.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Network(_) => true,
            DeliveryError::Http { status, .. } => *status == 429 || (500..=599).contains(status),
            DeliveryError::Invalid(_) => false,
        }
    }

    /// The edit/delete target no longer exists on the provider side.
    /// The stale content is already gone, so retrying is pointless.
    pub fn is_target_gone(&self) -> bool {
        match self {
            DeliveryError::Http { body, .. } => {
                let low = body.to_lowercase();
                low.contains("message to edit not found")
                    || low.contains("message to delete not found")
                    || low.contains("message can't be edited")
                    || low.contains("message_id_invalid")
            }
            _ => false,
        }
    }

    /// An edit replaying content identical to what is already shown.
    /// Providers reject these; the desired state is already in place.
    pub fn is_noop_edit(&self) -> bool {
        match self {
            DeliveryError::Http { body, .. } => {
                body.to_lowercase().contains("message is not modified")
            }
            _ => false,
        }
    }
}

/// Allows `?` to convert `DeliveryError` into the `Result<T, String>`
/// style used by callers that only need a printable failure.
impl From<DeliveryError> for String {
    fn from(err: DeliveryError) -> String {
        err.to_string()
    }
}
