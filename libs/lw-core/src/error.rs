use thiserror::Error;

/// The transient/permanent taxonomy every outbound call and handler in
/// this core classifies its failures into. The Job Runner uses this
/// classification, not the concrete error type, to decide whether to
/// reschedule a job or move it to the failure sink.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Network faults, timeouts, 408/429/5xx from a dependency. The job
    /// is rescheduled per the queue's retry policy.
    #[error("transient error [{code}]: {message}")]
    Transient {
        code: String,
        message: String,
        backoff_ms: Option<u64>,
    },

    /// 4xx (other than 429), unrecoverable schema failures, missing
    /// required upstream fields. The job moves to the failure sink
    /// immediately; no redelivery is attempted.
    #[error("permanent error [{code}]: {message}")]
    Permanent { code: String, message: String },

    /// Malformed or incomplete webhook payload, rejected before staging.
    #[error("validation error: {0}")]
    Validation(String),

    /// Signature verification failed at the HTTP boundary; never staged.
    #[error("signature verification failed")]
    Signature,
}

impl PipelineError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>, backoff_ms: Option<u64>) -> Self {
        PipelineError::Transient {
            code: code.into(),
            message: message.into(),
            backoff_ms,
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Permanent {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transient { .. })
    }

    pub fn code(&self) -> &str {
        match self {
            PipelineError::Transient { code, .. } => code,
            PipelineError::Permanent { code, .. } => code,
            PipelineError::Validation(_) => "validation_error",
            PipelineError::Signature => "signature_error",
        }
    }

    /// Classifies an HTTP status code from an outbound dependency per the
    /// taxonomy in spec §7: 429 and any 5xx are transient, every other
    /// 4xx is permanent.
    pub fn from_http_status(code: &str, status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if status == 429 {
            PipelineError::transient(code, format!("rate limited: {body}"), None)
        } else if (500..600).contains(&status) {
            PipelineError::transient(code, format!("server error {status}: {body}"), None)
        } else {
            PipelineError::permanent(code, format!("client error {status}: {body}"))
        }
    }
}

/// Result of running a handler against a staged event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Ignored(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_http_status_classifies_429_and_5xx_as_transient() {
        assert!(PipelineError::from_http_status("crm", 429, "slow down").is_transient());
        assert!(PipelineError::from_http_status("crm", 503, "down").is_transient());
    }

    #[test]
    fn from_http_status_classifies_other_4xx_as_permanent() {
        let err = PipelineError::from_http_status("crm", 404, "not found");
        assert!(!err.is_transient());
        assert!(matches!(err, PipelineError::Permanent { .. }));
    }

    #[test]
    fn code_accessor_returns_constant_codes_for_validation_and_signature() {
        assert_eq!(PipelineError::validation("bad").code(), "validation_error");
        assert_eq!(PipelineError::Signature.code(), "signature_error");
    }
}
