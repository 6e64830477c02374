use thiserror::Error;

/// Errors raised by a browser driver.
///
/// Ordinary action failures are not errors; they come back inside
/// `ActionResult::error`. Only the variants reported by [`DriverError::is_fatal`]
/// mean the session can no longer be used.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The browser connection is gone.
    #[error("browser disconnected: {0}")]
    Disconnected(String),

    /// The browser process died.
    #[error("browser crashed: {0}")]
    Crashed(String),

    /// A protocol-level call failed but the session is still alive.
    #[error("browser protocol error: {0}")]
    Protocol(String),

    /// A driver call did not complete in time.
    #[error("browser call timed out after {0}ms")]
    Timeout(u64),

    #[error("element {0} not found")]
    ElementNotFound(u32),
}

impl DriverError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Disconnected(_) | DriverError::Crashed(_))
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

/// Errors raised by the decision oracle or progress matcher.
#[derive(Debug, Error)]
pub enum OracleError {
    /// The model provider rejected the call or could not be reached.
    #[error("oracle provider error: {0}")]
    Provider(String),

    /// The reply could not be parsed into a decision.
    #[error("malformed oracle reply: {0}")]
    Malformed(String),

    #[error("oracle returned no actions")]
    EmptyDecision,

    #[error("oracle call timed out after {0}ms")]
    Timeout(u64),
}

impl OracleError {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }
}

impl From<serde_json::Error> for OracleError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Errors raised while acquiring or releasing browser sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open browser session: {0}")]
    Open(#[source] DriverError),

    #[error("browser session {0} not found")]
    NotFound(String),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lost_sessions_are_fatal() {
        assert!(DriverError::Disconnected("socket closed".into()).is_fatal());
        assert!(DriverError::Crashed("sigsegv".into()).is_fatal());
        assert!(!DriverError::Timeout(500).is_fatal());
        assert!(!DriverError::ElementNotFound(3).is_fatal());
        assert!(!DriverError::protocol("bad frame").is_fatal());
    }

    #[test]
    fn json_errors_become_malformed() {
        let err: OracleError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, OracleError::Malformed(_)));
    }
}
