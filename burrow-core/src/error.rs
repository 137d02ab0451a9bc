//! Error types shared by the gateway and the agent.

use std::fmt;

/// Error categories for the tunnel system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Token missing, invalid, revoked or expired.
    Authentication,
    /// Frame decode failure or unexpected frame kind.
    Protocol,
    /// Unexpected EOF or I/O failure on the duplex stream.
    Transport,
    /// A waiter was resolved because its session was torn down.
    Upstream,
    /// A waiter was not resolved before its deadline.
    Timeout,
    /// Unknown tunnel id or malformed public URL.
    Routing,
    /// Everything else, including id-space exhaustion.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Authentication => write!(f, "authentication"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Upstream => write!(f, "upstream"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Routing => write!(f, "routing"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

/// A tunnel error with category and optional cause.
#[derive(Debug)]
pub struct TunnelError {
    pub category: ErrorCategory,
    pub message: String,
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TunnelError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Whether the condition may clear on its own; agents reconnect on these.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Transport | ErrorCategory::Timeout
        )
    }

    /// The HTTP status the gateway reports to a public caller for this error.
    pub fn http_status(&self) -> u16 {
        match self.category {
            ErrorCategory::Authentication => 401,
            ErrorCategory::Protocol => 400,
            ErrorCategory::Transport => 502,
            ErrorCategory::Upstream => 502,
            ErrorCategory::Timeout => 504,
            ErrorCategory::Routing => 404,
            ErrorCategory::Internal => 500,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Authentication, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Protocol, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transport, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Upstream, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn routing(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Routing, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, message)
    }
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)?;
        if let Some(ref cause) = self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Result type using TunnelError.
pub type TunnelResult<T> = Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category_and_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = TunnelError::transport("stream failed").with_cause(io);

        let display = err.to_string();
        assert!(display.contains("[transport]"));
        assert!(display.contains("stream failed"));
        assert!(display.contains("reset by peer"));
    }

    #[test]
    fn retryable_categories() {
        assert!(TunnelError::transport("x").is_retryable());
        assert!(TunnelError::timeout("x").is_retryable());
        assert!(!TunnelError::auth("x").is_retryable());
        assert!(!TunnelError::protocol("x").is_retryable());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(TunnelError::routing("x").http_status(), 404);
        assert_eq!(TunnelError::upstream("x").http_status(), 502);
        assert_eq!(TunnelError::timeout("x").http_status(), 504);
        assert_eq!(TunnelError::internal("x").http_status(), 500);
    }
}
