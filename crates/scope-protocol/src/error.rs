//! Scope error type and stable error codes.

use thiserror::Error;

/// Error codes logged and carried by [`ScopeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeErrorCode {
    // Coordinator errors
    RequestStart,
    RequestEnd,
    SessionStart,
    SessionEnd,
    ConversationDestroy,
    Bootstrap,

    // Collaborator errors
    InvalidState,
    Service,
    Config,
}

impl ScopeErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RequestStart => "SCOPE-1001",
            Self::SessionStart => "SCOPE-1002",
            Self::RequestEnd => "SCOPE-1003",
            Self::SessionEnd => "SCOPE-1004",
            Self::ConversationDestroy => "SCOPE-1005",
            Self::Bootstrap => "SCOPE-1006",
            Self::InvalidState => "SCOPE-2001",
            Self::Service => "SCOPE-2002",
            Self::Config => "SCOPE-3001",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "SCOPE-1001" => Some(Self::RequestStart),
            "SCOPE-1002" => Some(Self::SessionStart),
            "SCOPE-1003" => Some(Self::RequestEnd),
            "SCOPE-1004" => Some(Self::SessionEnd),
            "SCOPE-1005" => Some(Self::ConversationDestroy),
            "SCOPE-1006" => Some(Self::Bootstrap),
            "SCOPE-2001" => Some(Self::InvalidState),
            "SCOPE-2002" => Some(Self::Service),
            "SCOPE-3001" => Some(Self::Config),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScopeErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Failure raised by the coordinator or one of its collaborators.
#[derive(Debug, Clone, Error)]
#[error("Scope Error [{code}]: {message}")]
pub struct ScopeError {
    pub code: ScopeErrorCode,
    pub message: String,
    #[source]
    pub cause: Option<Box<ScopeError>>,
}

impl ScopeError {
    pub fn new(code: ScopeErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the collaborator failure that triggered this error.
    pub fn caused_by(mut self, cause: ScopeError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn request_start(message: impl Into<String>) -> Self {
        Self::new(ScopeErrorCode::RequestStart, message)
    }

    pub fn request_end(message: impl Into<String>) -> Self {
        Self::new(ScopeErrorCode::RequestEnd, message)
    }

    pub fn session_start(message: impl Into<String>) -> Self {
        Self::new(ScopeErrorCode::SessionStart, message)
    }

    pub fn session_end(message: impl Into<String>) -> Self {
        Self::new(ScopeErrorCode::SessionEnd, message)
    }

    pub fn conversation_destroy(message: impl Into<String>) -> Self {
        Self::new(ScopeErrorCode::ConversationDestroy, message)
    }

    pub fn bootstrap(message: impl Into<String>) -> Self {
        Self::new(ScopeErrorCode::Bootstrap, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ScopeErrorCode::InvalidState, message)
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self::new(ScopeErrorCode::Service, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ScopeErrorCode::Config, message)
    }

    /// The innermost cause in the chain (or `self` when there is none).
    pub fn root_cause(&self) -> &ScopeError {
        let mut current = self;
        while let Some(cause) = current.cause.as_deref() {
            current = cause;
        }
        current
    }
}
