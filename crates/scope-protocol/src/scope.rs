//! Scope kinds and the host objects scopes are keyed by.

use serde::{Deserialize, Serialize};

use crate::host::{Request, Session};

/// The scopes the coordinator drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Request,
    Session,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Session => "session",
        }
    }
}

impl std::fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host object a scope starts or ends against.
///
/// `Detached` is used for requests the host delivered without an event
/// object and for synthetic requests.
#[derive(Debug, Clone, Copy)]
pub enum ScopeKey<'a> {
    Detached,
    Request(&'a Request),
    Session(&'a Session),
}

impl<'a> ScopeKey<'a> {
    pub fn from_request(request: Option<&'a Request>) -> Self {
        request.map_or(Self::Detached, Self::Request)
    }

    /// Identifier of the keyed object, `"detached"` when there is none.
    pub fn describe(&self) -> String {
        match self {
            Self::Detached => "detached".into(),
            Self::Request(r) => format!("request:{}", r.id()),
            Self::Session(s) => format!("session:{}", s.id()),
        }
    }

    pub fn session_id(&self) -> Option<&'a str> {
        match *self {
            Self::Session(s) => Some(s.id()),
            _ => None,
        }
    }
}
