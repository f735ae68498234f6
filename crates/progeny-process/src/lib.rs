use serde::{Deserialize, Serialize};

/// Expiry used when no worker timeout is configured (year 2223).
pub const NO_EXPIRY: i64 = 8_000_000_000;

/// One running worker, as persisted by the registry.
///
/// NOTE: Records are never updated in place. Termination deletes the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub identifier: String,
    pub session_name: String,
    pub port: u16,
    pub pid: u32,
    /// Unix seconds after which the worker may be reclaimed.
    pub expiry_timestamp: i64,
    /// Unix seconds at registration.
    pub created_at: i64,
}

impl WorkerRecord {
    pub fn age_secs(&self, now: i64) -> i64 {
        now.saturating_sub(self.created_at)
    }

    pub fn backend(&self) -> Backend {
        Backend {
            port: self.port,
            session_name: self.session_name.clone(),
        }
    }
}

/// Where the gateway relays a session's traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub port: u16,
    pub session_name: String,
}

/// Longest session name the gateway accepts in its routing cookie.
pub const MAX_SESSION_NAME_LEN: usize = 256;

/// Session names travel in a cookie and a URL path segment, so they are
/// limited to unreserved URL characters plus `@`.
pub fn is_valid_session_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_SESSION_NAME_LEN
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~' | b'@'))
}

/// How the fields of a [`Selector`] are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorMode {
    /// Any set field matches (OR).
    #[default]
    Any,
    /// Every set field must match (AND).
    All,
}

/// What `older_than` is measured against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgePolicy {
    /// Age since registration: `now - created_at > older_than`.
    #[default]
    Created,
    /// Time past expiry: `now - expiry_timestamp > older_than`.
    Expiry,
}

/// Filter over registry rows. Unset fields are ignored; an entirely unset
/// selector matches every row and is refused unless explicitly allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub older_than_secs: Option<u64>,
}

impl Selector {
    /// Matches everything. Only honoured with `allow_unsafe`.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn identifier(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            ..Self::default()
        }
    }

    pub fn session_name(session_name: impl Into<String>) -> Self {
        Self {
            session_name: Some(session_name.into()),
            ..Self::default()
        }
    }

    pub fn pid(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            ..Self::default()
        }
    }

    pub fn older_than(secs: u64) -> Self {
        Self {
            older_than_secs: Some(secs),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.identifier.is_none()
            && self.session_name.is_none()
            && self.port.is_none()
            && self.pid.is_none()
            && self.older_than_secs.is_none()
    }
}
