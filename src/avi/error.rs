use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

macro_rules! static_regex {
    ($pattern:expr) => {
        LazyLock::new(|| {
            Regex::new($pattern)
                .unwrap_or_else(|e| panic!("static regex {:?} failed to compile: {e}", $pattern))
        })
    };
}

static NOT_FOUND: LazyLock<Regex> = static_regex!(r"No object of type \S+ with name .*is found");
static USER_NOT_FOUND: LazyLock<Regex> =
    static_regex!(r"No object of type user with name .*is found");
static ROLE_NOT_FOUND: LazyLock<Regex> =
    static_regex!(r"No object of type role with name .*is found");
static ALREADY_EXISTS: LazyLock<Regex> = static_regex!(r"with this (Username|Name) already exist");

/// Errors returned by the AVI REST façade.
#[derive(Debug, Error)]
pub enum AviError {
    /// Transport failure talking to the controller.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The controller answered with a non-success status.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// A get-by-name query returned no results.
    #[error("No object of type {kind} with name {name} is found")]
    NotFound { kind: String, name: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to (de)serialize AVI object: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Login to AVI controller failed: {0}")]
    Login(String),

    #[error("AVI object of type {0} has no uuid")]
    MissingUuid(String),
}

pub type AviResult<T> = std::result::Result<T, AviError>;

impl AviError {
    pub fn is_not_found(&self) -> bool {
        match self {
            AviError::NotFound { .. } => true,
            AviError::Api { status: 404, .. } => true,
            other => NOT_FOUND.is_match(&other.to_string()),
        }
    }

    pub fn is_user_not_found(&self) -> bool {
        USER_NOT_FOUND.is_match(&self.to_string())
    }

    pub fn is_role_not_found(&self) -> bool {
        ROLE_NOT_FOUND.is_match(&self.to_string())
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            AviError::Api { status: 409, .. } => true,
            AviError::Api { message, .. } => ALREADY_EXISTS.is_match(message),
            _ => false,
        }
    }

    /// Concurrent modification reported by the controller
    pub fn is_conflict(&self) -> bool {
        matches!(self, AviError::Api { status: 412, .. })
            || matches!(self, AviError::Api { message, .. } if message.contains("Concurrent Update Error"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_sentinels_match_message_text() {
        let user = AviError::NotFound {
            kind: "user".into(),
            name: "c1-default-ako-user".into(),
        };
        assert!(user.is_not_found());
        assert!(user.is_user_not_found());
        assert!(!user.is_role_not_found());

        let role = AviError::Api {
            status: 400,
            message: "No object of type role with name ako-essential-role is found".into(),
        };
        assert!(role.is_not_found());
        assert!(role.is_role_not_found());
        assert!(!role.is_user_not_found());
    }

    #[test]
    fn already_exists_matches_user_and_role_forms() {
        let user = AviError::Api {
            status: 400,
            message: "User with this Username already exist.".into(),
        };
        assert!(user.is_already_exists());
        let role = AviError::Api {
            status: 400,
            message: "Role with this Name already exist.".into(),
        };
        assert!(role.is_already_exists());
        let other = AviError::Api {
            status: 400,
            message: "Invalid tenant".into(),
        };
        assert!(!other.is_already_exists());
        assert!(!other.is_not_found());
    }

    #[test]
    fn conflict_from_status_or_message() {
        assert!(AviError::Api { status: 412, message: String::new() }.is_conflict());
        assert!(
            AviError::Api {
                status: 400,
                message: "Concurrent Update Error".into()
            }
            .is_conflict()
        );
        assert!(!AviError::Api { status: 500, message: String::new() }.is_conflict());
    }
}
