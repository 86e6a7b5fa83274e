//! Authenticated principals acting on the subsystem.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Owner of a survey and holder of its credential.
    Owner,
    /// Organization reviewer allowed to approve or reject recovery.
    Reviewer,
    /// Platform operator: key custody ceremonies and destruction.
    Operator,
    /// Internal processes such as the time-delay processor.
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Reviewer => "reviewer",
            Role::Operator => "operator",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Some(Role::Owner),
            "reviewer" => Some(Role::Reviewer),
            "operator" => Some(Role::Operator),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// An opaque principal id plus the role it acts in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// The time-delay processor.
    pub fn system() -> Self {
        Self::new("system:recovery-processor", Role::System)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role.as_str(), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parse_is_case_insensitive() {
        assert_eq!(Role::parse("Reviewer"), Some(Role::Reviewer));
        assert_eq!(Role::parse(" owner "), Some(Role::Owner));
        assert_eq!(Role::parse("admin"), None);
    }

    #[test]
    fn display_includes_role() {
        assert_eq!(Actor::new("u-1", Role::Owner).to_string(), "owner:u-1");
    }
}
