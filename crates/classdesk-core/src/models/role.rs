use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Base path of the backend's auth router
pub const AUTH_BASE_PATH: &str = "/api/auth";

/// Account role. Decides which dashboard subtree a session may reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Student, Role::Teacher];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
        }
    }

    /// Landing route for this role; wrong-role navigation is bounced here.
    pub fn home_route(&self) -> &'static str {
        match self {
            Role::Student => "/student-dashboard",
            Role::Teacher => "/teacher-dashboard",
        }
    }

    /// Base path of the auth endpoints used when logging in as this role.
    /// Login is role-scoped in name only: both roles share one router.
    pub fn auth_base_path(&self) -> &'static str {
        AUTH_BASE_PATH
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown role '{}' (expected student or teacher)", self.0)
    }
}

impl std::error::Error for UnknownRole {}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}
