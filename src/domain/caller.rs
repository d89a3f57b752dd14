//! Usage: Authenticated caller record as resolved from an API key.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("admin") {
            Self::Admin
        } else {
            Self::User
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: u64,
    #[serde(default)]
    pub role: Role,
    pub credits: u64,
    #[serde(default)]
    pub plan_requests: u32,
    #[serde(default)]
    pub allow_overspend: bool,
    pub api_key: String,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// A caller with nothing left to spend is turned away before any upstream work.
    pub fn has_balance(&self) -> bool {
        self.credits > 0 || self.plan_requests > 0 || self.allow_overspend
    }
}
