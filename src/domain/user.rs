//! User account — balance owner and API-key holder (spec.md §3.1).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Operator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "user" => Some(Role::User),
            "operator" => Some(Role::Operator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub balance: Decimal,
    pub total_spent: Decimal,
    #[serde(skip_serializing)]
    pub api_key_digest: Option<String>,
    pub failed_auth_count: u32,
    pub account_locked: bool,
    pub active: bool,
    pub version: i64,
}

impl User {
    pub fn can_transact(&self) -> bool {
        self.active && !self.account_locked
    }
}
