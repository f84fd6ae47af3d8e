//! Channel membership entity definitions

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMember {
    pub channel_id: i64,
    pub user_id: i64,
    pub role: MemberRole,
    pub joined_at: String,
}

impl ChannelMember {
    pub fn is_admin(&self) -> bool {
        self.role == MemberRole::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Member,
    Admin,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Member => "member",
            MemberRole::Admin => "admin",
        }
    }
}

impl From<&str> for MemberRole {
    fn from(s: &str) -> Self {
        match s {
            "admin" => MemberRole::Admin,
            _ => MemberRole::Member,
        }
    }
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
