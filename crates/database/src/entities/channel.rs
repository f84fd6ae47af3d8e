//! Channel entity definitions

use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub creator_id: i64,
    pub created_at: String,
    pub visibility: Visibility,
}

impl Channel {
    pub fn is_private(&self) -> bool {
        self.visibility == Visibility::Private
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }

    pub fn from_private_flag(is_private: bool) -> Self {
        if is_private {
            Visibility::Private
        } else {
            Visibility::Public
        }
    }
}

impl FromStr for Visibility {
    type Err = String;

    /// Accepts the visibility names as well as the boolean spellings of an `is_private` flag.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" | "false" | "0" => Ok(Visibility::Public),
            "private" | "true" | "1" => Ok(Visibility::Private),
            other => Err(format!("unknown visibility '{other}'")),
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChannel {
    pub name: String,
    pub description: String,
    pub creator_id: i64,
    pub visibility: Visibility,
}

/// Metadata changes applied to a channel. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub visibility: Option<Visibility>,
}

impl ChannelUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.visibility.is_none()
    }

    pub fn apply_to(&self, channel: &mut Channel) {
        if let Some(name) = &self.name {
            channel.name = name.clone();
        }
        if let Some(description) = &self.description {
            channel.description = description.clone();
        }
        if let Some(visibility) = self.visibility {
            channel.visibility = visibility;
        }
    }
}
