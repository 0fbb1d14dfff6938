//! Sign-in state and profile edits. These gate the chat view but never touch
//! the conversation itself.

pub mod profile;
pub mod session;

use serde::{Deserialize, Serialize};

pub use profile::{Profile, ProfileFields};
pub use session::{Session, SessionStore, UserUpdate};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl User {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, avatar_url: Option<String>) -> Self {
        self.avatar_url = avatar_url;
        self
    }
}
