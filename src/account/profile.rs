use tracing::info;

use crate::account::{SessionStore, User, UserUpdate};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileFields {
    pub name: String,
}

/// Profile edits for the signed-in user.
pub struct Profile<'a> {
    store: &'a SessionStore,
}

impl<'a> Profile<'a> {
    pub fn new(store: &'a SessionStore) -> Self {
        Self { store }
    }

    /// Saves the trimmed name. Whitespace-only names are rejected.
    pub async fn save(&self, fields: ProfileFields) -> Result<User> {
        let name = fields.name.trim();
        if name.is_empty() {
            return Err(Error::validation("Name cannot be empty"));
        }

        let user = self
            .store
            .update_user(UserUpdate {
                name: Some(name.to_string()),
                ..UserUpdate::default()
            })
            .await?;

        info!("Profile saved for {}", user.email);
        Ok(user)
    }
}
