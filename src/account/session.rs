use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::account::User;
use crate::app::config::AccountConfig;
use crate::error::{Error, Result};

/// Read-only view of who is signed in.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user: Option<User>,
    pub is_authenticated: bool,
}

impl Session {
    pub fn anonymous() -> Self {
        Self {
            user: None,
            is_authenticated: false,
        }
    }

    pub fn authenticated(user: User) -> Self {
        Self {
            user: Some(user),
            is_authenticated: true,
        }
    }
}

/// Partial user edit; `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSession {
    user: User,
    logged_in_at: DateTime<Utc>,
}

/// Persists the signed-in user to a JSON file with a fixed lifetime.
pub struct SessionStore {
    file: PathBuf,
    account: AccountConfig,
}

impl SessionStore {
    pub fn new(file: impl Into<PathBuf>, account: AccountConfig) -> Self {
        Self {
            file: file.into(),
            account,
        }
    }

    /// Current session. An expired or unreadable session file counts as
    /// signed out and is removed.
    pub async fn get(&self) -> Result<Session> {
        let Some(stored) = self.read().await? else {
            return Ok(Session::anonymous());
        };

        // A TTL too large to represent never expires.
        let expires_at = Duration::try_hours(self.account.session_ttl_hours)
            .and_then(|ttl| stored.logged_in_at.checked_add_signed(ttl));
        if let Some(expires_at) = expires_at.filter(|expires_at| Utc::now() >= *expires_at) {
            info!("Session for {} expired at {}", stored.user.email, expires_at);
            self.remove_file().await?;
            return Ok(Session::anonymous());
        }

        Ok(Session::authenticated(stored.user))
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        if email.trim() != self.account.demo_email || password != self.account.demo_password {
            warn!("Rejected sign-in for {}", email.trim());
            return Err(Error::unauthorized("Invalid credentials"));
        }

        let user = User::new(&self.account.display_name, &self.account.demo_email)
            .with_avatar(self.account.avatar_url.clone());
        self.write(&StoredSession {
            user: user.clone(),
            logged_in_at: Utc::now(),
        })
        .await?;

        info!("Signed in as {}", user.email);
        Ok(Session::authenticated(user))
    }

    pub async fn logout(&self) -> Result<()> {
        self.remove_file().await?;
        info!("Signed out");
        Ok(())
    }

    /// Merges `update` into the signed-in user, keeping the original sign-in time.
    pub async fn update_user(&self, update: UserUpdate) -> Result<User> {
        let session = self.get().await?;
        let mut stored = match (session.user, self.read().await?) {
            (Some(_), Some(stored)) => stored,
            _ => return Err(Error::unauthorized("Sign in to edit your profile")),
        };

        if let Some(name) = update.name {
            stored.user.name = name;
        }
        if let Some(email) = update.email {
            stored.user.email = email;
        }
        if let Some(avatar_url) = update.avatar_url {
            stored.user.avatar_url = Some(avatar_url);
        }

        self.write(&stored).await?;
        debug!("Updated stored user {}", stored.user.email);
        Ok(stored.user)
    }

    async fn read(&self) -> Result<Option<StoredSession>> {
        let content = match fs::read_to_string(&self.file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&content) {
            Ok(stored) => Ok(Some(stored)),
            Err(e) => {
                warn!("Discarding unreadable session file {:?}: {}", self.file, e);
                self.remove_file().await?;
                Ok(None)
            }
        }
    }

    async fn write(&self, stored: &StoredSession) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.file, serde_json::to_vec_pretty(stored)?).await?;
        Ok(())
    }

    async fn remove_file(&self) -> Result<()> {
        match fs::remove_file(&self.file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
