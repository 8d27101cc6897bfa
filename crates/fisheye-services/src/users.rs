//! User directory.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fisheye_protocol::PublicUser;
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::ServiceError;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";

/// A dashboard account.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    /// The attributes shown to the user's own realtime session.
    pub fn to_public(&self) -> PublicUser {
        PublicUser {
            id: self.id.to_string(),
            username: self.username.clone(),
            email: self.email.clone(),
            role: self.role.clone(),
        }
    }
}

/// In-memory user store keyed by id. Usernames and emails are unique.
#[derive(Default)]
pub struct UserDirectory {
    users: RwLock<HashMap<Uuid, User>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        username: &str,
        email: &str,
        role: &str,
    ) -> Result<User, ServiceError> {
        if username.is_empty() {
            return Err(ServiceError::InvalidInput("username must not be empty"));
        }
        let mut users = self.users.write();
        if users.values().any(|u| u.username == username) {
            return Err(ServiceError::Conflict(format!("username {username} already exists")));
        }
        if users.values().any(|u| u.email == email) {
            return Err(ServiceError::Conflict(format!("email {email} already exists")));
        }

        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            role: role.to_string(),
            created_at: Utc::now(),
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    pub fn get(&self, id: Uuid) -> Option<User> {
        self.users.read().get(&id).cloned()
    }

    pub fn is_admin(&self, id: Uuid) -> bool {
        self.get(id).is_some_and(|u| u.is_admin())
    }

    pub fn delete(&self, id: Uuid) -> bool {
        self.users.write().remove(&id).is_some()
    }

    pub fn count(&self) -> usize {
        self.users.read().len()
    }
}
