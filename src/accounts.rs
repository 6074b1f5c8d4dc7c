use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::store::Store;

const MAX_USERNAME_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
}

pub fn validate_username(username: &str) -> Result<&str, ChatError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ChatError::Invalid("username must not be empty".to_string()));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.');
    if username.len() > MAX_USERNAME_LEN || !username.chars().all(allowed) {
        return Err(ChatError::Invalid(format!("invalid username {username:?}")));
    }
    Ok(username)
}

pub fn register(store: &Store, request: &Credentials) -> Result<Credentials, ChatError> {
    let username = validate_username(&request.username)?;
    if !store.create_user(username)? {
        return Err(ChatError::UsernameTaken(username.to_string()));
    }
    log::info!("registered user {username}");
    Ok(Credentials {
        username: username.to_string(),
    })
}

pub fn login(store: &Store, request: &Credentials) -> Result<Credentials, ChatError> {
    let username = validate_username(&request.username)?;
    if !store.user_exists(username)? {
        return Err(ChatError::UnknownUser(username.to_string()));
    }
    log::info!("user {username} logged in");
    Ok(Credentials {
        username: username.to_string(),
    })
}
