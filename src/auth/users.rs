//! User-file validation: a JSON array of user records whose passwords are
//! SHA-256 hex digests, or HMAC-SHA-256 hex digests when a secret is
//! configured. Digest comparison is constant-time.

use super::{AuthFailure, AuthUser, Credentials};
use crate::error::{Error, Result};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One record from the user file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileUser {
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Email", default)]
    pub email: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Groups", default)]
    pub groups: Vec<String>,
    #[serde(rename = "Metadata", default)]
    pub metadata: HashMap<String, Value>,
}

impl FileUser {
    /// The record handed back to handlers; the password digest never leaves
    /// this module.
    fn to_user_value(&self) -> Value {
        json!({
            "Username": self.username,
            "Name": self.name,
            "Email": self.email,
            "Groups": self.groups,
            "Metadata": self.metadata,
        })
    }
}

/// Byte comparison that does not short-circuit on the first mismatch.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Hash a cleartext password the way the user file stores it.
pub fn hash_password(cleartext: &str, hmac_secret: Option<&str>) -> String {
    match hmac_secret {
        None => hex::encode(Sha256::digest(cleartext.as_bytes())),
        Some(secret) => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
            mac.update(cleartext.as_bytes());
            hex::encode(mac.finalize().into_bytes())
        }
    }
}

/// The loaded user file plus its validation policy.
#[derive(Debug, Clone)]
pub struct UserFileStore {
    path: PathBuf,
    users: Vec<FileUser>,
    hmac_secret: Option<String>,
    /// When non-empty, only these usernames may authenticate.
    allowed_users: Vec<String>,
    /// When non-empty, a user must belong to one of these groups.
    allowed_groups: Vec<String>,
}

impl UserFileStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::config(format!("cannot read user file {}: {e}", path.display())))?;
        let users: Vec<FileUser> = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("invalid user file {}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), users = users.len(), "user file loaded");
        Ok(Self {
            path,
            users,
            hmac_secret: None,
            allowed_users: Vec::new(),
            allowed_groups: Vec::new(),
        })
    }

    /// Construct a store from in-memory records.
    pub fn from_users(users: Vec<FileUser>) -> Self {
        Self {
            path: PathBuf::new(),
            users,
            hmac_secret: None,
            allowed_users: Vec::new(),
            allowed_groups: Vec::new(),
        }
    }

    pub fn with_hmac_secret(mut self, secret: impl Into<String>) -> Self {
        self.hmac_secret = Some(secret.into());
        self
    }

    pub fn restrict_users(mut self, users: Vec<String>) -> Self {
        self.allowed_users = users;
        self
    }

    pub fn restrict_groups(mut self, groups: Vec<String>) -> Self {
        self.allowed_groups = groups;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn find(&self, username: &str) -> Option<&FileUser> {
        self.users.iter().find(|u| u.username == username)
    }

    /// Check a username/password pair and return the user record.
    pub fn check(&self, username: &str, password: &str) -> std::result::Result<AuthUser, AuthFailure> {
        let presented = hash_password(password, self.hmac_secret.as_deref());
        let user = self.find(username).ok_or_else(AuthFailure::invalid_credentials)?;

        if !constant_time_eq(presented.as_bytes(), user.password.as_bytes()) {
            return Err(AuthFailure::invalid_credentials());
        }
        if !self.allowed_users.is_empty() && !self.allowed_users.contains(&user.username) {
            return Err(AuthFailure::forbidden("user is not authorised to access this site"));
        }
        if !self.allowed_groups.is_empty()
            && !user.groups.iter().any(|g| self.allowed_groups.contains(g))
        {
            return Err(AuthFailure::forbidden("user is not in an authorised group"));
        }
        Ok(AuthUser::new(user.to_user_value()))
    }

    /// Validator closure over this store, for username/password schemes.
    pub fn validator(self) -> super::Validator {
        std::sync::Arc::new(move |creds: &Credentials| match creds {
            Credentials::UserPass { username, password } => self.check(username, password),
            _ => Err(AuthFailure::new(400, "expected username and password credentials")),
        })
    }
}
