//! Remote console credentials
//!
//! Keys are stored as salted SHA-256 digests. The three default keys are
//! derived from the rcon passwords in [`LiveConfig`] and can be replaced at
//! runtime; named keys are managed through the `auth_*` console commands.
//!
//! [`LiveConfig`]: crate::config::LiveConfig

use log::info;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

pub const SALT_SIZE: usize = 16;
pub const DEFAULT_ADMIN: &str = "default_admin";
pub const DEFAULT_MOD: &str = "default_mod";
pub const DEFAULT_HELPER: &str = "default_helper";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum AuthLevel {
    #[default]
    None,
    Helper,
    Moderator,
    Admin,
}

impl AuthLevel {
    pub fn from_name(name: &str) -> Option<AuthLevel> {
        match name {
            "admin" | "3" => Some(AuthLevel::Admin),
            "mod" | "moderator" | "2" => Some(AuthLevel::Moderator),
            "helper" | "1" => Some(AuthLevel::Helper),
            _ => None,
        }
    }
}

impl fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthLevel::None => write!(f, "none"),
            AuthLevel::Helper => write!(f, "helper"),
            AuthLevel::Moderator => write!(f, "mod"),
            AuthLevel::Admin => write!(f, "admin"),
        }
    }
}

#[derive(Debug, Clone)]
struct AuthKey {
    ident: String,
    hash: [u8; 32],
    salt: [u8; SALT_SIZE],
    level: AuthLevel,
}

fn hash_password(password: &str, salt: &[u8; SALT_SIZE]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt);
    hasher.finalize().into()
}

fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Ordered key list. Key indices are handed out to logged in clients, so
/// removing a key shifts the indices of every later key down by one.
#[derive(Debug, Default)]
pub struct AuthManager {
    keys: Vec<AuthKey>,
}

impl AuthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces the default keys. An empty password removes the
    /// key for that level.
    pub fn set_defaults(&mut self, admin: &str, moderator: &str, helper: &str) -> Vec<usize> {
        let mut removed = Vec::new();
        for (ident, password, level) in [
            (DEFAULT_ADMIN, admin, AuthLevel::Admin),
            (DEFAULT_MOD, moderator, AuthLevel::Moderator),
            (DEFAULT_HELPER, helper, AuthLevel::Helper),
        ] {
            if password.is_empty() {
                removed.extend(self.remove_key(ident));
            } else if self.update_key(ident, password, level).is_none() {
                self.add_key(ident, password, level);
            }
        }
        removed
    }

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn find_key(&self, ident: &str) -> Option<usize> {
        self.keys.iter().position(|key| key.ident == ident)
    }

    /// Adds a key, returning its index, or `None` if the ident is taken
    pub fn add_key(&mut self, ident: &str, password: &str, level: AuthLevel) -> Option<usize> {
        let salt = random_salt();
        self.add_key_hash(ident, hash_password(password, &salt), salt, level)
    }

    pub fn add_key_hash(
        &mut self,
        ident: &str,
        hash: [u8; 32],
        salt: [u8; SALT_SIZE],
        level: AuthLevel,
    ) -> Option<usize> {
        if ident.is_empty() || self.find_key(ident).is_some() {
            return None;
        }
        self.keys.push(AuthKey {
            ident: ident.to_string(),
            hash,
            salt,
            level,
        });
        info!("added key '{}' with level {}", ident, level);
        Some(self.keys.len() - 1)
    }

    /// Parses the hex encoded digest and salt of `auth_add_p`
    pub fn add_key_hex(&mut self, ident: &str, hash: &str, salt: &str, level: AuthLevel) -> Result<usize, String> {
        let hash: [u8; 32] = hex::decode(hash)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| "hash must be 64 hex characters".to_string())?;
        let salt: [u8; SALT_SIZE] = hex::decode(salt)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| format!("salt must be {} hex characters", SALT_SIZE * 2))?;
        self.add_key_hash(ident, hash, salt, level)
            .ok_or_else(|| format!("ident '{}' already exists", ident))
    }

    /// Removes a key and returns the index it had
    pub fn remove_key(&mut self, ident: &str) -> Option<usize> {
        let index = self.find_key(ident)?;
        self.keys.remove(index);
        info!("removed key '{}'", ident);
        Some(index)
    }

    /// Sets a new password and level, generating a fresh salt
    pub fn update_key(&mut self, ident: &str, password: &str, level: AuthLevel) -> Option<usize> {
        let index = self.find_key(ident)?;
        let salt = random_salt();
        let key = &mut self.keys[index];
        key.salt = salt;
        key.hash = hash_password(password, &salt);
        key.level = level;
        Some(index)
    }

    pub fn check_key(&self, index: usize, password: &str) -> bool {
        self.keys
            .get(index)
            .is_some_and(|key| hash_password(password, &key.salt) == key.hash)
    }

    pub fn key_level(&self, index: usize) -> AuthLevel {
        self.keys.get(index).map_or(AuthLevel::None, |key| key.level)
    }

    pub fn key_ident(&self, index: usize) -> Option<&str> {
        self.keys.get(index).map(|key| key.ident.as_str())
    }

    /// Resolves a login. Without a name the password is matched against the
    /// default keys, highest level first.
    pub fn login(&self, name: &str, password: &str) -> Option<usize> {
        if name.is_empty() {
            return [DEFAULT_ADMIN, DEFAULT_MOD, DEFAULT_HELPER]
                .into_iter()
                .filter_map(|ident| self.find_key(ident))
                .find(|&index| self.check_key(index, password));
        }
        self.find_key(name).filter(|&index| self.check_key(index, password))
    }

    pub fn list(&self) -> Vec<String> {
        self.keys
            .iter()
            .map(|key| format!("{} {} {}", key.ident, key.level, hex::encode(key.salt)))
            .collect()
    }
}
