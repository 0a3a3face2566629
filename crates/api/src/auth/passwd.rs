//! Password file for HTTP basic authentication.
//!
//! One `user:<hash>` entry per line, blank lines and `#` comments ignored.
//! Hashes are Argon2 PHC strings; [`hash_password`] produces them.

use std::collections::HashMap;
use std::path::Path;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

#[derive(Debug, thiserror::Error)]
pub enum PasswdError {
    #[error("unable to read password file: {0}")]
    Io(#[from] std::io::Error),

    #[error("password file line {line}: {reason}")]
    Invalid { line: usize, reason: &'static str },
}

#[derive(Debug, Default)]
pub struct PasswdFile {
    entries: HashMap<String, String>,
}

impl PasswdFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PasswdError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, PasswdError> {
        let mut entries = HashMap::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let invalid = |reason| PasswdError::Invalid {
                line: idx + 1,
                reason,
            };
            let (user, hash) = line.split_once(':').ok_or_else(|| invalid("expected user:hash"))?;
            if user.is_empty() {
                return Err(invalid("empty user name"));
            }
            PasswordHash::new(hash).map_err(|_| invalid("not an argon2 PHC hash"))?;
            entries.insert(user.to_string(), hash.to_string());
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `password` matches the stored hash of `user`.
    pub fn verify(&self, user: &str, password: &str) -> bool {
        let Some(hash) = self.entries.get(user) else {
            return false;
        };
        match verify_password(password, hash) {
            Ok(valid) => valid,
            Err(e) => {
                tracing::warn!(user, error = %e, "Unable to verify password");
                false
            }
        }
    }
}

/// Hash a plaintext password using Argon2id with a random salt.
///
/// Returns the PHC-formatted hash string (includes algorithm, params, salt, and hash).
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a plaintext password against a stored PHC-formatted Argon2 hash.
///
/// Returns `Ok(true)` if the password matches, `Ok(false)` if it does not.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, argon2::password_hash::Error> {
    let parsed_hash = PasswordHash::new(hash)?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(e),
    }
}
