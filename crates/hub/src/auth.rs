//! Operator credential verification. One authorization capability, injected
//! into the controller, instead of each operation re-deriving the check.

use anyhow::Result;
use tracing::warn;

use crate::db::Db;

pub struct Authorizer {
    db: Db,
    username: String,
}

impl Authorizer {
    pub fn new(db: Db, username: impl Into<String>) -> Self {
        Self {
            db,
            username: username.into(),
        }
    }

    /// Check a plaintext credential against the stored operator hash.
    /// A missing account, a wrong password, and a malformed stored hash all
    /// come back `false` — the caller must not be able to tell which; the
    /// distinction lives only in the server log.
    pub async fn verify(&self, password: &str) -> Result<bool> {
        let Some(user) = self.db.find_user(&self.username).await? else {
            warn!(username = %self.username, "credential check against missing operator account");
            return Ok(false);
        };

        match bcrypt::verify(password, &user.password_hash) {
            Ok(ok) => Ok(ok),
            Err(e) => {
                warn!(username = %self.username, "stored operator hash unusable: {e}");
                Ok(false)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
