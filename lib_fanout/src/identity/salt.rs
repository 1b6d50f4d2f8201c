use std::fmt;

use sha2::{Digest, Sha256};

use crate::core::channel::{Channel, RoomKey};

/// Shared secret mixed into account room names so raw account identifiers
/// never appear in room keys.
#[derive(Clone)]
pub struct RoomSalt {
    secret: String,
}

impl RoomSalt {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// `account_<hex(sha256(secret ":" account_id))>`
    pub fn account_room(&self, account_id: &str) -> RoomKey {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(account_id.as_bytes());
        RoomKey::from_digest(Channel::Account, hex::encode(hasher.finalize()))
    }
}

impl fmt::Debug for RoomSalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RoomSalt(****)")
    }
}
