//! # Identity Gate
//!
//! Decides, before a WebSocket is upgraded, whether a connection may join the
//! broker and which rooms it starts in. The policy is fixed when the gate is
//! built:
//!
//! - **Client-declared**: any non-empty credential is accepted, no rooms are
//!   joined up front and the client picks its rooms with `subscribe` requests.
//! - **Identity-routed**: the credential is decoded (locally or through an
//!   introspection endpoint) into an identity, the identity's accounts are
//!   resolved, and the connection is placed in one salted room per account.
//!   Subscribe requests are refused for the rest of the session.
//!
//! A rejected connection never reaches the broker, so it never holds any room.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::channel::RoomKey;

pub mod salt;
pub mod token;

pub use salt::RoomSalt;
pub use token::{decode_identity, extract_credential};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("missing credential")]
    MissingCredential,
    #[error("malformed token: {0}")]
    MalformedToken(String),
    #[error("token expired")]
    Expired,
    #[error("token is not active")]
    Inactive,
    #[error("token introspection failed: {0}")]
    Introspection(String),
    #[error("account lookup failed: {0}")]
    AccountLookup(String),
}

/// Who a connection belongs to, plus the credential it presented.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub token: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("subject", &self.subject).finish_non_exhaustive()
    }
}

/// Remote token introspection.
#[async_trait]
pub trait TokenIntrospector: Send + Sync {
    async fn introspect(&self, token: &str) -> Result<Identity, GateError>;
}

/// Resolves the account identifiers an identity may follow.
#[async_trait]
pub trait AccountResolver: Send + Sync {
    async fn resolve_accounts(&self, identity: &Identity) -> Result<Vec<String>, GateError>;
}

/// How a bearer credential turns into an `Identity`.
#[derive(Clone)]
pub enum IdentityDecoder {
    Local,
    Introspect(Arc<dyn TokenIntrospector>),
}

impl IdentityDecoder {
    pub async fn decode(&self, token: &str) -> Result<Identity, GateError> {
        match self {
            IdentityDecoder::Local => decode_identity(token),
            IdentityDecoder::Introspect(introspector) => introspector.introspect(token).await,
        }
    }
}

impl fmt::Debug for IdentityDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityDecoder::Local => f.write_str("Local"),
            IdentityDecoder::Introspect(_) => f.write_str("Introspect"),
        }
    }
}

/// Outcome of a successful gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub subject: Option<String>,
    pub rooms: Vec<RoomKey>,
    pub accepts_subscribe: bool,
}

#[derive(Clone)]
pub enum IdentityGate {
    ClientDeclared,
    IdentityRouted {
        decoder: IdentityDecoder,
        accounts: Arc<dyn AccountResolver>,
        salt: RoomSalt,
    },
}

impl IdentityGate {
    pub async fn admit(&self, credential: Option<&str>) -> Result<Admission, GateError> {
        let credential = credential.filter(|c| !c.trim().is_empty()).ok_or(GateError::MissingCredential)?;

        match self {
            IdentityGate::ClientDeclared => Ok(Admission {
                subject: None,
                rooms: Vec::new(),
                accepts_subscribe: true,
            }),
            IdentityGate::IdentityRouted { decoder, accounts, salt } => {
                let identity = decoder.decode(credential).await?;
                let account_ids = accounts.resolve_accounts(&identity).await?;

                let mut rooms: Vec<RoomKey> = account_ids.iter().map(|id| salt.account_room(id)).collect();
                rooms.sort();
                rooms.dedup();
                log::debug!("Identity {} admitted to {} account room(s)", identity.subject, rooms.len());

                Ok(Admission {
                    subject: Some(identity.subject),
                    rooms,
                    accepts_subscribe: false,
                })
            }
        }
    }
}

impl fmt::Debug for IdentityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityGate::ClientDeclared => f.write_str("ClientDeclared"),
            IdentityGate::IdentityRouted { decoder, .. } => {
                f.debug_struct("IdentityRouted").field("decoder", decoder).finish_non_exhaustive()
            }
        }
    }
}
