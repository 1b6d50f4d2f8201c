//! HTTP-backed identity collaborators: account lookup and token introspection.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::identity::{AccountResolver, GateError, Identity, TokenIntrospector};
use crate::retrieve::api_client::ApiClient;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountsResponse {
    #[serde(default)]
    account_ids: Vec<String>,
}

/// `GET <accounts_url>` with the connection's own bearer token, answering
/// `{"accountIds": [..]}`.
pub struct HttpAccountResolver {
    client: ApiClient,
}

impl HttpAccountResolver {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AccountResolver for HttpAccountResolver {
    async fn resolve_accounts(&self, identity: &Identity) -> Result<Vec<String>, GateError> {
        let response = self
            .client
            .request::<AccountsResponse, ()>(Method::GET, "", Some(&identity.token), None)
            .await
            .map_err(|e| GateError::AccountLookup(e.to_string()))?;

        match response.data {
            Some(body) if response.success => {
                log::debug!("Resolved {} account(s) for {}", body.account_ids.len(), identity.subject);
                Ok(body.account_ids)
            }
            _ => Err(GateError::AccountLookup(format!(
                "status {}: {}",
                response.status,
                response.error_body.unwrap_or_default()
            ))),
        }
    }
}

#[derive(Serialize)]
struct IntrospectRequest<'a> {
    token: &'a str,
}

/// RFC 7662 style introspection answer.
#[derive(Debug, Deserialize)]
struct IntrospectResponse {
    active: bool,
    #[serde(default)]
    sub: Option<String>,
}

/// `POST <introspection_url>` with `{"token": ..}`.
pub struct HttpIntrospector {
    client: ApiClient,
}

impl HttpIntrospector {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenIntrospector for HttpIntrospector {
    async fn introspect(&self, token: &str) -> Result<Identity, GateError> {
        let response = self
            .client
            .request::<IntrospectResponse, _>(Method::POST, "", None, Some(&IntrospectRequest { token }))
            .await
            .map_err(|e| GateError::Introspection(e.to_string()))?;

        let Some(body) = response.data.filter(|_| response.success) else {
            return Err(GateError::Introspection(format!("status {}", response.status)));
        };
        identity_from(body, token)
    }
}

fn identity_from(body: IntrospectResponse, token: &str) -> Result<Identity, GateError> {
    if !body.active {
        return Err(GateError::Inactive);
    }
    let subject = body
        .sub
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GateError::Introspection("active token without 'sub'".to_string()))?;
    Ok(Identity { subject, token: token.to_string() })
}
