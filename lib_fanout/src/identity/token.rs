//! Bearer credential extraction and local JWT claims decoding.
//!
//! Local decoding does not verify the signature. The account lookup that
//! follows is made with the same token and is the authority.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use serde::Deserialize;

use crate::identity::{GateError, Identity};

const BEARER_PREFIX: &str = "Bearer ";

/// Picks the credential from the `Authorization` header, falling back to the
/// `token` query parameter browsers use since they cannot set headers on a
/// WebSocket handshake. Blank values count as absent.
pub fn extract_credential(authorization: Option<&str>, query_token: Option<&str>) -> Option<String> {
    let from_header = authorization.map(|value| {
        value
            .strip_prefix(BEARER_PREFIX)
            .or_else(|| value.strip_prefix("bearer "))
            .unwrap_or(value)
            .trim()
    });
    from_header
        .filter(|v| !v.is_empty())
        .or_else(|| query_token.map(str::trim).filter(|v| !v.is_empty()))
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    exp: Option<i64>,
}

/// Reads the subject out of a JWT's claims segment.
pub fn decode_identity(token: &str) -> Result<Identity, GateError> {
    let mut segments = token.split('.');
    let (Some(_header), Some(claims), Some(_signature), None) =
        (segments.next(), segments.next(), segments.next(), segments.next())
    else {
        return Err(GateError::MalformedToken("expected three segments".to_string()));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(claims.trim_end_matches('='))
        .map_err(|e| GateError::MalformedToken(e.to_string()))?;
    let claims: Claims =
        serde_json::from_slice(&bytes).map_err(|e| GateError::MalformedToken(e.to_string()))?;

    if let Some(exp) = claims.exp {
        if exp <= Utc::now().timestamp() {
            return Err(GateError::Expired);
        }
    }
    let subject = claims
        .sub
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GateError::MalformedToken("missing 'sub' claim".to_string()))?;

    Ok(Identity { subject, token: token.to_string() })
}

#[cfg(test)]
pub(crate) fn unsigned_token(claims: serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{body}.sig")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_wins_over_query_and_blank_values_are_ignored() {
        assert_eq!(extract_credential(Some("Bearer abc"), Some("q")), Some("abc".to_string()));
        assert_eq!(extract_credential(Some("abc"), None), Some("abc".to_string()));
        assert_eq!(extract_credential(Some("Bearer   "), Some("q")), Some("q".to_string()));
        assert_eq!(extract_credential(None, Some("  ")), None);
        assert_eq!(extract_credential(None, None), None);
    }

    #[test]
    fn decodes_subject_from_claims() {
        let token = unsigned_token(json!({"sub": "user-1", "exp": Utc::now().timestamp() + 60}));
        let identity = decode_identity(&token).unwrap();
        assert_eq!(identity.subject, "user-1");
        assert_eq!(identity.token, token);
    }

    #[test]
    fn rejects_expired_and_malformed_tokens() {
        let expired = unsigned_token(json!({"sub": "user-1", "exp": 1}));
        assert!(matches!(decode_identity(&expired), Err(GateError::Expired)));

        let anonymous = unsigned_token(json!({"scope": "read"}));
        assert!(matches!(decode_identity(&anonymous), Err(GateError::MalformedToken(_))));

        assert!(matches!(decode_identity("only.two"), Err(GateError::MalformedToken(_))));
        assert!(matches!(decode_identity("a.!!!.c"), Err(GateError::MalformedToken(_))));
    }
}
