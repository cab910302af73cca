use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{ Algorithm, DecodingKey, EncodingKey, Header, Validation };
use serde::{ Deserialize, Serialize };
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use url::form_urlencoded;
use uuid::Uuid;

use crate::error::AuthError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(String),
    Anonymous,
}

impl Identity {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::User(id) => Some(id),
            Identity::Anonymous => None,
        }
    }
}

/// Claims of an HS256 access token. The user is named by `user_id`, or by
/// `user` when `user_id` is absent; either may be a string or a number.
#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jti: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<JsonValue>,
}

impl AccessClaims {
    fn subject(&self) -> Option<String> {
        [&self.user_id, &self.user]
            .into_iter()
            .flatten()
            .find_map(|v| {
                match v {
                    JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    JsonValue::Number(n) => Some(n.to_string()),
                    _ => None,
                }
            })
    }
}

/// Verifies HS256 access tokens signed with the shared secret.
#[derive(Clone)]
pub struct Authenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    pub fn new(secret: &str) -> Result<Self, AuthError> {
        if secret.trim().is_empty() {
            return Err(AuthError::EmptySecret);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Signs an access token for `user_id`, for tooling and tests.
    pub fn issue(&self, user_id: &str, expires_at: i64) -> Result<String, AuthError> {
        let claims = AccessClaims {
            exp: expires_at,
            iat: Some(Utc::now().timestamp()),
            jti: Some(Uuid::new_v4().simple().to_string()),
            token_type: Some("access".to_string()),
            user_id: Some(JsonValue::String(user_id.to_string())),
            user: None,
        };
        jsonwebtoken
            ::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| AuthError::Malformed)
    }

    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let data = jsonwebtoken
            ::decode::<AccessClaims>(token.trim(), &self.decoding, &self.validation)
            .map_err(|e| {
                match e.kind() {
                    ErrorKind::ExpiredSignature => AuthError::Expired,
                    ErrorKind::InvalidSignature => AuthError::BadSignature,
                    _ => AuthError::Malformed,
                }
            })?;
        let claims = data.claims;
        if let Some(kind) = &claims.token_type {
            if kind != "access" {
                return Err(AuthError::WrongTokenType(kind.clone()));
            }
        }
        claims.subject().ok_or(AuthError::MissingUser)
    }

    /// Resolves the identity; any token problem yields [`Identity::Anonymous`].
    pub fn identify(&self, token: Option<&str>) -> Identity {
        match token.map(|t| self.verify(t)) {
            Some(Ok(user)) => Identity::User(user),
            Some(Err(e)) => {
                log::info!("Rejected bearer token: {}", e);
                Identity::Anonymous
            }
            None => Identity::Anonymous,
        }
    }
}

/// What the connection handshake tells us about the caller.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub conversation_id: Option<String>,
    pub token: Option<String>,
}

impl HandshakeInfo {
    pub fn from_request(req: &Request) -> Self {
        let header_token = req
            .headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| v.trim().to_string());
        let query_token = req.uri().query().and_then(|qs| {
            let params: HashMap<String, String> = form_urlencoded
                ::parse(qs.as_bytes())
                .into_owned()
                .collect();
            params.get("token").cloned()
        });

        Self {
            conversation_id: conversation_from_path(req.uri().path()),
            token: header_token.or(query_token).filter(|t| !t.is_empty()),
        }
    }
}

/// Extracts `<id>` from `/ws/conversations/<id>[/]`.
pub fn conversation_from_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/ws/conversations/")?;
    let id = rest.trim_end_matches('/');
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> Authenticator {
        Authenticator::new("s3cret").unwrap()
    }

    fn future() -> i64 {
        Utc::now().timestamp() + 3600
    }

    fn sign(secret: &str, claims: JsonValue) -> String {
        jsonwebtoken
            ::encode(
                &Header::new(Algorithm::HS256),
                &claims,
                &EncodingKey::from_secret(secret.as_bytes())
            )
            .unwrap()
    }

    #[test]
    fn round_trip_identity() {
        let token = auth().issue("user.42", future()).unwrap();
        assert_eq!(auth().identify(Some(&token)), Identity::User("user.42".into()));
    }

    #[test]
    fn accepts_numeric_user_id_access_tokens() {
        let token = sign(
            "s3cret",
            serde_json::json!({
                "token_type": "access",
                "exp": future(),
                "iat": Utc::now().timestamp(),
                "jti": "0f1e2d3c",
                "user_id": 42,
            })
        );
        assert_eq!(auth().verify(&token), Ok("42".to_string()));
    }

    #[test]
    fn falls_back_to_user_claim() {
        let token = sign("s3cret", serde_json::json!({ "exp": future(), "user": "alice" }));
        assert_eq!(auth().verify(&token), Ok("alice".to_string()));
    }

    #[test]
    fn refresh_tokens_and_userless_tokens_are_rejected() {
        let refresh = sign(
            "s3cret",
            serde_json::json!({ "token_type": "refresh", "exp": future(), "user_id": 1 })
        );
        assert_eq!(auth().verify(&refresh), Err(AuthError::WrongTokenType("refresh".into())));

        let nobody = sign("s3cret", serde_json::json!({ "exp": future() }));
        assert_eq!(auth().verify(&nobody), Err(AuthError::MissingUser));
    }

    #[test]
    fn tampered_token_is_anonymous() {
        let token = auth().issue("alice", future()).unwrap();
        let other = Authenticator::new("different").unwrap();
        assert_eq!(other.verify(&token), Err(AuthError::BadSignature));
        assert_eq!(other.identify(Some(&token)), Identity::Anonymous);
    }

    #[test]
    fn expired_token() {
        let token = auth().issue("alice", Utc::now().timestamp() - 1).unwrap();
        assert_eq!(auth().verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn malformed_tokens() {
        for t in ["", "abc", "a.b", "a.b.c", "not a jwt at all"] {
            assert!(auth().verify(t).is_err(), "{} should fail", t);
        }
        assert_eq!(auth().identify(None), Identity::Anonymous);
    }

    #[test]
    fn empty_secret_rejected() {
        assert!(matches!(Authenticator::new("  "), Err(AuthError::EmptySecret)));
    }

    #[test]
    fn path_parsing() {
        assert_eq!(conversation_from_path("/ws/conversations/42/"), Some("42".into()));
        assert_eq!(conversation_from_path("/ws/conversations/abc"), Some("abc".into()));
        assert_eq!(conversation_from_path("/ws/conversations/"), None);
        assert_eq!(conversation_from_path("/ws/conversations/a/b"), None);
        assert_eq!(conversation_from_path("/other"), None);
    }

    #[test]
    fn handshake_reads_header_then_query() {
        let req = Request::builder()
            .uri("/ws/conversations/7?token=fromquery")
            .header("Authorization", "Bearer fromheader")
            .body(())
            .unwrap();
        let info = HandshakeInfo::from_request(&req);
        assert_eq!(info.conversation_id.as_deref(), Some("7"));
        assert_eq!(info.token.as_deref(), Some("fromheader"));

        let req = Request::builder().uri("/ws/conversations/7?token=fromquery").body(()).unwrap();
        assert_eq!(HandshakeInfo::from_request(&req).token.as_deref(), Some("fromquery"));
    }
}
