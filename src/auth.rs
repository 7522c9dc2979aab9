use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::HandshakeError;
use crate::protocol::Identity;

/// Turns a bearer credential into the identity it is allowed to use.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, HandshakeError>;
}

/// Subject claim as issued by the account service. Older tokens carry a
/// numeric `id` instead of `sub`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Subject {
    Text(String),
    Number(u64),
}

impl Subject {
    fn into_string(self) -> String {
        match self {
            Subject::Text(s) => s,
            Subject::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(alias = "id")]
    pub sub: Subject,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// HS256 verifier sharing a secret with the token issuer.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str, leeway: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway.as_secs();
        validation.set_required_spec_claims(&["exp"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, HandshakeError> {
        if token.is_empty() {
            return Err(HandshakeError::MissingToken);
        }
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|err| {
            match err.kind() {
                ErrorKind::ExpiredSignature => HandshakeError::Expired,
                ErrorKind::InvalidSignature => HandshakeError::InvalidSignature,
                _ => HandshakeError::Malformed(err.to_string()),
            }
        })?;
        Ok(Identity::new(data.claims.sub.into_string())?)
    }
}

/// Mint an HS256 token for `identity` valid for `ttl`.
pub fn issue_token(
    secret: &str,
    identity: &Identity,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: Subject::Text(identity.as_str().to_owned()),
        exp: jsonwebtoken::get_current_timestamp() + ttl.as_secs(),
        role: None,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}
