use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth::Role;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub issuer: String,
    pub audience: String,
    pub access_token_expiry_minutes: i64,
    pub leeway_seconds: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            issuer: "grcserver".into(),
            audience: "grcserver-api".into(),
            access_token_expiry_minutes: 15,
            leeway_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    Access,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub org_id: String,
    pub email: String,
    pub role: Role,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub jti: String,
    #[serde(rename = "type")]
    pub token_type: String,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|e| anyhow!("Invalid user ID in claims: {e}"))
    }

    pub fn org_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.org_id).map_err(|e| anyhow!("Invalid organization ID in claims: {e}"))
    }

    pub fn is_access_token(&self) -> bool {
        self.token_type == TokenType::Access.as_str()
    }
}

/// Pair handed back on register, login and refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_expires_at: DateTime<Utc>,
}

pub struct JwtManager {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl std::fmt::Debug for JwtManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JwtManager {
    pub fn new(config: JwtConfig, secret: &str) -> Result<Self> {
        if secret.len() < 32 {
            return Err(anyhow!("JWT secret must be at least 32 characters"));
        }
        Ok(Self {
            config,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        })
    }

    pub fn access_ttl_seconds(&self) -> i64 {
        self.config.access_token_expiry_minutes * 60
    }

    pub fn issue_access_token(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        email: &str,
        role: Role,
    ) -> Result<String> {
        let now = Utc::now();
        let expiry = now + Duration::minutes(self.config.access_token_expiry_minutes);
        let claims = Claims {
            sub: user_id.to_string(),
            org_id: org_id.to_string(),
            email: email.to_string(),
            role,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            exp: expiry.timestamp(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            token_type: TokenType::Access.as_str().to_string(),
        };

        let header = Header::new(Algorithm::HS256);
        encode(&header, &claims, &self.encoding_key)
            .map_err(|e| anyhow!("Failed to encode access token: {e}"))
    }

    pub fn validate_access_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);
        validation.leeway = self.config.leeway_seconds;

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| anyhow!("Token validation failed: {e}"))?;

        if !token_data.claims.is_access_token() {
            return Err(anyhow!("Token is not an access token"));
        }

        Ok(token_data.claims)
    }
}

pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-that-is-at-least-32-chars";

    fn manager() -> JwtManager {
        JwtManager::new(JwtConfig::default(), SECRET).expect("Failed to create manager")
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(JwtManager::new(JwtConfig::default(), "short").is_err());
    }

    #[test]
    fn test_issue_and_validate() {
        let manager = manager();
        let user_id = Uuid::new_v4();
        let org_id = Uuid::new_v4();
        let token = manager
            .issue_access_token(user_id, org_id, "ana@example.com", Role::Ciso)
            .expect("issue");

        let claims = manager.validate_access_token(&token).expect("validate");
        assert_eq!(claims.user_id().expect("sub"), user_id);
        assert_eq!(claims.org_id().expect("org"), org_id);
        assert_eq!(claims.role, Role::Ciso);
        assert_eq!(claims.email, "ana@example.com");
        assert_eq!(claims.exp - claims.iat, 15 * 60);
    }

    #[test]
    fn test_token_from_other_secret_rejected() {
        let other = JwtManager::new(JwtConfig::default(), "another-secret-key-that-is-32-chars-long")
            .expect("manager");
        let token = other
            .issue_access_token(Uuid::new_v4(), Uuid::new_v4(), "a@b.io", Role::Viewer)
            .expect("issue");
        assert!(manager().validate_access_token(&token).is_err());
    }

    #[test]
    fn test_wrong_audience_rejected() {
        let config = JwtConfig {
            audience: "someone-else".into(),
            ..JwtConfig::default()
        };
        let foreign = JwtManager::new(config, SECRET).expect("manager");
        let token = foreign
            .issue_access_token(Uuid::new_v4(), Uuid::new_v4(), "a@b.io", Role::Viewer)
            .expect("issue");
        assert!(manager().validate_access_token(&token).is_err());
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(extract_bearer_token("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer_token("bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer_token("Bearer "), None);
        assert_eq!(extract_bearer_token("Basic abc123"), None);
    }
}
