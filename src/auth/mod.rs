pub mod jwt;

use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use axum::http::{HeaderMap, HeaderValue};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Header carrying the verified subject to backends
pub const CALLER_SUBJECT_HEADER: &str = "x-caller-subject";
/// Header carrying the verified roles (comma separated) to backends
pub const CALLER_ROLES_HEADER: &str = "x-caller-roles";

/// Verified caller, valid for the duration of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub subject_id: String,
    pub roles: BTreeSet<String>,
    /// Unix timestamp from the token's `exp`
    pub expires_at: u64,
}

impl CallerIdentity {
    pub fn has_any_role(&self, required: &[String]) -> bool {
        required.is_empty() || required.iter().any(|r| self.roles.contains(r))
    }
}

/// Authentication service
#[derive(Clone)]
pub struct AuthService {
    jwt_validator: Option<Arc<jwt::JwtValidator>>,
    forward_identity: bool,
}

impl AuthService {
    /// Create a new authentication service from configuration
    pub fn new(config: Option<&AuthConfig>) -> Result<Self> {
        let Some(config) = config else {
            return Ok(Self::disabled());
        };

        let jwt_validator = match &config.jwt {
            Some(jwt_config) => Some(Arc::new(jwt::JwtValidator::new(jwt_config)?)),
            None => None,
        };

        Ok(Self {
            jwt_validator,
            forward_identity: config.forward_identity,
        })
    }

    /// No token validation; every caller is anonymous
    pub fn disabled() -> Self {
        Self {
            jwt_validator: None,
            forward_identity: true,
        }
    }

    /// Check if authentication is available
    pub fn is_available(&self) -> bool {
        self.jwt_validator.is_some()
    }

    /// Validate the bearer token carried by `headers`
    pub fn authenticate(&self, headers: &HeaderMap) -> std::result::Result<CallerIdentity, AuthError> {
        let token = extract_bearer(headers)?;
        let validator = self
            .jwt_validator
            .as_ref()
            .ok_or(AuthError::InvalidSignature)?;
        validator.validate_token(token)
    }

    /// Resolve the caller for a route
    ///
    /// Routes requiring auth (or roles) reject any token problem. Elsewhere a
    /// valid token still identifies the caller, while a missing or bad one
    /// leaves the request anonymous.
    pub fn authorize(
        &self,
        headers: &HeaderMap,
        auth_required: bool,
        required_roles: &[String],
    ) -> std::result::Result<Option<CallerIdentity>, AuthError> {
        if auth_required || !required_roles.is_empty() {
            let identity = self.authenticate(headers)?;
            if !identity.has_any_role(required_roles) {
                debug!(subject = %identity.subject_id, "Caller lacks required role");
                return Err(AuthError::InsufficientRole);
            }
            return Ok(Some(identity));
        }

        if self.jwt_validator.is_none() || !headers.contains_key(axum::http::header::AUTHORIZATION) {
            return Ok(None);
        }

        match self.authenticate(headers) {
            Ok(identity) => Ok(Some(identity)),
            Err(e) => {
                debug!(error = %e, "Ignoring unusable token on public route");
                Ok(None)
            }
        }
    }

    /// Replace caller headers with the verified identity
    pub fn apply_identity_headers(&self, headers: &mut HeaderMap, identity: Option<&CallerIdentity>) {
        if !self.forward_identity {
            return;
        }

        headers.remove(CALLER_SUBJECT_HEADER);
        headers.remove(CALLER_ROLES_HEADER);

        let Some(identity) = identity else {
            return;
        };

        if let Ok(value) = HeaderValue::from_str(&identity.subject_id) {
            headers.insert(CALLER_SUBJECT_HEADER, value);
        }
        if !identity.roles.is_empty() {
            let roles = identity.roles.iter().cloned().collect::<Vec<_>>().join(",");
            if let Ok(value) = HeaderValue::from_str(&roles) {
                headers.insert(CALLER_ROLES_HEADER, value);
            }
        }
    }
}

/// Pull the token out of `Authorization: Bearer <token>`
pub fn extract_bearer(headers: &HeaderMap) -> std::result::Result<&str, AuthError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?;

    let value = value.to_str().map_err(|_| AuthError::MalformedToken)?;
    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or(AuthError::MalformedToken)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MalformedToken);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MalformedToken);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JwtConfig;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use secrecy::SecretString;

    const SECRET: &str = "auth-test-secret";

    fn service() -> AuthService {
        AuthService::new(Some(&AuthConfig {
            jwt: Some(JwtConfig {
                algorithm: "HS256".to_string(),
                secret: Some(SecretString::new(SECRET.to_string())),
                secret_file: None,
                public_key_file: None,
                issuer: None,
                audience: None,
                clock_skew_secs: 5,
            }),
            forward_identity: true,
        }))
        .unwrap()
    }

    fn bearer(sub: &str, roles: &[&str], exp_offset_secs: i64) -> HeaderMap {
        let claims = jwt::Claims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + exp_offset_secs) as u64,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            iat: None,
            nbf: None,
            iss: None,
            aud: None,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {}", token).parse().unwrap(),
        );
        headers
    }

    #[test]
    fn test_auth_service_without_config() {
        let service = AuthService::new(None).unwrap();
        assert!(!service.is_available());
        assert_eq!(
            service.authorize(&HeaderMap::new(), false, &[]).unwrap(),
            None
        );
    }

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), Err(AuthError::MissingToken));

        headers.insert("authorization", "Basic dXNlcjpwYXNz".parse().unwrap());
        assert_eq!(extract_bearer(&headers), Err(AuthError::MalformedToken));

        headers.insert("authorization", "Bearer".parse().unwrap());
        assert_eq!(extract_bearer(&headers), Err(AuthError::MalformedToken));

        headers.insert("authorization", "bearer abc.def.ghi".parse().unwrap());
        assert_eq!(extract_bearer(&headers), Ok("abc.def.ghi"));
    }

    #[test]
    fn test_required_auth_rejects_missing_token() {
        let result = service().authorize(&HeaderMap::new(), true, &[]);
        assert_eq!(result, Err(AuthError::MissingToken));
    }

    #[test]
    fn test_required_auth_rejects_expired_token() {
        let result = service().authorize(&bearer("alice", &[], -60), true, &[]);
        assert_eq!(result, Err(AuthError::ExpiredToken));
    }

    #[test]
    fn test_required_roles() {
        let service = service();
        let admin = vec!["admin".to_string()];

        let result = service.authorize(&bearer("alice", &["reader"], 3600), false, &admin);
        assert_eq!(result, Err(AuthError::InsufficientRole));

        let identity = service
            .authorize(&bearer("bob", &["reader", "admin"], 3600), false, &admin)
            .unwrap()
            .unwrap();
        assert_eq!(identity.subject_id, "bob");
    }

    #[test]
    fn test_public_route_identifies_or_falls_back() {
        let service = service();

        let identity = service
            .authorize(&bearer("alice", &[], 3600), false, &[])
            .unwrap();
        assert_eq!(identity.unwrap().subject_id, "alice");

        let expired = service.authorize(&bearer("alice", &[], -60), false, &[]);
        assert_eq!(expired, Ok(None));
    }

    #[test]
    fn test_identity_headers_are_replaced() {
        let service = service();
        let identity = CallerIdentity {
            subject_id: "alice".to_string(),
            roles: ["admin", "reader"].iter().map(|r| r.to_string()).collect(),
            expires_at: 0,
        };

        let mut headers = HeaderMap::new();
        headers.insert(CALLER_SUBJECT_HEADER, "mallory".parse().unwrap());
        headers.insert(CALLER_ROLES_HEADER, "root".parse().unwrap());

        service.apply_identity_headers(&mut headers, Some(&identity));
        assert_eq!(headers.get(CALLER_SUBJECT_HEADER).unwrap(), "alice");
        assert_eq!(headers.get(CALLER_ROLES_HEADER).unwrap(), "admin,reader");

        service.apply_identity_headers(&mut headers, None);
        assert!(headers.get(CALLER_SUBJECT_HEADER).is_none());
        assert!(headers.get(CALLER_ROLES_HEADER).is_none());
    }
}
