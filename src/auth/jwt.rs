use crate::config::JwtConfig;
use crate::error::{AuthError, GatewayError, Result};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use super::CallerIdentity;

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Roles granted to the subject
    #[serde(default)]
    pub roles: Vec<String>,
    /// Issued at (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    /// Not before (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// JWT validator
///
/// Verification is local: the signature is checked against a shared secret or
/// a PEM public key loaded at startup, then `exp`/`nbf` against the wall clock
/// with `clock_skew_secs` of leeway.
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
    algorithm: Algorithm,
}

impl JwtValidator {
    /// Create a new JWT validator from configuration
    pub fn new(config: &JwtConfig) -> Result<Self> {
        let algorithm = Self::parse_algorithm(&config.algorithm)?;

        let decoding_key = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = match (&config.secret, &config.secret_file) {
                    (Some(secret), _) => secret.expose_secret().as_bytes().to_vec(),
                    (None, Some(path)) => std::fs::read_to_string(path)
                        .map_err(|e| {
                            GatewayError::Config(format!(
                                "Failed to read JWT secret file {}: {}",
                                path, e
                            ))
                        })?
                        .trim_end()
                        .as_bytes()
                        .to_vec(),
                    (None, None) => {
                        return Err(GatewayError::Config(
                            "JWT secret is required for HS256/HS384/HS512 algorithms".to_string(),
                        ))
                    }
                };
                if secret.is_empty() {
                    return Err(GatewayError::Config("JWT secret is empty".to_string()));
                }
                DecodingKey::from_secret(&secret)
            }
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                let pem = Self::read_public_key(config)?;
                DecodingKey::from_rsa_pem(&pem).map_err(|e| {
                    GatewayError::Config(format!("Invalid RSA public key: {}", e))
                })?
            }
            Algorithm::ES256 | Algorithm::ES384 => {
                let pem = Self::read_public_key(config)?;
                DecodingKey::from_ec_pem(&pem)
                    .map_err(|e| GatewayError::Config(format!("Invalid EC public key: {}", e)))?
            }
            _ => {
                return Err(GatewayError::Config(format!(
                    "Unsupported JWT algorithm: {}",
                    config.algorithm
                )))
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.leeway = config.clock_skew_secs;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "sub"]);

        // Configure issuer validation
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }

        // Configure audience validation
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            decoding_key,
            validation,
            algorithm,
        })
    }

    fn read_public_key(config: &JwtConfig) -> Result<Vec<u8>> {
        let path = config.public_key_file.as_ref().ok_or_else(|| {
            GatewayError::Config(format!(
                "JWT public_key_file is required for {}",
                config.algorithm
            ))
        })?;
        std::fs::read(path).map_err(|e| {
            GatewayError::Config(format!("Failed to read JWT public key {}: {}", path, e))
        })
    }

    /// Validate a raw token and extract the caller identity
    pub fn validate_token(&self, token: &str) -> std::result::Result<CallerIdentity, AuthError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!(algorithm = ?self.algorithm, error = %e, "Token validation failed");
                classify(e.kind())
            })?;

        let claims = token_data.claims;
        if claims.sub.is_empty() {
            return Err(AuthError::InvalidClaims);
        }

        Ok(CallerIdentity {
            subject_id: claims.sub,
            roles: claims.roles.into_iter().collect::<BTreeSet<_>>(),
            expires_at: claims.exp,
        })
    }

    /// Parse algorithm string to Algorithm enum
    fn parse_algorithm(algo: &str) -> Result<Algorithm> {
        match algo.to_uppercase().as_str() {
            "HS256" => Ok(Algorithm::HS256),
            "HS384" => Ok(Algorithm::HS384),
            "HS512" => Ok(Algorithm::HS512),
            "RS256" => Ok(Algorithm::RS256),
            "RS384" => Ok(Algorithm::RS384),
            "RS512" => Ok(Algorithm::RS512),
            "ES256" => Ok(Algorithm::ES256),
            "ES384" => Ok(Algorithm::ES384),
            _ => Err(GatewayError::Config(format!(
                "Unsupported algorithm: {}",
                algo
            ))),
        }
    }
}

fn classify(kind: &ErrorKind) -> AuthError {
    match kind {
        ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer
        | ErrorKind::InvalidAudience
        | ErrorKind::InvalidSubject
        | ErrorKind::ImmatureSignature
        | ErrorKind::MissingRequiredClaim(_) => AuthError::InvalidClaims,
        _ => AuthError::MalformedToken,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use secrecy::SecretString;
    use std::io::Write;

    const SECRET: &str = "test-secret-key";

    fn config() -> JwtConfig {
        JwtConfig {
            algorithm: "HS256".to_string(),
            secret: Some(SecretString::new(SECRET.to_string())),
            secret_file: None,
            public_key_file: None,
            issuer: None,
            audience: None,
            clock_skew_secs: 5,
        }
    }

    fn claims(sub: &str, exp_offset_secs: i64) -> Claims {
        let now = chrono::Utc::now().timestamp();
        Claims {
            sub: sub.to_string(),
            exp: (now + exp_offset_secs) as u64,
            roles: vec!["reader".to_string()],
            iat: Some(now as u64),
            nbf: None,
            iss: None,
            aud: None,
        }
    }

    fn sign(secret: &str, claims: &Claims) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_jwt_validator_missing_secret() {
        let config = JwtConfig {
            secret: None,
            ..config()
        };
        assert!(JwtValidator::new(&config).is_err());
    }

    #[test]
    fn test_unsupported_algorithm() {
        let config = JwtConfig {
            algorithm: "none".to_string(),
            ..config()
        };
        assert!(JwtValidator::new(&config).is_err());
    }

    #[test]
    fn test_rsa_requires_public_key_file() {
        let config = JwtConfig {
            algorithm: "RS256".to_string(),
            ..config()
        };
        assert!(JwtValidator::new(&config).is_err());
    }

    #[test]
    fn test_secret_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", SECRET).unwrap();

        let config = JwtConfig {
            secret: None,
            secret_file: Some(file.path().to_string_lossy().to_string()),
            ..config()
        };
        let validator = JwtValidator::new(&config).unwrap();

        let token = sign(SECRET, &claims("user123", 3600));
        assert!(validator.validate_token(&token).is_ok());
    }

    #[test]
    fn test_validate_valid_token() {
        let validator = JwtValidator::new(&config()).unwrap();
        let token = sign(SECRET, &claims("user123", 3600));

        let identity = validator.validate_token(&token).unwrap();
        assert_eq!(identity.subject_id, "user123");
        assert!(identity.roles.contains("reader"));
    }

    #[test]
    fn test_validate_expired_token() {
        let validator = JwtValidator::new(&config()).unwrap();
        let token = sign(SECRET, &claims("user123", -3600));

        assert_eq!(
            validator.validate_token(&token).unwrap_err(),
            AuthError::ExpiredToken
        );
    }

    #[test]
    fn test_expiry_within_clock_skew_is_accepted() {
        let validator = JwtValidator::new(&config()).unwrap();
        let token = sign(SECRET, &claims("user123", -2));

        assert!(validator.validate_token(&token).is_ok());
    }

    #[test]
    fn test_wrong_secret_is_invalid_signature() {
        let validator = JwtValidator::new(&config()).unwrap();
        let token = sign("another-secret", &claims("user123", 3600));

        assert_eq!(
            validator.validate_token(&token).unwrap_err(),
            AuthError::InvalidSignature
        );
    }

    #[test]
    fn test_garbage_is_malformed() {
        let validator = JwtValidator::new(&config()).unwrap();

        assert_eq!(
            validator.validate_token("not-a-jwt").unwrap_err(),
            AuthError::MalformedToken
        );
    }

    #[test]
    fn test_issuer_mismatch_is_invalid_claims() {
        let validator = JwtValidator::new(&JwtConfig {
            issuer: Some("https://issuer.example".to_string()),
            ..config()
        })
        .unwrap();

        let mut claims = claims("user123", 3600);
        claims.iss = Some("https://elsewhere.example".to_string());
        let token = sign(SECRET, &claims);

        assert_eq!(
            validator.validate_token(&token).unwrap_err(),
            AuthError::InvalidClaims
        );
    }

    #[test]
    fn test_not_yet_valid_is_invalid_claims() {
        let validator = JwtValidator::new(&config()).unwrap();
        let mut claims = claims("user123", 3600);
        claims.nbf = Some((chrono::Utc::now().timestamp() + 600) as u64);
        let token = sign(SECRET, &claims);

        assert_eq!(
            validator.validate_token(&token).unwrap_err(),
            AuthError::InvalidClaims
        );
    }
}
