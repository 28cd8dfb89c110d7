use anyhow::{bail, Context};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    #[serde(default)]
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSubject {
    pub subject: String,
}

/// HS256 validation for WebSocket upgrade tokens and system API bearers.
#[derive(Clone)]
pub struct JwtTokenService {
    decoding_key: DecodingKey,
    validation: Validation,
    #[cfg(test)]
    secret: String,
}

impl JwtTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            #[cfg(test)]
            secret: secret.to_owned(),
        })
    }

    pub fn validate(&self, token: &str) -> anyhow::Result<TokenSubject> {
        let claims = decode::<AccessTokenClaims>(token.trim(), &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;
        Ok(TokenSubject { subject: claims.sub })
    }

    #[cfg(test)]
    pub fn issue_for_tests(&self, subject: &str, ttl_seconds: i64) -> String {
        use jsonwebtoken::{encode, EncodingKey, Header};

        let issued_at = chrono::Utc::now().timestamp();
        let claims =
            AccessTokenClaims { sub: subject.to_owned(), iat: issued_at, exp: issued_at + ttl_seconds };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .expect("test token should encode")
    }
}
