use crate::{
    config::Config,
    error::{AppError, Result},
    utils::{serde_helpers::lenient_id, validation::normalize_email},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(with = "lenient_id")]
    pub sub: String, // user id
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "nome")]
    pub name: Option<String>,
    #[serde(default, alias = "papel")]
    pub role: Option<String>,
}

/// The authenticated caller, inserted into request extensions by the auth
/// middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub role: Option<String>,
}

impl User {
    /// Ids under which notifications may be addressed to this user: the
    /// account id and, for invite traffic, the e-mail address.
    pub fn identities(&self) -> Vec<String> {
        let mut ids = vec![self.id.clone()];
        if !self.email.is_empty() && self.email != self.id {
            ids.push(self.email.clone());
        }
        ids
    }
}

impl From<Claims> for User {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.sub,
            email: claims.email.as_deref().map(normalize_email).unwrap_or_default(),
            name: claims.name,
            role: claims.role,
        }
    }
}

#[derive(Clone)]
pub struct AuthService {
    jwt_secret: String,
}

impl AuthService {
    pub fn new(config: &Config) -> Self {
        Self {
            jwt_secret: config.jwt_secret.clone(),
        }
    }

    pub fn verify_jwt(&self, token: &str) -> Result<Claims> {
        let decoding_key = DecodingKey::from_secret(self.jwt_secret.as_ref());
        let validation = Validation::new(Algorithm::HS256);

        match decode::<Claims>(token, &decoding_key, &validation) {
            Ok(token_data) => {
                debug!("JWT token verified for user: {}", token_data.claims.sub);
                Ok(token_data.claims)
            }
            Err(e) => {
                warn!("JWT verification failed: {}", e);
                Err(AppError::unauthorized("Invalid token"))
            }
        }
    }

    pub fn authenticate(&self, token: &str) -> Result<User> {
        self.verify_jwt(token).map(User::from)
    }
}
