use std::future::{ready, Ready};

use actix_web::{dev::Payload, error::InternalError, web, FromRequest, HttpRequest};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error_handler::ErrorHandler;
use crate::model::UserId;

/// Verifies bearer tokens minted by the account service (HS256).
#[derive(Clone)]
pub struct AuthConfig {
    decoding_key: DecodingKey,
    validation: Validation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    pub exp: usize,
}

impl AuthConfig {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<UserId, String> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| err.to_string())?;
        data.claims
            .id
            .parse()
            .map_err(|_| format!("token subject '{}' is not a user id", data.claims.id))
    }
}

/// The caller identity, taken from `Authorization: Bearer <jwt>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

impl FromRequest for AuthenticatedUser {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(authenticate(req))
    }
}

fn authenticate(req: &HttpRequest) -> Result<AuthenticatedUser, actix_web::Error> {
    let Some(config) = req.app_data::<web::Data<AuthConfig>>() else {
        let response = ErrorHandler::internal_server_error("Authentication is not configured", None);
        return Err(InternalError::from_response("auth not configured", response).into());
    };

    let token = req
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());

    let Some(token) = token else {
        let response = ErrorHandler::unauthorized("No token, authorization denied", None);
        return Err(InternalError::from_response("missing bearer token", response).into());
    };

    match config.verify(token) {
        Ok(user_id) => {
            debug!("🔑 authenticated {}", user_id);
            Ok(AuthenticatedUser(user_id))
        }
        Err(details) => {
            let response = ErrorHandler::unauthorized("Token is not valid", Some(&details));
            Err(InternalError::from_response(details, response).into())
        }
    }
}
