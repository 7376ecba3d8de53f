use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::debug;
use uuid::Uuid;

use quill_types::api::Claims;

use crate::error::ApiError;
use crate::state::AppState;

/// Tokens are valid for a week.
pub const TOKEN_TTL_DAYS: i64 = 7;

pub fn create_token(secret: &str, user_id: Uuid, mobile_number: &str) -> anyhow::Result<String> {
    let claims = Claims {
        user_id,
        mobile_number: mobile_number.to_string(),
        exp: (Utc::now() + Duration::days(TOKEN_TTL_DAYS)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

pub fn decode_token(secret: &str, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

/// Extract and validate JWT from Authorization header.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Not authorized, no token"))?;

    let claims = decode_token(&state.jwt_secret, token).map_err(|e| {
        debug!("Rejected bearer token: {}", e);
        ApiError::unauthorized("Not authorized, token failed")
    })?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn token_round_trips_identity() {
        let user_id = Uuid::new_v4();
        let token = create_token(SECRET, user_id, "+15551234567").unwrap();
        let claims = decode_token(SECRET, &token).unwrap();

        assert_eq!(claims.user_id, user_id);
        assert_eq!(claims.mobile_number, "+15551234567");
        let ttl = claims.exp as i64 - Utc::now().timestamp();
        let week = Duration::days(TOKEN_TTL_DAYS).num_seconds();
        assert!((week - 5..=week).contains(&ttl));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = create_token(SECRET, Uuid::new_v4(), "+1").unwrap();
        assert!(decode_token("another-secret", &token).is_err());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let token = create_token(SECRET, Uuid::new_v4(), "+1").unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = create_token("attacker", Uuid::new_v4(), "+2").unwrap();
        let forged_payload = forged.split('.').nth(1).unwrap().to_string();
        parts[1] = &forged_payload;
        assert!(decode_token(SECRET, &parts.join(".")).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let claims = Claims {
            user_id: Uuid::new_v4(),
            mobile_number: "+1".into(),
            exp: (Utc::now() - Duration::days(1)).timestamp() as usize,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap();
        assert!(decode_token(SECRET, &token).is_err());
    }
}
