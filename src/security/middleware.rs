use crate::AppState;
use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};

use super::claims::{UserClaims, UserContext};

/// Resolve the caller from a bearer token. Without a token the request is
/// rejected when JWT is required, and runs as the anonymous user otherwise.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let context = match token {
        Some(token) => {
            let key = DecodingKey::from_secret(state.config.security.jwt_secret.as_bytes());
            match decode::<UserClaims>(token, &key, &Validation::default()) {
                Ok(data) => UserContext::from(data.claims),
                Err(err) => {
                    tracing::debug!(error = %err, "rejected bearer token");
                    return Err(StatusCode::UNAUTHORIZED);
                }
            }
        }
        None if state.config.security.jwt_required => return Err(StatusCode::UNAUTHORIZED),
        None => UserContext::anonymous(),
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
