use axum::{
    body::Body,
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};

use crate::{credentials::Scope, error::ApiError, identity::Identity, state::AppState};

#[derive(Debug, Clone)]
pub enum AuthUser {
    Verified(Identity),
    Unauthorized,
}

impl AuthUser {
    pub fn identity(&self) -> Result<&Identity, ApiError> {
        match self {
            AuthUser::Verified(identity) => Ok(identity),
            AuthUser::Unauthorized => Err(ApiError::auth_denied("no bearer token presented")),
        }
    }

    /// Verified identity holding `scope`.
    pub fn require(&self, scope: Scope) -> Result<&Identity, ApiError> {
        let identity = self.identity()?;
        identity.require(scope)?;
        Ok(identity)
    }
}

fn bearer(value: &str) -> &str {
    value.strip_prefix("Bearer ").unwrap_or(value).trim()
}

/// Resolves the bearer token into an [`AuthUser`] extension. A presented
/// token that fails verification is refused here; requests without one
/// continue as [`AuthUser::Unauthorized`] so public routes stay reachable.
pub async fn jwt_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response<Body>, ApiError> {
    if let Some(auth_header) = request.headers().get(AUTHORIZATION)
        && let Ok(value) = auth_header.to_str()
    {
        let identity = state.verifier.verify(bearer(value)).await?;
        request
            .extensions_mut()
            .insert::<AuthUser>(AuthUser::Verified(identity));
        return Ok(next.run(request).await);
    }

    request
        .extensions_mut()
        .insert::<AuthUser>(AuthUser::Unauthorized);
    Ok(next.run(request).await)
}
