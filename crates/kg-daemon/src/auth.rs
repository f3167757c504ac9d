//! Bearer-token authentication and RBAC enforcement (spec §6.3, §4.8).
//!
//! Every request resolves to an [`Identity`] before it reaches a handler:
//! a valid `Authorization: Bearer <token>` header resolves through
//! [`TokenValidator`], a missing or invalid one falls back to an
//! unauthenticated identity scoped to the implicit `public` group — unless
//! auth is disabled in configuration, this unauthenticated identity still
//! has to clear the same [`AuthorizationKernel`] checks as everyone else.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use kg_auth::Identity;
use kg_clock::{PUBLIC_GROUP_ID, PUBLIC_USER_ID};

use crate::state::AppState;

/// The role assigned to requests that did not present a valid bearer
/// token. Carries no permissions of its own in the built-in role chain;
/// access is governed entirely by resource grants to the public group.
pub const PUBLIC_ROLE: &str = "public";

fn public_identity() -> Identity {
    Identity { user_id: PUBLIC_USER_ID, username: "public".to_string(), role: PUBLIC_ROLE.to_string(), group_ids: Vec::new() }
}

/// Resolve the caller's [`Identity`] from the `Authorization` header and
/// insert it as a request extension for handlers and the permission
/// extractor to read.
pub async fn resolve_identity(State(state): State<Arc<AppState>>, mut req: Request, next: Next) -> Response {
    let auth_enabled = state.config.read().await.auth_enabled;
    let token = auth_enabled
        .then(|| {
            req.headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
        })
        .flatten();

    let identity = match token {
        Some(token) => state.token_validator.validate(token).await.unwrap_or_else(public_identity),
        None => public_identity(),
    };

    req.extensions_mut().insert(identity);
    next.run(req).await
}
