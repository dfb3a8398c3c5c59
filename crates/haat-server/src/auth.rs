use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Uri};
use haat_kernel::{gate, Principal};
use serde::Deserialize;

use crate::directory::Directory;
use crate::error::ChatError;
use crate::AppState;

/// The authenticated principal behind a request.
///
/// Reads `Authorization: Bearer <token>`, falling back to `?token=` for
/// WebSocket upgrades from browsers.
#[derive(Debug, Clone)]
pub struct Caller(pub Principal);

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn query_token(uri: &Uri) -> Option<String> {
    let Query(query) = Query::<TokenQuery>::try_from_uri(uri).ok()?;
    query.token.filter(|t| !t.is_empty())
}

pub fn request_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    bearer_token(headers).or_else(|| query_token(uri))
}

/// Resolves a token to a principal allowed to chat: 401 when the token is
/// missing or unknown, 403 when the principal is inactive, blocked or not a
/// buyer or farmer.
pub fn authenticate(directory: &dyn Directory, token: Option<String>) -> Result<Principal, ChatError> {
    let token = token.ok_or_else(|| ChatError::Unauthorized("missing bearer token".to_string()))?;
    let principal = directory
        .authenticate(&token)
        .ok_or_else(|| ChatError::Unauthorized("invalid token".to_string()))?;
    if !gate::is_eligible(&principal) || !gate::may_use_chat(principal.role) {
        return Err(ChatError::forbidden());
    }
    Ok(principal)
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = request_token(&parts.headers, &parts.uri);
        authenticate(state.chat.directory().as_ref(), token).map(Caller)
    }
}
