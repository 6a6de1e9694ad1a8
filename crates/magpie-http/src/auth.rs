//! Peer authentication: bearer tokens matched against the librarians table.

use axum::{
    extract::{Request, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};

use crate::AppState;

/// The authenticated peer, attached to the request for handlers.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub name: String,
}

pub async fn require_peer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer);

    let Some(token) = token else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    match state.catalog.librarian_by_token(token).await {
        Ok(Some(librarian)) => {
            request.extensions_mut().insert(PeerIdentity {
                name: librarian.name,
            });
            Ok(next.run(request).await)
        }
        Ok(None) => Err(StatusCode::UNAUTHORIZED),
        Err(e) => {
            tracing::error!("token lookup failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn parse_bearer(header: &str) -> Option<&str> {
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() { None } else { Some(token) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_tokens() {
        assert_eq!(parse_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(parse_bearer("Bearer  spaced "), Some("spaced"));
    }

    #[test]
    fn rejects_other_schemes_and_empties() {
        assert_eq!(parse_bearer("Basic abc123"), None);
        assert_eq!(parse_bearer("Bearer "), None);
        assert_eq!(parse_bearer("abc123"), None);
    }
}
