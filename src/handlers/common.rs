use std::net::SocketAddr;

use axum::{
    extract::ConnectInfo,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use validator::Validate;

use crate::auth::SessionToken;
use crate::errors::ServiceError;

/// Standard success response
pub fn success_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(data)).into_response()
}

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(data)).into_response()
}

/// Validate request input
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ServiceError> {
    input.validate().map_err(ServiceError::from)
}

/// Rate-limit key for the caller: the peer address when known, else the
/// guest session token.
pub fn client_key(peer: Option<&ConnectInfo<SocketAddr>>, session: &SessionToken) -> String {
    peer.map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| session.0.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_key_prefers_peer_address() {
        let session = SessionToken("sess-1".into());
        let peer = ConnectInfo("10.0.0.7:5555".parse::<SocketAddr>().unwrap());
        assert_eq!(client_key(Some(&peer), &session), "10.0.0.7");
        assert_eq!(client_key(None, &session), "sess-1");
    }
}
