//! Caller identity and capabilities.
//!
//! Token issuance happens upstream. The gateway forwards the authenticated
//! user as `x-user-id` / `x-user-role`; guests are identified by an opaque
//! session token.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::{header, request::Parts};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::errors::ServiceError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const SESSION_COOKIE: &str = "session_id";
pub const GUEST_SESSION: &str = "guest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Role {
    Customer,
    Seller,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
}

impl Caller {
    pub fn customer(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: Role::Customer,
        }
    }
}

/// True for roles that always buy at the wholesale tier.
pub fn is_privileged_seller(caller: Option<&Caller>) -> bool {
    matches!(
        caller.map(|c| c.role),
        Some(Role::Seller) | Some(Role::Admin)
    )
}

/// Who a cart belongs to: a user, a guest session, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CartIdentity {
    pub user_id: Option<Uuid>,
    pub session_id: Option<String>,
}

impl CartIdentity {
    pub fn new(caller: Option<&Caller>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: caller.map(|c| c.user_id),
            session_id: Some(session_id.into()),
        }
    }

    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            session_id: None,
        }
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            user_id: None,
            session_id: Some(session_id.into()),
        }
    }
}

fn caller_from_parts(parts: &Parts) -> Result<Option<Caller>, ServiceError> {
    let Some(raw_id) = parts.headers.get(USER_ID_HEADER) else {
        return Ok(None);
    };
    let user_id = raw_id
        .to_str()
        .ok()
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or_else(|| ServiceError::Unauthorized("malformed user id".into()))?;
    let role = match parts.headers.get(USER_ROLE_HEADER) {
        Some(raw) => raw
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<Role>().ok())
            .ok_or_else(|| ServiceError::Unauthorized("unknown role".into()))?,
        None => Role::Customer,
    };
    Ok(Some(Caller { user_id, role }))
}

/// Optional authenticated caller.
#[derive(Debug, Clone)]
pub struct MaybeCaller(pub Option<Caller>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeCaller
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        caller_from_parts(parts).map(MaybeCaller)
    }
}

/// Authenticated caller; rejects guests with 401.
#[derive(Debug, Clone)]
pub struct RequireCaller(pub Caller);

#[async_trait]
impl<S> FromRequestParts<S> for RequireCaller
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        caller_from_parts(parts)?
            .map(RequireCaller)
            .ok_or_else(|| ServiceError::Unauthorized("authentication required".into()))
    }
}

/// Guest session token: the `session_id` cookie, else the peer address,
/// else the shared guest token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken(pub String);

fn session_cookie(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

#[async_trait]
impl<S> FromRequestParts<S> for SessionToken
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = session_cookie(parts)
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| GUEST_SESSION.to_string());
        Ok(SessionToken(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn privileged_roles() {
        let id = Uuid::new_v4();
        assert!(!is_privileged_seller(None));
        assert!(!is_privileged_seller(Some(&Caller::customer(id))));
        assert!(is_privileged_seller(Some(&Caller {
            user_id: id,
            role: Role::Seller
        })));
        assert!(is_privileged_seller(Some(&Caller {
            user_id: id,
            role: Role::Admin
        })));
    }

    #[tokio::test]
    async fn caller_is_read_from_gateway_headers() {
        let id = Uuid::new_v4();
        let mut p = parts(
            Request::builder()
                .header(USER_ID_HEADER, id.to_string())
                .header(USER_ROLE_HEADER, "Seller"),
        );
        let MaybeCaller(caller) = MaybeCaller::from_request_parts(&mut p, &()).await.unwrap();
        assert_eq!(
            caller,
            Some(Caller {
                user_id: id,
                role: Role::Seller
            })
        );
    }

    #[tokio::test]
    async fn malformed_user_id_is_unauthorized() {
        let mut p = parts(Request::builder().header(USER_ID_HEADER, "nope"));
        assert!(MaybeCaller::from_request_parts(&mut p, &()).await.is_err());
    }

    #[tokio::test]
    async fn session_prefers_cookie_then_guest() {
        let mut p = parts(Request::builder().header(header::COOKIE, "a=1; session_id=abc"));
        let SessionToken(token) = SessionToken::from_request_parts(&mut p, &()).await.unwrap();
        assert_eq!(token, "abc");

        let mut p = parts(Request::builder());
        let SessionToken(token) = SessionToken::from_request_parts(&mut p, &()).await.unwrap();
        assert_eq!(token, GUEST_SESSION);
    }
}
