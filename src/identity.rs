//! Who is acting on a request: a signed-in user or a guest.
//!
//! Guests are keyed by session (`X-Session-Key` header or `sessionid`
//! cookie) and otherwise by client IP. The same key is used for like
//! uniqueness and for attributing guest posts and comments.
//!
//! The client IP is the socket peer. Forwarding headers are only consulted
//! when `trust_proxy_headers` is set, since any client can send them.

use std::{collections::HashMap, convert::Infallible, net::SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRef, FromRequestParts},
    http::{HeaderMap, header::COOKIE, request::Parts},
};
use serde::Serialize;
use sqlx::FromRow;

use crate::{
    error::ApiResult,
    models::User,
    routes::auth::extract_optional_user,
    state::AppState,
};

pub const SESSION_HEADER: &str = "x-session-key";
pub const SESSION_COOKIE: &str = "sessionid";
pub const DEFAULT_GUEST_NAME: &str = "Guest";

/// Transport-level facts about the caller, available on every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub session_key: Option<String>,
    pub ip: String,
}

impl ClientIdentity {
    pub fn from_parts(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> Self {
        let session_key = header_value(headers, SESSION_HEADER)
            .or_else(|| {
                headers
                    .get(COOKIE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|cookies| extract_cookie_value(cookies, SESSION_COOKIE))
            })
            .filter(|key| !key.is_empty());

        let forwarded = || {
            header_value(headers, "x-forwarded-for")
                .and_then(|chain| chain.split(',').next().map(|hop| hop.trim().to_string()))
                .filter(|hop| !hop.is_empty())
                .or_else(|| header_value(headers, "x-real-ip"))
        };
        let ip = trust_proxy
            .then(forwarded)
            .flatten()
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());

        Self { session_key, ip }
    }

    pub fn guest_identifier(&self) -> String {
        match &self.session_key {
            Some(key) => format!("session:{key}"),
            None => format!("ip:{}", self.ip),
        }
    }
}

impl<S> FromRequestParts<S> for ClientIdentity
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self::from_parts(
            &parts.headers,
            peer,
            state.config.trust_proxy_headers,
        ))
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_cookie_value(cookie_header: &str, key: &str) -> Option<String> {
    cookie_header
        .split(';')
        .find_map(|cookie| {
            let cookie = cookie.trim();
            cookie.strip_prefix(&format!("{}=", key))
        })
        .map(ToString::to_string)
}

/// Self-reported guest details from a request body.
#[derive(Debug, Clone, Default)]
pub struct GuestDetails {
    pub name: Option<String>,
    pub affiliation: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestActor {
    pub name: String,
    pub affiliation: String,
    pub email: Option<String>,
    pub identifier: String,
}

#[derive(Debug, Clone)]
pub enum Actor {
    Authenticated(User),
    Guest(GuestActor),
}

/// Like ownership key, borrowed from an [`Actor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorKey<'a> {
    User(i64),
    Guest(&'a str),
}

impl Actor {
    pub fn resolve(user: Option<User>, client: &ClientIdentity, details: GuestDetails) -> Self {
        match user {
            Some(user) => Self::Authenticated(user),
            None => {
                let trimmed = |value: Option<String>| {
                    value
                        .map(|v| v.trim().to_string())
                        .filter(|v| !v.is_empty())
                };
                Self::Guest(GuestActor {
                    name: trimmed(details.name).unwrap_or_else(|| DEFAULT_GUEST_NAME.to_string()),
                    affiliation: trimmed(details.affiliation).unwrap_or_default(),
                    email: trimmed(details.email),
                    identifier: client.guest_identifier(),
                })
            }
        }
    }

    pub fn key(&self) -> ActorKey<'_> {
        match self {
            Self::Authenticated(user) => ActorKey::User(user.id),
            Self::Guest(guest) => ActorKey::Guest(&guest.identifier),
        }
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            Self::Authenticated(user) => Some(user),
            Self::Guest(_) => None,
        }
    }

    pub fn user_id(&self) -> Option<i64> {
        self.user().map(|user| user.id)
    }

    pub fn is_admin(&self) -> bool {
        self.user().is_some_and(User::is_admin)
    }

    /// Bucket name for per-actor throttles.
    pub fn throttle_key(&self) -> String {
        match self {
            Self::Authenticated(user) => format!("user:{}", user.id),
            Self::Guest(guest) => guest.identifier.clone(),
        }
    }
}

/// Resolves the acting identity; an invalid or absent token means guest.
pub async fn resolve_actor(
    state: &AppState,
    headers: &HeaderMap,
    client: &ClientIdentity,
    details: GuestDetails,
) -> ApiResult<Actor> {
    let user = extract_optional_user(state, headers).await?;
    Ok(Actor::resolve(user, client, details))
}

#[derive(Debug, Clone, FromRow)]
pub struct AuthorSummary {
    pub id: i64,
    pub username: String,
    pub affiliation: String,
}

/// Public attribution of a post or comment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AuthorView {
    User {
        id: i64,
        username: String,
        affiliation: String,
    },
    Guest {
        name: String,
        affiliation: String,
    },
}

impl AuthorView {
    pub fn resolve(
        author_id: Option<i64>,
        guest_name: Option<&str>,
        guest_affiliation: Option<&str>,
        authors: &HashMap<i64, AuthorSummary>,
    ) -> Self {
        match author_id.and_then(|id| authors.get(&id)) {
            Some(author) => Self::User {
                id: author.id,
                username: author.username.clone(),
                affiliation: author.affiliation.clone(),
            },
            None => Self::Guest {
                name: guest_name.unwrap_or(DEFAULT_GUEST_NAME).to_string(),
                affiliation: guest_affiliation.unwrap_or_default().to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::Utc;

    fn user(id: i64) -> User {
        User {
            id,
            username: "ada".to_string(),
            email: "ada@example.org".to_string(),
            hashed_password: String::new(),
            role: "user".to_string(),
            email_verified: true,
            affiliation: "Analytical Engines".to_string(),
            is_active: true,
            date_joined: Utc::now(),
            updated_at: None,
        }
    }

    fn peer() -> SocketAddr {
        "198.51.100.4:55000".parse().expect("valid addr")
    }

    #[test]
    fn session_key_beats_ip() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; sessionid=abc123"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));

        let client = ClientIdentity::from_parts(&headers, None, true);
        assert_eq!(client.session_key.as_deref(), Some("abc123"));
        assert_eq!(client.ip, "203.0.113.7");
        assert_eq!(client.guest_identifier(), "session:abc123");
    }

    #[test]
    fn ip_falls_back_to_peer_address() {
        let client = ClientIdentity::from_parts(&HeaderMap::new(), Some(peer()), true);
        assert_eq!(client.guest_identifier(), "ip:198.51.100.4");
    }

    #[test]
    fn forwarding_headers_are_ignored_unless_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.8"));

        let direct = ClientIdentity::from_parts(&headers, Some(peer()), false);
        assert_eq!(direct.ip, "198.51.100.4");

        let proxied = ClientIdentity::from_parts(&headers, Some(peer()), true);
        assert_eq!(proxied.ip, "203.0.113.7");

        headers.remove("x-forwarded-for");
        let proxied = ClientIdentity::from_parts(&headers, Some(peer()), true);
        assert_eq!(proxied.ip, "203.0.113.8");
    }

    #[test]
    fn guest_resolution_fills_defaults() {
        let client = ClientIdentity {
            session_key: None,
            ip: "192.0.2.1".to_string(),
        };
        let actor = Actor::resolve(
            None,
            &client,
            GuestDetails {
                name: Some("  ".to_string()),
                affiliation: Some(" Field Lab ".to_string()),
                email: None,
            },
        );
        match actor {
            Actor::Guest(guest) => {
                assert_eq!(guest.name, DEFAULT_GUEST_NAME);
                assert_eq!(guest.affiliation, "Field Lab");
                assert_eq!(guest.identifier, "ip:192.0.2.1");
            }
            Actor::Authenticated(_) => panic!("expected a guest"),
        }
    }

    #[test]
    fn authenticated_actor_keys_by_user_id() {
        let client = ClientIdentity {
            session_key: Some("s".to_string()),
            ip: "192.0.2.1".to_string(),
        };
        let actor = Actor::resolve(Some(user(7)), &client, GuestDetails::default());
        assert_eq!(actor.key(), ActorKey::User(7));
        assert_eq!(actor.throttle_key(), "user:7");
    }

    #[test]
    fn author_view_serialises_with_kind_tag() {
        let mut authors = HashMap::new();
        authors.insert(
            3,
            AuthorSummary {
                id: 3,
                username: "grace".to_string(),
                affiliation: "Navy".to_string(),
            },
        );

        let view = AuthorView::resolve(Some(3), None, None, &authors);
        let json = serde_json::to_value(&view).expect("serialises");
        assert_eq!(json["kind"], "user");
        assert_eq!(json["username"], "grace");

        let guest = AuthorView::resolve(None, Some("Visitor"), Some("Co-op"), &authors);
        let json = serde_json::to_value(&guest).expect("serialises");
        assert_eq!(json["kind"], "guest");
        assert_eq!(json["name"], "Visitor");
    }
}
