//! HTTP basic authentication and task ownership.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::routes::ApiError;
use super::AppState;
use crate::config::BasicCredential;
use crate::config::secrets::secret_matches;
use crate::error::Error;

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// `None` when authentication is disabled.
    pub user: Option<String>,
    pub admin: bool,
}

impl Caller {
    /// The caller when no credentials are configured: sees everything.
    pub fn anonymous() -> Self {
        Self {
            user: None,
            admin: true,
        }
    }

    pub fn user(name: impl Into<String>, admin: bool) -> Self {
        Self {
            user: Some(name.into()),
            admin,
        }
    }

    /// May this caller see a task created by `owner`?
    pub fn can_access(&self, owner: Option<&str>) -> bool {
        self.admin || (self.user.is_some() && self.user.as_deref() == owner)
    }

    /// Restrict listings to this caller's tasks unless they are an admin.
    pub fn owner_filter(&self) -> Option<String> {
        if self.admin { None } else { self.user.clone() }
    }
}

/// Checks `Authorization: Basic` headers against configured users.
pub struct Authenticator {
    creds: Vec<BasicCredential>,
}

impl Authenticator {
    pub fn new(creds: Vec<BasicCredential>) -> Self {
        Self { creds }
    }

    pub fn enabled(&self) -> bool {
        !self.creds.is_empty()
    }

    /// Resolve the caller from an `Authorization` header value.
    pub fn authenticate(&self, header: Option<&str>) -> Result<Caller, Error> {
        if !self.enabled() {
            return Ok(Caller::anonymous());
        }
        let encoded = header
            .and_then(|h| h.strip_prefix("Basic "))
            .ok_or(Error::Unauthorized)?;
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|_| Error::Unauthorized)?;
        let decoded = String::from_utf8(decoded).map_err(|_| Error::Unauthorized)?;
        let (user, password) = decoded.split_once(':').ok_or(Error::Unauthorized)?;

        self.creds
            .iter()
            .find(|c| c.user == user && secret_matches(&c.password, password))
            .map(|c| Caller::user(&c.user, c.admin))
            .ok_or(Error::Unauthorized)
    }
}

/// Middleware: attach the [`Caller`] to the request or reject it.
pub async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match state.auth.authenticate(header) {
        Ok(caller) => {
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// `Authorization` header value for a client request.
pub fn basic_header(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn auth() -> Authenticator {
        Authenticator::new(vec![
            BasicCredential {
                user: "alice".into(),
                password: SecretString::from("wonderland"),
                admin: false,
            },
            BasicCredential {
                user: "root".into(),
                password: SecretString::from("toor"),
                admin: true,
            },
        ])
    }

    #[test]
    fn accepts_configured_users() {
        let auth = auth();
        let caller = auth
            .authenticate(Some(&basic_header("alice", "wonderland")))
            .unwrap();
        assert_eq!(caller, Caller::user("alice", false));
        assert!(caller.can_access(Some("alice")));
        assert!(!caller.can_access(Some("bob")));
        assert!(!caller.can_access(None));

        let root = auth.authenticate(Some(&basic_header("root", "toor"))).unwrap();
        assert!(root.can_access(Some("alice")));
    }

    #[test]
    fn rejects_bad_credentials() {
        let auth = auth();
        assert!(auth.authenticate(None).is_err());
        assert!(auth.authenticate(Some(&basic_header("alice", "wrong"))).is_err());
        assert!(auth.authenticate(Some("Bearer abc")).is_err());
        assert!(auth.authenticate(Some("Basic !!!")).is_err());
    }

    #[test]
    fn disabled_auth_admits_everyone() {
        let auth = Authenticator::new(Vec::new());
        assert_eq!(auth.authenticate(None).unwrap(), Caller::anonymous());
    }
}
