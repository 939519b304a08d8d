//! Server authentication handshakes.
//!
//! When the first response after a fresh write is `401` with a
//! `WWW-Authenticate` challenge, the connection asks its [`Authenticator`]
//! for an authorized copy of the request and resubmits it once.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::normalize::message::{get_header, set_header};

pub trait Authenticator: Send + Sync + std::fmt::Debug {
    /// Request bytes to resubmit, or `None` to give the 401 back to the caller.
    fn authorize(&self, request: &[u8], challenge: &str) -> Option<Vec<u8>>;
}

/// HTTP Basic credentials, answered only to `Basic` challenges.
#[derive(Clone)]
pub struct BasicAuth {
    token: String,
}

impl BasicAuth {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            token: STANDARD.encode(format!("{username}:{password}")),
        }
    }
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth").finish_non_exhaustive()
    }
}

impl Authenticator for BasicAuth {
    fn authorize(&self, request: &[u8], challenge: &str) -> Option<Vec<u8>> {
        let offers_basic = challenge
            .split(',')
            .any(|part| part.trim_start().to_ascii_lowercase().starts_with("basic"));
        if !offers_basic {
            return None;
        }
        // Already tried these credentials.
        if get_header(request, "authorization").is_some() {
            return None;
        }
        Some(set_header(
            request,
            "Authorization",
            &format!("Basic {}", self.token),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_basic_challenge() {
        let auth = BasicAuth::new("user", "pass");
        let request = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let retried = auth.authorize(request, "Basic realm=\"x\"").unwrap();
        assert_eq!(
            get_header(&retried, "Authorization").as_deref(),
            Some("Basic dXNlcjpwYXNz")
        );
    }

    #[test]
    fn ignores_other_schemes_and_repeats() {
        let auth = BasicAuth::new("user", "pass");
        assert!(auth
            .authorize(b"GET / HTTP/1.1\r\n\r\n", "Bearer realm=\"x\"")
            .is_none());
        assert!(auth
            .authorize(b"GET / HTTP/1.1\r\nAuthorization: Basic eA==\r\n\r\n", "Basic")
            .is_none());
    }
}
