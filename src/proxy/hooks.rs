//! Extension points for hijack mode.
//!
//! Rewrite hooks run inline and block the exchange until they return.
//! Mirror hooks get a copy of the finished exchange on a blocking worker and
//! never hold up forwarding.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// `(is_https, raw) -> raw'`
pub type RewriteHook = Arc<dyn Fn(bool, &[u8]) -> Vec<u8> + Send + Sync>;

/// Observes a finished exchange.
pub type MirrorHook = Arc<dyn Fn(&InterceptedExchange) + Send + Sync>;

/// One request/response pair seen in hijack mode.
#[derive(Debug, Clone)]
pub struct InterceptedExchange {
    pub id: Uuid,
    /// Request as the client sent it, before any rewrite.
    pub request: Vec<u8>,
    /// Response as the origin sent it, before any rewrite.
    pub response: Vec<u8>,
    pub is_https: bool,
    /// True when a rewrite hook changed the request or the response.
    pub hijacked: bool,
}

#[derive(Clone, Default)]
pub struct Hooks {
    request: Option<RewriteHook>,
    response: Option<RewriteHook>,
    mirrors: Vec<MirrorHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(bool, &[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.request = Some(Arc::new(hook));
        self
    }

    pub fn on_response<F>(mut self, hook: F) -> Self
    where
        F: Fn(bool, &[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.response = Some(Arc::new(hook));
        self
    }

    pub fn mirror<F>(mut self, hook: F) -> Self
    where
        F: Fn(&InterceptedExchange) + Send + Sync + 'static,
    {
        self.mirrors.push(Arc::new(hook));
        self
    }

    pub fn rewrite_request(&self, is_https: bool, raw: &[u8]) -> Vec<u8> {
        match &self.request {
            Some(hook) => hook(is_https, raw),
            None => raw.to_vec(),
        }
    }

    pub fn rewrite_response(&self, is_https: bool, raw: &[u8]) -> Vec<u8> {
        match &self.response {
            Some(hook) => hook(is_https, raw),
            None => raw.to_vec(),
        }
    }

    pub fn has_mirrors(&self) -> bool {
        !self.mirrors.is_empty()
    }

    /// Hand `exchange` to every mirror hook without waiting for them.
    pub fn mirror_exchange(&self, exchange: InterceptedExchange) {
        if self.mirrors.is_empty() {
            return;
        }
        let mirrors = self.mirrors.clone();
        let exchange = Arc::new(exchange);
        tokio::task::spawn_blocking(move || {
            for hook in &mirrors {
                hook(&exchange);
            }
        });
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("request", &self.request.is_some())
            .field("response", &self.response.is_some())
            .field("mirrors", &self.mirrors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn passthrough_without_hooks() {
        let hooks = Hooks::new();
        assert_eq!(hooks.rewrite_request(false, b"GET /"), b"GET /");
        assert_eq!(hooks.rewrite_response(true, b"HTTP/1.1 200"), b"HTTP/1.1 200");
    }

    #[test]
    fn request_hook_sees_scheme() {
        let hooks = Hooks::new().on_request(|https, raw| {
            let mut out = raw.to_vec();
            out.extend_from_slice(if https { b" tls" } else { b" plain" });
            out
        });
        assert_eq!(hooks.rewrite_request(true, b"x"), b"x tls");
    }

    #[tokio::test]
    async fn mirrors_run_off_the_forwarding_path() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hooks = {
            let seen = seen.clone();
            Hooks::new().mirror(move |exchange| seen.lock().unwrap().push(exchange.request.clone()))
        };
        hooks.mirror_exchange(InterceptedExchange {
            id: Uuid::new_v4(),
            request: b"GET / HTTP/1.1\r\n\r\n".to_vec(),
            response: Vec::new(),
            is_https: false,
            hijacked: false,
        });
        for _ in 0..50 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
