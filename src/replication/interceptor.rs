//! HTTP interceptors
//!
//! An interceptor sees every outgoing request and every response,
//! in registration order. The request half may mutate headers (cookie
//! auth, IAM tokens); the response half decides whether the request
//! should be replayed, which is how a cookie interceptor reacts to a 401
//! by renewing its session and asking for one retry.

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};

use super::errors::{ReplicationError, ReplicationResult};

/// Mutable view of an outgoing request.
#[derive(Debug)]
pub struct RequestContext {
    pub request: reqwest::Request,
}

/// View of a response handed to the response half.
#[derive(Debug, Clone, Copy)]
pub struct ResponseContext {
    pub status: reqwest::StatusCode,
    /// Zero-based replay count for this logical request.
    pub attempt: u32,
}

/// Verdict from the response half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptOutcome {
    /// Accept the response as-is.
    Continue,
    /// Replay the request (once per interceptor per logical request).
    Retry,
}

/// Request/response mutator in the replication HTTP path.
#[async_trait]
pub trait HttpInterceptor: Send + Sync {
    async fn intercept_request(&self, ctx: &mut RequestContext) -> ReplicationResult<()> {
        let _ = ctx;
        Ok(())
    }

    async fn intercept_response(&self, ctx: ResponseContext) -> ReplicationResult<InterceptOutcome> {
        let _ = ctx;
        Ok(InterceptOutcome::Continue)
    }
}

/// Basic-auth header injection, built automatically from credentials on
/// the source URL.
pub struct BasicAuthInterceptor {
    value: HeaderValue,
}

impl BasicAuthInterceptor {
    pub fn new(username: &str, password: &str) -> ReplicationResult<Self> {
        let token = data_encoding::BASE64.encode(format!("{username}:{password}").as_bytes());
        let mut value = HeaderValue::from_str(&format!("Basic {token}"))
            .map_err(|e| ReplicationError::Configuration(e.to_string()))?;
        value.set_sensitive(true);
        Ok(Self { value })
    }
}

#[async_trait]
impl HttpInterceptor for BasicAuthInterceptor {
    async fn intercept_request(&self, ctx: &mut RequestContext) -> ReplicationResult<()> {
        ctx.request
            .headers_mut()
            .insert(AUTHORIZATION, self.value.clone());
        Ok(())
    }
}

/// Static extra headers from the replication options.
pub(crate) struct OptionalHeadersInterceptor {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl OptionalHeadersInterceptor {
    pub(crate) fn new(headers: &[(String, String)]) -> ReplicationResult<Self> {
        let mut out = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ReplicationError::Configuration(format!("header {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ReplicationError::Configuration(format!("header {name:?}: {e}")))?;
            out.push((name, value));
        }
        Ok(Self { headers: out })
    }
}

#[async_trait]
impl HttpInterceptor for OptionalHeadersInterceptor {
    async fn intercept_request(&self, ctx: &mut RequestContext) -> ReplicationResult<()> {
        for (name, value) in &self.headers {
            ctx.request.headers_mut().insert(name.clone(), value.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_auth_sets_header() {
        let interceptor = BasicAuthInterceptor::new("user", "pass").unwrap();
        let request = reqwest::Request::new(
            reqwest::Method::GET,
            url::Url::parse("http://example.com/db").unwrap(),
        );
        let mut ctx = RequestContext { request };
        interceptor.intercept_request(&mut ctx).await.unwrap();

        let value = ctx.request.headers().get(AUTHORIZATION).unwrap();
        // base64("user:pass")
        assert_eq!(value.to_str().unwrap(), "Basic dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn test_default_response_half_continues() {
        let interceptor = BasicAuthInterceptor::new("u", "p").unwrap();
        let outcome = interceptor
            .intercept_response(ResponseContext {
                status: reqwest::StatusCode::OK,
                attempt: 0,
            })
            .await
            .unwrap();
        assert_eq!(outcome, InterceptOutcome::Continue);
    }
}
