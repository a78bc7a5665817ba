//! Outbound HTTP request logging for the API clients.
//!
//! Every request made through a client built with [`RequestLogMiddleware`]
//! emits one `tracing` event on completion, carrying the method, a sanitized
//! URL, the status and the elapsed time. Secrets never reach the log.

mod sanitizer;

pub use sanitizer::{Sanitizer, SENSITIVE_HEADERS, SENSITIVE_QUERY_PARAMS};

use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use std::time::Instant;
use tracing::{debug, trace, warn};

pub struct RequestLogMiddleware {
    service: &'static str,
}

impl RequestLogMiddleware {
    pub fn new(service: &'static str) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl Middleware for RequestLogMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        let method = req.method().to_string();
        let url = Sanitizer::sanitize_url(req.url());
        let headers = Sanitizer::sanitize_headers(
            req.headers()
                .iter()
                .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
        );
        trace!(service = self.service, %method, %url, ?headers, "outbound request");

        let started = Instant::now();
        let response = next.run(req, extensions).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &response {
            Ok(resp) if resp.status().is_success() => {
                debug!(
                    service = self.service,
                    %method,
                    %url,
                    status = resp.status().as_u16(),
                    elapsed_ms,
                    "request completed"
                );
            }
            Ok(resp) => {
                warn!(
                    service = self.service,
                    %method,
                    %url,
                    status = resp.status().as_u16(),
                    elapsed_ms,
                    "request returned error status"
                );
            }
            Err(err) => {
                warn!(
                    service = self.service,
                    %method,
                    %url,
                    elapsed_ms,
                    error = %sanitize_error(err),
                    "request failed"
                );
            }
        }

        response
    }
}

/// reqwest errors embed the full request URL, token included.
fn sanitize_error(err: &reqwest_middleware::Error) -> String {
    match err {
        reqwest_middleware::Error::Reqwest(inner) => match inner.url() {
            Some(url) => {
                let raw = url.to_string();
                inner.to_string().replace(&raw, &Sanitizer::sanitize_url(url))
            }
            None => inner.to_string(),
        },
        reqwest_middleware::Error::Middleware(inner) => inner.to_string(),
    }
}
