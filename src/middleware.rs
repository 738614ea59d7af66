//! Tower middleware that gates an inner service behind named limiters.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{Request, Response, StatusCode};
use tower_layer::Layer;
use tower_service::Service;
use tracing::{error, warn};

use crate::error::BuildError;
use crate::headers::{HeaderWriter, ObfuscatingHeaderWriter};
use crate::rate::Rate;
use crate::request::RequestLimiter;

/// A layer that evaluates every registered [`RequestLimiter`] per request.
///
/// All limiters are consulted, and debited, even after one has already
/// rejected the request, so a client hammering one axis cannot preserve its
/// budget on the others. The smallest balance any limiter reports is handed
/// to the [`HeaderWriter`].
///
/// Rejected requests receive `429 Too Many Requests`; a limiter transport
/// failure produces `500 Internal Server Error`. Neither reaches the inner
/// service.
#[derive(Clone)]
pub struct RateLimitLayer {
    shared: Arc<Shared>,
}

struct Shared {
    entries: Vec<(String, Box<dyn RequestLimiter>)>,
    writer: Box<dyn HeaderWriter>,
}

impl RateLimitLayer {
    /// Start assembling a middleware from named limiters.
    pub fn builder() -> RateLimitBuilder {
        RateLimitBuilder { entries: Vec::new(), writer: None }
    }
}

impl std::fmt::Debug for RateLimitLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("limiters", &self.shared.entries.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimit { inner, shared: self.shared.clone() }
    }
}

/// Configures a [`RateLimitLayer`].
pub struct RateLimitBuilder {
    entries: Vec<(String, Box<dyn RequestLimiter>)>,
    writer: Option<Box<dyn HeaderWriter>>,
}

impl RateLimitBuilder {
    /// Register `limiter` under `name`. Limiters run in registration order;
    /// names must be unique and are reported in logs when they reject.
    pub fn limiter(mut self, name: impl Into<String>, limiter: impl RequestLimiter + 'static) -> Self {
        self.entries.push((name.into(), Box::new(limiter)));
        self
    }

    /// Replace the default header writer.
    pub fn header_writer(mut self, writer: impl HeaderWriter + 'static) -> Self {
        self.writer = Some(Box::new(writer));
        self
    }

    /// Validate and produce the layer.
    ///
    /// When no header writer was chosen, an [`ObfuscatingHeaderWriter`] is
    /// built from the slowest registered rate, the worst case a client can
    /// rely on.
    ///
    /// # Errors
    /// Returns [`BuildError::NoLimiters`] for an empty builder and
    /// [`BuildError::DuplicateName`] for a reused limiter name.
    pub fn build(self) -> Result<RateLimitLayer, BuildError> {
        if self.entries.is_empty() {
            return Err(BuildError::NoLimiters);
        }
        for (i, (name, _)) in self.entries.iter().enumerate() {
            if self.entries[..i].iter().any(|(earlier, _)| earlier == name) {
                return Err(BuildError::DuplicateName(name.clone()));
            }
        }
        let writer = match self.writer {
            Some(writer) => writer,
            None => Box::new(ObfuscatingHeaderWriter::new(&slowest_rate(&self.entries))),
        };
        Ok(RateLimitLayer { shared: Arc::new(Shared { entries: self.entries, writer }) })
    }
}

fn slowest_rate(entries: &[(String, Box<dyn RequestLimiter>)]) -> Rate {
    let mut slowest = *entries[0].1.rate();
    for (_, limiter) in &entries[1..] {
        if limiter.rate().slower_than(&slowest) {
            slowest = *limiter.rate();
        }
    }
    slowest
}

/// The middleware service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimit<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> std::fmt::Debug for RateLimit<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimit").finish_non_exhaustive()
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimit<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // Swap in the clone so the service we call is the one poll_ready
        // vouched for.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let shared = self.shared.clone();

        Box::pin(async move {
            let (head, body) = request.into_parts();

            let mut least_remaining = f64::INFINITY;
            let mut rejected: Vec<&str> = Vec::new();
            for (name, limiter) in &shared.entries {
                match limiter.take(&head).await {
                    Ok(decision) => {
                        least_remaining = least_remaining.min(decision.remaining());
                        if !decision.is_allowed() {
                            rejected.push(name.as_str());
                        }
                    }
                    Err(e) => {
                        error!(limiter = %name, error = %e, "rate limiter failed");
                        let mut response = Response::new(ResBody::from(format!(
                            "rate limiter {:?} failed: {}",
                            name, e
                        )));
                        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        shared.writer.errored(response.headers_mut());
                        return Ok(response);
                    }
                }
            }

            if !rejected.is_empty() {
                warn!(rejected_by = ?rejected, "request over rate limit");
                let reason = StatusCode::TOO_MANY_REQUESTS
                    .canonical_reason()
                    .unwrap_or("Too Many Requests");
                let mut response = Response::new(ResBody::from(reason.to_string()));
                *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
                shared.writer.denied(response.headers_mut(), least_remaining);
                return Ok(response);
            }

            let mut response = inner.call(Request::from_parts(head, body)).await?;
            shared.writer.allowed(response.headers_mut(), least_remaining);
            Ok(response)
        })
    }
}
