#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Tag-keyed leaky-bucket rate limiting middleware for tower services.
//!
//! Requests are grouped by a *tag* (client IP, a cookie or header value, a
//! typed request extension, or a fixed global tag) and each tag draws
//! tokens from its own continuously-refilling bucket. A request that drains
//! any bucket dry is answered with `429 Too Many Requests`; everything else
//! reaches the inner service with `X-RateLimit-*` headers describing an
//! obfuscated view of the limit.
//!
//! ## Architecture
//!
//! - **Accounting**: [`Rate`] describes throughput, [`LeakyBucket`] holds
//!   one tag's balance.
//! - **Storage**: [`MemoryStore`] (mutex-guarded map) and [`SqlStore`]
//!   (one row per tag) implement the [`Limiter`] contract and evict idle
//!   buckets in the background.
//! - **Request glue**: a [`Tagger`] derives the tag, a [`RequestLimiter`]
//!   pairs it with storage.
//! - **Middleware**: [`RateLimitLayer`] evaluates every registered limiter
//!   per request and writes headers through a [`HeaderWriter`].
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use tollgate::{
//!     CookieTagger, MemoryStore, PeerIpTagger, Rate, RateLimitLayer, TaggedLimiter,
//! };
//! use tower::{service_fn, ServiceBuilder};
//!
//! # async fn quick_start() -> Result<(), Box<dyn std::error::Error>> {
//! let per_ip = TaggedLimiter::new(
//!     PeerIpTagger::new(),
//!     MemoryStore::new(Rate::new(100.0, Duration::from_secs(1))?),
//! );
//! let per_session = TaggedLimiter::new(
//!     CookieTagger::new("sessionUUID")?,
//!     MemoryStore::new(Rate::new(10.0, Duration::from_secs(1))?),
//! );
//!
//! let layer = RateLimitLayer::builder()
//!     .limiter("internetProtocolAddress", per_ip)
//!     .limiter("cookie:sessionUUID", per_session)
//!     .build()?;
//!
//! let service = ServiceBuilder::new().layer(layer).service(service_fn(
//!     |_request: http::Request<String>| async {
//!         Ok::<_, std::convert::Infallible>(http::Response::new(String::from("hello")))
//!     },
//! ));
//! # let _ = service;
//! # Ok(())
//! # }
//! ```
//!
//! Servers must insert a [`PeerAddr`] request extension for IP tagging to
//! work; axum users can map it from `ConnectInfo<SocketAddr>`.

pub mod bucket;
pub mod clock;
pub mod error;
pub mod headers;
pub mod limiter;
pub mod middleware;
pub mod rate;
pub mod request;
pub mod store;
pub mod tag;

// Re-exports
pub use bucket::LeakyBucket;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BuildError, LimiterError};
pub use headers::{HeaderWriter, ObfuscatingHeaderWriter, SilentHeaderWriter};
pub use limiter::{Decision, Limiter};
pub use middleware::{RateLimit, RateLimitBuilder, RateLimitLayer};
pub use rate::Rate;
pub use request::{
    FilteredLimiter, RequestLimiter, SingleBucketLimiter, StaticLimiter, TaggedLimiter,
};
pub use store::memory::{MemoryStore, MemoryStoreBuilder};
pub use store::sql::{sqlite_pool, sqlite_pool_from_env, SqlStore, SqlStoreBuilder};
pub use tag::{
    CookieTagger, ExtensionTagger, HeaderTagger, MissingTag, PeerAddr, PeerIpTagger, SkipList,
    TagOutcome, Tagger,
};
