//! Taggers derive the grouping tag for an HTTP request.
//!
//! A tag is an opaque non-empty string; requests that share a tag share a
//! bucket. A tagger may instead signal [`TagOutcome::Skip`] to exempt the
//! request from its limiter entirely, or fail with a [`LimiterError`] when
//! the request is malformed.
//!
//! Taggers read the request *head* ([`http::request::Parts`]) only; bodies
//! never influence tagging.

use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::net::SocketAddr;

use http::header::COOKIE;
use http::request::Parts;
use http::HeaderName;

use crate::error::{BuildError, LimiterError};

/// What a tagger made of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOutcome {
    /// Group the request under this tag.
    Tag(String),
    /// Exempt the request from this limiter.
    Skip,
}

/// A pure function from a request head to a [`TagOutcome`].
pub trait Tagger: Send + Sync {
    /// Derive the tag for the request head.
    fn tag(&self, head: &Parts) -> Result<TagOutcome, LimiterError>;
}

/// The connected peer's address, inserted into request extensions by the
/// server glue (e.g. from `axum::extract::ConnectInfo` or the accept loop).
///
/// [`PeerIpTagger`] reads this extension; it never parses proxy headers,
/// which belong to an explicit [`HeaderTagger`] choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Tags requests by client IP address, with or without the source port.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerIpTagger {
    with_port: bool,
}

impl PeerIpTagger {
    /// Tag by bare IP address, folding every port from one host together.
    pub fn new() -> Self {
        Self { with_port: false }
    }

    /// Tag by `ip:port`. Slightly cheaper, but gives every connection from
    /// one host its own bucket.
    pub fn with_port() -> Self {
        Self { with_port: true }
    }
}

impl Tagger for PeerIpTagger {
    fn tag(&self, head: &Parts) -> Result<TagOutcome, LimiterError> {
        let PeerAddr(addr) = head
            .extensions
            .get::<PeerAddr>()
            .copied()
            .ok_or(LimiterError::PeerAddress)?;
        Ok(TagOutcome::Tag(if self.with_port {
            addr.to_string()
        } else {
            addr.ip().to_string()
        }))
    }
}

/// Wraps a tagger so that listed tags skip the limiter.
///
/// Typical use: exempting health-check or internal addresses from an IP
/// limiter.
#[derive(Debug, Clone)]
pub struct SkipList<T> {
    inner: T,
    skip: HashSet<String>,
}

impl<T> SkipList<T> {
    /// Wrap `inner`, skipping every tag in `tags`.
    ///
    /// # Errors
    /// Returns [`BuildError::InvalidSkipList`] when `tags` is empty or
    /// repeats an entry.
    pub fn new<I, S>(inner: T, tags: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut skip = HashSet::new();
        for tag in tags {
            let tag = tag.into();
            if !skip.insert(tag.clone()) {
                return Err(BuildError::InvalidSkipList(format!("tag {:?} listed twice", tag)));
            }
        }
        if skip.is_empty() {
            return Err(BuildError::InvalidSkipList("no tags listed".to_string()));
        }
        Ok(Self { inner, skip })
    }
}

impl<T: Tagger> Tagger for SkipList<T> {
    fn tag(&self, head: &Parts) -> Result<TagOutcome, LimiterError> {
        match self.inner.tag(head)? {
            TagOutcome::Tag(tag) if self.skip.contains(&tag) => Ok(TagOutcome::Skip),
            outcome => Ok(outcome),
        }
    }
}

/// Policy for requests that lack the cookie, header, or extension a tagger
/// keys on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingTag {
    /// Exempt such requests from the limiter.
    Skip,
    /// Group all such requests into one shared bucket under this tag.
    Shared(String),
}

impl MissingTag {
    fn outcome(&self) -> TagOutcome {
        match self {
            Self::Skip => TagOutcome::Skip,
            Self::Shared(tag) => TagOutcome::Tag(tag.clone()),
        }
    }
}

/// Tags requests by the value of a named cookie.
///
/// Cookie-less clients share one bucket by default, so a client cannot
/// escape the limit by withholding the cookie.
#[derive(Debug, Clone)]
pub struct CookieTagger {
    name: String,
    missing: MissingTag,
}

impl CookieTagger {
    /// Tag by the cookie `name`.
    ///
    /// # Errors
    /// Returns [`BuildError::InvalidName`] unless `name` is a valid cookie
    /// name token.
    pub fn new(name: impl Into<String>) -> Result<Self, BuildError> {
        let name = name.into();
        validate_field_name(&name)?;
        let missing = MissingTag::Shared(format!("<cookie {:?} absent>", name));
        Ok(Self { name, missing })
    }

    /// The cookie name this tagger reads.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the absent-cookie policy.
    pub fn when_missing(mut self, missing: MissingTag) -> Self {
        self.missing = missing;
        self
    }
}

impl Tagger for CookieTagger {
    fn tag(&self, head: &Parts) -> Result<TagOutcome, LimiterError> {
        // Only the first Cookie header counts; a smuggled duplicate cannot
        // override the tag.
        let value = head
            .headers
            .get(COOKIE)
            .and_then(|header| header.to_str().ok())
            .and_then(|header| cookie_value(header, &self.name))
            .filter(|value| !value.is_empty());
        Ok(match value {
            Some(value) => TagOutcome::Tag(value.to_string()),
            None => self.missing.outcome(),
        })
    }
}

/// First `name=value` pair matching `name` within one Cookie header.
fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

/// Tags requests by the first value of a named header.
///
/// Reading only the first occurrence matters: proxies commonly append to
/// headers like `X-Forwarded-For`, and trusting the last occurrence lets a
/// client smuggle its own value past the proxy.
#[derive(Debug, Clone)]
pub struct HeaderTagger {
    name: HeaderName,
    missing: MissingTag,
}

impl HeaderTagger {
    /// Tag by the header `name`.
    ///
    /// # Errors
    /// Returns [`BuildError::InvalidName`] unless `name` is a valid header
    /// name.
    pub fn new(name: &str) -> Result<Self, BuildError> {
        validate_field_name(name)?;
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| BuildError::InvalidName(name.to_string()))?;
        let missing = MissingTag::Shared(format!("<header {:?} absent>", name));
        Ok(Self { name: header, missing })
    }

    /// The header name this tagger reads.
    pub fn name(&self) -> &HeaderName {
        &self.name
    }

    /// Replace the absent-header policy.
    pub fn when_missing(mut self, missing: MissingTag) -> Self {
        self.missing = missing;
        self
    }
}

impl Tagger for HeaderTagger {
    fn tag(&self, head: &Parts) -> Result<TagOutcome, LimiterError> {
        // HeaderMap::get returns the first occurrence by construction.
        let value = head
            .headers
            .get(&self.name)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty());
        Ok(match value {
            Some(value) => TagOutcome::Tag(value.to_string()),
            None => self.missing.outcome(),
        })
    }
}

/// Tags requests by a typed value in the request extensions, rendered
/// through its `Display` impl.
///
/// Authentication middleware usually inserts such values (a user id, a
/// role), which makes this the per-principal limiter.
pub struct ExtensionTagger<T> {
    missing: MissingTag,
    _value: PhantomData<fn() -> T>,
}

impl<T> ExtensionTagger<T>
where
    T: fmt::Display + Send + Sync + 'static,
{
    /// Tag by the extension value of type `T`.
    pub fn new() -> Self {
        Self {
            missing: MissingTag::Shared(format!("<{} absent>", std::any::type_name::<T>())),
            _value: PhantomData,
        }
    }

    /// Replace the absent-value policy.
    pub fn when_missing(mut self, missing: MissingTag) -> Self {
        self.missing = missing;
        self
    }
}

impl<T> Default for ExtensionTagger<T>
where
    T: fmt::Display + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ExtensionTagger<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionTagger")
            .field("value", &std::any::type_name::<T>())
            .field("missing", &self.missing)
            .finish()
    }
}

impl<T> Tagger for ExtensionTagger<T>
where
    T: fmt::Display + Send + Sync + 'static,
{
    fn tag(&self, head: &Parts) -> Result<TagOutcome, LimiterError> {
        Ok(match head.extensions.get::<T>() {
            Some(value) => TagOutcome::Tag(value.to_string()),
            None => self.missing.outcome(),
        })
    }
}

/// Cookie and header names share one token charset.
fn validate_field_name(name: &str) -> Result<(), BuildError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(
                    c,
                    '!' | '#'
                        | '$'
                        | '%'
                        | '&'
                        | '\''
                        | '('
                        | ')'
                        | '*'
                        | '+'
                        | '-'
                        | '.'
                        | '/'
                        | '<'
                        | '>'
                        | '?'
                        | '@'
                        | '['
                        | ']'
                        | '^'
                        | '_'
                        | '{'
                        | '|'
                        | '}'
                        | '~'
                )
        });
    if valid {
        Ok(())
    } else {
        Err(BuildError::InvalidName(name.to_string()))
    }
}
