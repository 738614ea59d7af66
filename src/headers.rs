//! Response headers reporting rate limiter state to clients.

use std::time::Duration;

use chrono::Utc;
use http::header::RETRY_AFTER;
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::rate::Rate;

/// Experimental rate headers; inconsistent across the ecosystem and meant
/// to be approximate.
pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Writes rate state into response headers.
///
/// `remaining` is the tightest balance observed across the limiters that
/// handled the request; writers may ignore it.
pub trait HeaderWriter: Send + Sync {
    /// The request was admitted.
    fn allowed(&self, headers: &mut HeaderMap, remaining: f64);
    /// The request was rejected for being over rate.
    fn denied(&self, headers: &mut HeaderMap, remaining: f64);
    /// A limiter failed; the request outcome is an error, not a rejection.
    fn errored(&self, headers: &mut HeaderMap);
}

/// Writes nothing at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentHeaderWriter;

impl HeaderWriter for SilentHeaderWriter {
    fn allowed(&self, _headers: &mut HeaderMap, _remaining: f64) {}
    fn denied(&self, _headers: &mut HeaderMap, _remaining: f64) {}
    fn errored(&self, _headers: &mut HeaderMap) {}
}

/// Reports a normalized one-token-per-window rate instead of the real one.
///
/// Advertising true capacity tells an attacker exactly how hard to push, so
/// this writer promises at most one call per displayed window regardless of
/// the limiter's actual throughput, and never reports a live balance beyond
/// "1" or "0". The display rate may differ from the enforced rate
/// entirely.
#[derive(Debug, Clone)]
pub struct ObfuscatingHeaderWriter {
    one_token_window: Duration,
    display_limit: HeaderValue,
}

impl ObfuscatingHeaderWriter {
    /// A writer advertising `display_rate`, normalized to one token per
    /// second or slower.
    pub fn new(display_rate: &Rate) -> Self {
        let per_nanosecond = display_rate.per_nanosecond();
        let mut limit: u64 = 1;
        let mut one_token_window = Duration::from_nanos((1.05 / per_nanosecond) as u64);
        if one_token_window < Duration::from_secs(1) {
            let per_second = per_nanosecond * 1_000_000_000.0;
            limit = ((per_second * 0.95).floor() as u64).max(1);
            one_token_window = Duration::from_secs(1);
        }
        Self {
            one_token_window,
            display_limit: HeaderValue::from_str(&limit.to_string())
                .expect("integers are valid header values"),
        }
    }

    /// RFC 1123 timestamp one display window from now, in UTC.
    fn reset_at(&self) -> HeaderValue {
        let at = Utc::now()
            + chrono::Duration::from_std(self.one_token_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(1));
        HeaderValue::from_str(&at.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
            .expect("formatted dates are valid header values")
    }
}

impl HeaderWriter for ObfuscatingHeaderWriter {
    fn allowed(&self, headers: &mut HeaderMap, _remaining: f64) {
        headers.insert(X_RATELIMIT_LIMIT.clone(), self.display_limit.clone());
        headers.insert(X_RATELIMIT_RESET.clone(), self.reset_at());
        headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from_static("1"));
    }

    fn denied(&self, headers: &mut HeaderMap, _remaining: f64) {
        let reset = self.reset_at();
        headers.insert(X_RATELIMIT_LIMIT.clone(), self.display_limit.clone());
        headers.insert(X_RATELIMIT_RESET.clone(), reset.clone());
        headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from_static("0"));
        headers.insert(RETRY_AFTER, reset);
    }

    fn errored(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT.clone(), self.display_limit.clone());
        headers.insert(X_RATELIMIT_RESET.clone(), self.reset_at());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::Rate;

    fn writer(tokens: f64, interval: Duration) -> ObfuscatingHeaderWriter {
        ObfuscatingHeaderWriter::new(&Rate::new(tokens, interval).unwrap())
    }

    #[test]
    fn fast_rates_clamp_to_a_one_second_window() {
        let w = writer(100.0, Duration::from_secs(1));
        assert_eq!(w.one_token_window, Duration::from_secs(1));
        assert_eq!(w.display_limit, "95");
    }

    #[test]
    fn displayed_limit_never_drops_below_one() {
        // Just over one token per second: 0.95x floors to zero, reported as 1.
        let w = writer(21.04, Duration::from_secs(20));
        assert_eq!(w.one_token_window, Duration::from_secs(1));
        assert_eq!(w.display_limit, "1");
    }

    #[test]
    fn slow_rates_widen_the_window_instead() {
        let w = writer(1.0, Duration::from_secs(10));
        assert_eq!(w.display_limit, "1");
        assert!((w.one_token_window.as_secs_f64() - 10.5).abs() < 0.01);
    }

    #[test]
    fn allowed_promises_exactly_one_more_call() {
        let w = writer(9.0, Duration::from_secs(1));
        let mut headers = HeaderMap::new();
        w.allowed(&mut headers, 6.0);
        assert_eq!(headers.get(&X_RATELIMIT_REMAINING).unwrap(), "1");
        assert!(headers.get(RETRY_AFTER).is_none());
        let reset = headers.get(&X_RATELIMIT_RESET).unwrap().to_str().unwrap();
        assert!(reset.ends_with("GMT"), "unexpected reset format: {reset}");
    }

    #[test]
    fn denied_adds_retry_after() {
        let w = writer(9.0, Duration::from_secs(1));
        let mut headers = HeaderMap::new();
        w.denied(&mut headers, 0.2);
        assert_eq!(headers.get(&X_RATELIMIT_REMAINING).unwrap(), "0");
        assert_eq!(headers.get(RETRY_AFTER), headers.get(&X_RATELIMIT_RESET));
    }

    #[test]
    fn errored_omits_the_balance_entirely() {
        let w = writer(9.0, Duration::from_secs(1));
        let mut headers = HeaderMap::new();
        w.errored(&mut headers);
        assert!(headers.get(&X_RATELIMIT_REMAINING).is_none());
        assert!(headers.get(RETRY_AFTER).is_none());
        assert!(headers.get(&X_RATELIMIT_LIMIT).is_some());
    }

    #[test]
    fn silent_writer_writes_nothing() {
        let mut headers = HeaderMap::new();
        SilentHeaderWriter.allowed(&mut headers, 1.0);
        SilentHeaderWriter.denied(&mut headers, 0.0);
        SilentHeaderWriter.errored(&mut headers);
        assert!(headers.is_empty());
    }
}
