use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jiff::{SignedDuration, Timestamp};

use crate::AppState;
use crate::api::error::ApiError;

/// Socket peer of the connection a request arrived on, injected by the
/// accept loop.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Rate tables are only swept once they grow past this many client IPs.
const CLEANUP_THRESHOLD: usize = 128;

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; script-src 'self' https://unpkg.com; \
     style-src 'self' 'unsafe-inline' https://unpkg.com https://fonts.googleapis.com; \
     img-src 'self' data: https://*.tile.openstreetmap.org; \
     font-src 'self' data: https://fonts.gstatic.com; \
     connect-src 'self'; object-src 'none'; base-uri 'self'; frame-ancestors 'none'";

struct RateBucket {
    window_start: Timestamp,
    count: u32,
    last_seen: Timestamp,
}

/// Fixed one-minute window per client IP. The window resets once its age
/// reaches the configured duration; entries idle for more than three windows
/// are evicted when the table grows past [`CLEANUP_THRESHOLD`].
pub struct IpRateLimiter {
    limit: u32,
    window: SignedDuration,
    entries: Mutex<HashMap<String, RateBucket>>,
}

impl IpRateLimiter {
    pub fn new(limit: u32, window: SignedDuration) -> Self {
        Self {
            limit: limit.max(1),
            window: if window <= SignedDuration::ZERO {
                SignedDuration::from_secs(60)
            } else {
                window
            },
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str, now: Timestamp) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let allowed = match entries.get_mut(key) {
            None => {
                entries.insert(
                    key.to_string(),
                    RateBucket { window_start: now, count: 1, last_seen: now },
                );
                true
            }
            Some(entry) => {
                if now.duration_since(entry.window_start) >= self.window {
                    entry.window_start = now;
                    entry.count = 0;
                }
                entry.last_seen = now;

                if entry.count >= self.limit {
                    false
                } else {
                    entry.count += 1;
                    true
                }
            }
        };

        if entries.len() > CLEANUP_THRESHOLD {
            let idle_cutoff = self.window * 3;
            entries.retain(|_, entry| now.duration_since(entry.last_seen) <= idle_cutoff);
        }

        allowed
    }
}

#[derive(Default)]
struct LoginGuardRecord {
    consecutive: u32,
    blocked_till: Option<Timestamp>,
    last_seen: Option<Timestamp>,
}

/// Brute-force guard for the login endpoint, separate from the API limiter.
/// An IP that fails `burst` consecutive times is blocked for a minute; a
/// successful login clears the counter.
pub struct LoginGuard {
    burst: u32,
    block_for: SignedDuration,
    per_ip_rate: IpRateLimiter,
    status: Mutex<HashMap<String, LoginGuardRecord>>,
}

impl LoginGuard {
    pub fn new(rate_per_minute: u32, burst: u32) -> Self {
        Self {
            burst: if burst == 0 { 5 } else { burst },
            block_for: SignedDuration::from_secs(60),
            per_ip_rate: IpRateLimiter::new(rate_per_minute, SignedDuration::from_secs(60)),
            status: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the remaining block duration when the attempt must be
    /// rejected, `None` when it may proceed.
    pub fn allow(&self, ip: &str, now: Timestamp) -> Option<SignedDuration> {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(record) = status.get(ip)
            && let Some(blocked_till) = record.blocked_till
            && now < blocked_till
        {
            return Some(blocked_till.duration_since(now));
        }
        if !self.per_ip_rate.allow(ip, now) {
            return Some(SignedDuration::from_secs(60));
        }

        cleanup_status(&mut status, now);
        None
    }

    pub fn on_failure(&self, ip: &str, now: Timestamp) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);

        let record = status.entry(ip.to_string()).or_default();
        record.last_seen = Some(now);
        record.consecutive += 1;
        if record.consecutive >= self.burst {
            record.blocked_till = Some(now.saturating_add(self.block_for).expect("duration overflow"));
            record.consecutive = 0;
        }

        cleanup_status(&mut status, now);
    }

    pub fn on_success(&self, ip: &str) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = status.get_mut(ip) {
            record.consecutive = 0;
        }
    }
}

fn cleanup_status(status: &mut HashMap<String, LoginGuardRecord>, now: Timestamp) {
    if status.len() <= CLEANUP_THRESHOLD {
        return;
    }
    let idle_cutoff = SignedDuration::from_hours(2);
    status.retain(|_, record| match record.last_seen {
        Some(seen) => now.duration_since(seen) <= idle_cutoff,
        None => false,
    });
}

/// Resolves the client IP for rate limiting. Proxy headers are only honoured
/// when the deployment says a trusted proxy fronts the server.
pub fn request_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        if let Some(forwarded) = header_str(headers, "x-forwarded-for")
            && let Some(first) = forwarded.split(',').map(str::trim).find(|part| !part.is_empty())
        {
            return first.to_string();
        }
        if let Some(real_ip) = header_str(headers, "x-real-ip") {
            let real_ip = real_ip.trim();
            if !real_ip.is_empty() {
                return real_ip.to_string();
            }
        }
    }

    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Outermost middleware: hardening headers on every response, plus
/// `no-store` for the API surface and HSTS when the request came in over
/// TLS (directly or via a terminating proxy).
pub async fn security_headers(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let is_api = request.uri().path().starts_with("/api/");
    let forwarded_https = header_str(request.headers(), "x-forwarded-proto")
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));
    let over_tls = state.config.https_addr.is_some() || forwarded_https;

    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(self), microphone=(), camera=()"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    if over_tls {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
    if is_api {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }

    response
}

/// Per-IP rate limit for the API surface; static assets are not counted.
pub async fn api_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !request.uri().path().starts_with("/api/") {
        return next.run(request).await;
    }

    let peer = request.extensions().get::<ClientAddr>().map(|addr| addr.0);
    let ip = request_ip(request.headers(), peer, state.config.trust_proxy_headers);
    if !state.api_limiter.allow(&ip, Timestamp::now()) {
        tracing::warn!(%ip, "api rate limit exceeded");
        return ApiError::ApiRateExceeded.into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(second: i64) -> Timestamp {
        Timestamp::from_second(second).unwrap()
    }

    #[test]
    fn window_exhausts_and_resets() {
        let limiter = IpRateLimiter::new(2, SignedDuration::from_secs(60));

        assert!(limiter.allow("10.0.0.1", ts(0)));
        assert!(limiter.allow("10.0.0.1", ts(1)));
        assert!(!limiter.allow("10.0.0.1", ts(2)));
        // Another client is unaffected.
        assert!(limiter.allow("10.0.0.2", ts(2)));
        // A full window later the counter starts over.
        assert!(limiter.allow("10.0.0.1", ts(61)));
    }

    #[test]
    fn idle_entries_swept_past_threshold() {
        let limiter = IpRateLimiter::new(10, SignedDuration::from_secs(60));

        for i in 0..CLEANUP_THRESHOLD + 1 {
            assert!(limiter.allow(&format!("10.0.0.{i}"), ts(0)));
        }
        // All prior entries are idle for > 3 windows by now and get evicted.
        limiter.allow("10.0.1.1", ts(200));
        let entries = limiter.entries.lock().unwrap();
        assert!(entries.len() <= 2);
    }

    #[test]
    fn login_guard_blocks_after_burst() {
        let guard = LoginGuard::new(100, 3);

        for i in 0..3 {
            assert!(guard.allow("10.0.0.1", ts(i)).is_none());
            guard.on_failure("10.0.0.1", ts(i));
        }

        let retry = guard.allow("10.0.0.1", ts(3)).expect("should be blocked");
        assert_eq!(retry, SignedDuration::from_secs(59));

        // Block lapses 60s after the final failure.
        assert!(guard.allow("10.0.0.1", ts(63)).is_none());
    }

    #[test]
    fn login_success_clears_counter() {
        let guard = LoginGuard::new(100, 3);

        guard.on_failure("10.0.0.1", ts(0));
        guard.on_failure("10.0.0.1", ts(1));
        guard.on_success("10.0.0.1");
        guard.on_failure("10.0.0.1", ts(2));
        // Two failures, then reset, then one more: never reaches the burst.
        assert!(guard.allow("10.0.0.1", ts(3)).is_none());
    }

    #[test]
    fn login_guard_respects_rate_limiter() {
        let guard = LoginGuard::new(1, 5);

        assert!(guard.allow("10.0.0.1", ts(0)).is_none());
        assert_eq!(
            guard.allow("10.0.0.1", ts(1)),
            Some(SignedDuration::from_secs(60))
        );
    }

    #[test]
    fn client_ip_resolution() {
        let peer: SocketAddr = "192.0.2.7:5000".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", " 203.0.113.9 , 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());

        // Proxy headers are ignored unless trusted.
        assert_eq!(request_ip(&headers, Some(peer), false), "192.0.2.7");
        assert_eq!(request_ip(&headers, Some(peer), true), "203.0.113.9");

        let mut real_ip_only = HeaderMap::new();
        real_ip_only.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(request_ip(&real_ip_only, Some(peer), true), "198.51.100.2");

        assert_eq!(request_ip(&HeaderMap::new(), None, true), "unknown");
    }
}
