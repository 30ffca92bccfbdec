//! Sliding-window rate limiting.
//!
//! Each key owns a ring buffer of `max_count + 1` timestamps and its own write
//! index. A request is admitted while fewer than `max_count + 1` requests have
//! been seen for the key, or when the newest and oldest buffered timestamps are
//! at least `interval` apart. Keys never share state.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::context::Injector;
use crate::handler::{BoxedHandler, Handler, Wrapper, handler_fn};

struct RateWindow {
    stamps: Box<[Instant]>,
    idx: u64,
}

impl RateWindow {
    fn new(slots: usize, now: Instant) -> Self {
        Self { stamps: vec![now; slots].into_boxed_slice(), idx: 0 }
    }

    fn record(&mut self, now: Instant) {
        let slots = self.stamps.len() as u64;
        self.stamps[(self.idx % slots) as usize] = now;
        self.idx += 1;
    }

    fn allows(&self, max_count: usize, interval: Duration) -> bool {
        if self.idx <= max_count as u64 {
            return true;
        }
        let slots = self.stamps.len() as u64;
        let latest = self.stamps[((self.idx - 1) % slots) as usize];
        let oldest = self.stamps[(self.idx % slots) as usize];
        latest.saturating_duration_since(oldest) >= interval
    }
}

/// Per-key sliding-window counter shared by every request routed through one
/// limiter wrapper.
pub struct SlidingWindow {
    max_count: usize,
    interval: Duration,
    windows: DashMap<String, RateWindow>,
}

impl SlidingWindow {
    pub fn new(max_count: usize, interval: Duration) -> Self {
        Self { max_count, interval, windows: DashMap::new() }
    }

    /// Records a request for `key` now and reports whether it is admitted.
    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, Instant::now())
    }

    /// Same as [`admit`](Self::admit) with an explicit clock reading.
    pub fn admit_at(&self, key: &str, now: Instant) -> bool {
        let slots = self.max_count + 1;
        let mut window = match self.windows.get_mut(key) {
            Some(window) => window,
            None => self.windows.entry(key.to_owned()).or_insert_with(|| RateWindow::new(slots, now)),
        };
        window.record(now);
        window.allows(self.max_count, self.interval)
    }

    /// Number of distinct keys seen so far.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

/// Rate-limits by `key(ctx)`; rejected requests get 429 `too many requests`.
pub fn rate_limiter<C, K>(key: K, max_count: usize, interval: Duration) -> Wrapper<C>
where
    C: Injector,
    K: Fn(&C) -> String + Send + Sync + 'static,
{
    rate_limiter_with(key, max_count, interval, |ctx: C| async move {
        ctx.context().wrap_too_many_requests("too many requests")
    })
}

/// Rate-limits by `key(ctx)`; rejected requests are answered by `exceeded`.
pub fn rate_limiter_with<C, K, H>(key: K, max_count: usize, interval: Duration, exceeded: H) -> Wrapper<C>
where
    C: Injector,
    K: Fn(&C) -> String + Send + Sync + 'static,
    H: Handler<C>,
{
    window_limiter(Arc::new(SlidingWindow::new(max_count, interval)), key, handler_fn(exceeded))
}

/// Builds a limiter wrapper over an existing window, so callers can share one
/// window between several wrappers or inspect it.
pub fn window_limiter<C, K>(window: Arc<SlidingWindow>, key: K, exceeded: BoxedHandler<C>) -> Wrapper<C>
where
    C: Injector,
    K: Fn(&C) -> String + Send + Sync + 'static,
{
    let key = Arc::new(key);
    Arc::new(move |next: BoxedHandler<C>| {
        let window = Arc::clone(&window);
        let key = Arc::clone(&key);
        let exceeded = Arc::clone(&exceeded);
        handler_fn(move |ctx: C| {
            let window = Arc::clone(&window);
            let key = Arc::clone(&key);
            let exceeded = Arc::clone(&exceeded);
            let next = Arc::clone(&next);
            async move {
                let k = key(&ctx);
                if window.admit(&k) {
                    next.call(ctx).await
                } else {
                    debug!(key = %k, "rate limit exceeded");
                    exceeded.call(ctx).await
                }
            }
        })
    })
}

/// Limits each client IP to `max_count` requests per `interval`.
pub fn dos_limiter<C: Injector>(max_count: usize, interval: Duration) -> Wrapper<C> {
    rate_limiter(|ctx: &C| ctx.context().remote_addr().ip().to_string(), max_count, interval)
}
