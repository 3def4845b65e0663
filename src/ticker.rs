//! Process-wide once-per-second clock.
//!
//! Realized here as an explicit handle threaded from `Server` into
//! `Client`s at construction rather than a singleton, backed by an
//! `AtomicU64`/`ArcSwap`-free pair of atomics updated by a single
//! `tokio::spawn`ed timer task so readers never take a lock.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

/// A shared, lazily-started once-per-second clock.
///
/// Cloning is cheap (`Arc` internally); every `Client` holds a `Ticker`
/// clone rather than reaching for a global.
#[derive(Clone)]
pub struct Ticker {
    inner: Arc<Inner>,
}

struct Inner {
    unix_time: AtomicU64,
    http_date: parking_lot::RwLock<String>,
    stop: Notify,
}

impl Ticker {
    /// Builds a `Ticker` already populated with the current time, and
    /// spawns the task that refreshes it once per second.
    pub fn start() -> Self {
        let ticker = Self {
            inner: Arc::new(Inner {
                unix_time: AtomicU64::new(unix_now()),
                http_date: parking_lot::RwLock::new(httpdate::fmt_http_date(SystemTime::now())),
                stop: Notify::new(),
            }),
        };

        let background = ticker.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => background.refresh(),
                    _ = background.inner.stop.notified() => break,
                }
            }
        });

        ticker
    }

    /// Builds a `Ticker` for tests: populated once, never refreshed by a
    /// background task.
    #[cfg(test)]
    pub fn frozen(unix_time: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                unix_time: AtomicU64::new(unix_time),
                http_date: parking_lot::RwLock::new(httpdate::fmt_http_date(
                    UNIX_EPOCH + Duration::from_secs(unix_time),
                )),
                stop: Notify::new(),
            }),
        }
    }

    fn refresh(&self) {
        let now = unix_now();
        self.inner.unix_time.store(now, Ordering::Relaxed);
        *self.inner.http_date.write() =
            httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(now));
    }

    /// Current Unix time in seconds, as of the last tick.
    pub fn unix_time(&self) -> u64 {
        self.inner.unix_time.load(Ordering::Relaxed)
    }

    /// The preformatted `Date:` header value (RFC 1123, e.g.
    /// `Tue, 15 Nov 1994 08:12:31 GMT`) as of the last tick.
    pub fn http_date(&self) -> String {
        self.inner.http_date.read().clone()
    }

    /// Stops the background refresh task. Used on server shutdown so the
    /// ticker's task does not keep the runtime alive.
    pub fn stop(&self) {
        self.inner.stop.notify_one();
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_ticker_reports_fixed_time() {
        let ticker = Ticker::frozen(784_111_777);
        assert_eq!(ticker.unix_time(), 784_111_777);
        assert!(ticker.http_date().ends_with("GMT"));
    }
}
