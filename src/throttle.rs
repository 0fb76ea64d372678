//! Rate-limited diagnostics for per-packet events.

/// Logs the 1st, 2nd, 4th, 8th ... occurrence.
pub(crate) fn should_log(count: u64) -> bool {
    count.is_power_of_two()
}

/// `tracing` event that fires on a power-of-two count per call site.
macro_rules! throttled {
    ($level:ident, $($arg:tt)+) => {{
        static HITS: ::std::sync::atomic::AtomicU64 = ::std::sync::atomic::AtomicU64::new(0);
        let hits = HITS.fetch_add(1, ::std::sync::atomic::Ordering::Relaxed) + 1;
        if $crate::throttle::should_log(hits) {
            ::tracing::$level!(hits, $($arg)+);
        }
    }};
}

pub(crate) use throttled;
