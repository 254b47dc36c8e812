//! Sliding-window counter (C3): per concrete resource, counts admitted and
//! blocked events over a fixed rolling window split into buckets
//!

use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Number of buckets a rate-limit counter is split into. Not exposed on
/// `RateLimitRuleConfig` only carries the window pair, so the
/// engine picks a fixed granularity fine enough for the boundary slack in
/// an accurate effective rate without costing much memory per resource.
pub const DEFAULT_BUCKET_COUNT: u32 = 20;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    start_ms: u64,
    pass_count: u64,
    block_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Admit,
    Block,
}

struct Inner {
    buckets: Vec<Bucket>,
    window_ms: u64,
    bucket_ms: u64,
}

/// A ring of buckets covering `[now - window_ms, now]` for one concrete
/// resource. Cheap to construct; owned exclusively by the protection engine.
pub struct SlidingWindowCounter {
    inner: Mutex<Inner>,
}

impl SlidingWindowCounter {
    pub fn new(window_ms: u32, bucket_count: u32) -> Arc<Self> {
        let bucket_count = bucket_count.max(1) as u64;
        let window_ms = u64::from(window_ms.max(1));
        let bucket_ms = (window_ms / bucket_count).max(1);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                buckets: vec![Bucket::default(); bucket_count as usize],
                window_ms,
                bucket_ms,
            }),
        })
    }

    /// Atomically advance the window, evaluate `threshold`, and record the
    /// outcome. Admits when `pass_total + 1 <= threshold`.
    pub fn try_acquire(&self, threshold: f64) -> LimitDecision {
        let now = now_ms();
        let mut inner = self.inner.lock();
        let bucket_count = inner.buckets.len() as u64;
        let bucket_ms = inner.bucket_ms;
        let window_ms = inner.window_ms;

        let horizon = now.saturating_sub(window_ms);
        for bucket in &mut inner.buckets {
            if bucket.start_ms < horizon {
                bucket.start_ms = 0;
                bucket.pass_count = 0;
                bucket.block_count = 0;
            }
        }

        let idx = ((now / bucket_ms) % bucket_count) as usize;
        let current_start = (now / bucket_ms) * bucket_ms;
        if inner.buckets[idx].start_ms != current_start {
            inner.buckets[idx] = Bucket {
                start_ms: current_start,
                pass_count: 0,
                block_count: 0,
            };
        }

        let pass_total: u64 = inner.buckets.iter().map(|b| b.pass_count).sum();
        if (pass_total as f64) + 1.0 <= threshold {
            inner.buckets[idx].pass_count += 1;
            LimitDecision::Admit
        } else {
            inner.buckets[idx].block_count += 1;
            LimitDecision::Block
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        let pass: u64 = inner.buckets.iter().map(|b| b.pass_count).sum();
        let block: u64 = inner.buckets.iter().map(|b| b.block_count).sum();
        (pass, block)
    }
}
