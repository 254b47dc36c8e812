//! Idle-sweep background task. Reclaims per-resource state that has gone
//! unused for a while: read interval, do the work, sleep, entirely off the
//! request path.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::engine::ProtectionEngine;

/// Runs forever, reclaiming resource state idle for more than
/// `idle_after_ms`, checking every `interval_ms`. Spawn with
/// `tokio::spawn(idle_sweep_loop(engine, ...))`.
pub async fn idle_sweep_loop(engine: Arc<ProtectionEngine>, interval_ms: u64, idle_after_ms: u64) {
    loop {
        sleep(Duration::from_millis(interval_ms.max(1))).await;
        let reclaimed = engine.sweep_idle(idle_after_ms);
        if reclaimed > 0 {
            debug!(reclaimed, "idle sweep reclaimed resource state");
        }
    }
}
