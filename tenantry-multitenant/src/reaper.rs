//! Idle tenant eviction.
//!
//! The [`IdleReaper`] is a hosted service of the host. Every period it stops
//! the tenants that have not been accessed for the configured stop interval.
//! With no interval (or a zero one) passes do nothing, but the timer keeps
//! running so a live options update can enable eviction later.
//!
//! A tenant is stopped only if it is still the instance registered for its
//! code and still idle when it is removed, so a replacement started during
//! the pass survives it.

use crate::options::LiveOptions;
use crate::registry::TenantRegistry;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tenantry_core::lifecycle::panic_message;
use tenantry_core::{HostedService, LifecycleResult};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Wall time anchored when the reaper starts and advanced by the runtime's
/// monotonic clock, so passes follow tokio time.
struct PassClock {
    wall: DateTime<Utc>,
    instant: Instant,
}

impl PassClock {
    fn start() -> Self {
        Self {
            wall: Utc::now(),
            instant: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        match TimeDelta::from_std(self.instant.elapsed()) {
            Ok(elapsed) => self.wall + elapsed,
            Err(_) => Utc::now(),
        }
    }
}

/// Periodically stops idle tenants
#[derive(Clone)]
pub struct IdleReaper {
    registry: Arc<TenantRegistry>,
    options: LiveOptions,
    running: Arc<Mutex<Option<Running>>>,
}

impl IdleReaper {
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        let options = registry.options().clone();
        Self {
            registry,
            options,
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Run one pass as if the clock read `now`; returns the evicted codes
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        let Some(interval) = self.options.snapshot().eviction_interval() else {
            trace!("Idle eviction disabled");
            return Vec::new();
        };
        let Ok(interval) = TimeDelta::from_std(interval) else {
            trace!("Idle interval beyond representable range; eviction disabled");
            return Vec::new();
        };

        let mut evicted = Vec::new();
        for tenant in self.registry.active_tenants() {
            let idle = now.signed_duration_since(tenant.last_accessed());
            if idle < interval {
                continue;
            }
            let code = tenant.code().to_string();
            debug!(tenant = %code, idle_secs = idle.num_seconds(), "Evicting idle tenant");
            let stop = self.registry.stop_if_idle(&tenant, now, interval);
            match AssertUnwindSafe(stop).catch_unwind().await {
                Ok(Some(_)) => evicted.push(code),
                Ok(None) => debug!(tenant = %code, "Tenant replaced or accessed during the pass"),
                Err(panic) => error!(
                    tenant = %code,
                    error = %panic_message(panic.as_ref()),
                    "Failed to evict idle tenant"
                ),
            }
        }
        evicted
    }

    async fn run(self, period: Duration, cancel: CancellationToken) {
        let clock = PassClock::start();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let pass = AssertUnwindSafe(self.evict_idle(clock.now())).catch_unwind().await;
            if let Err(panic) = pass {
                error!(error = %panic_message(panic.as_ref()), "Idle reaper pass failed");
            }
        }
        debug!("Idle reaper stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

#[async_trait]
impl HostedService for IdleReaper {
    async fn start(&self, cancel: &CancellationToken) -> LifecycleResult {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let period = self.options.snapshot().reaper_period;
        if period.is_zero() {
            return Err("Reaper period must be greater than zero".into());
        }

        let cancel = cancel.child_token();
        let task = tokio::spawn(self.clone().run(period, cancel.clone()));
        *running = Some(Running { cancel, task });
        debug!(period_secs = period.as_secs(), "Idle reaper started");
        Ok(())
    }

    async fn stop(&self, _cancel: &CancellationToken) -> LifecycleResult {
        let running = self.running.lock().take();
        if let Some(Running { cancel, task }) = running {
            cancel.cancel();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    return Err(format!("Idle reaper task failed: {}", e).into());
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "IdleReaper"
    }
}

impl std::fmt::Debug for IdleReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleReaper")
            .field("running", &self.is_running())
            .finish()
    }
}
