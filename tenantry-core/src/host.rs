//! Host-level supervisor for background services.
//!
//! `ServiceHost` starts every hosted service registered in the host
//! container (plus any added directly) with the three-phase protocol, owns
//! the process-wide cancellation token, and stops the services best-effort.
//!
//! ```no_run
//! use tenantry_core::{ServiceCollection, ServiceHost};
//!
//! # async fn example() -> Result<(), tenantry_core::Error> {
//! let host = ServiceHost::new(ServiceCollection::new().build_named("host"));
//! host.run_until_ctrl_c().await?;
//! # Ok(())
//! # }
//! ```

use crate::container::Container;
use crate::lifecycle::{self, HookFailure, HostedService};
use crate::logging::{info, warn};
use crate::Error;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Supervises the host's hosted services
pub struct ServiceHost {
    services: Container,
    extra: Mutex<Vec<Arc<dyn HostedService>>>,
    running: Mutex<Vec<Arc<dyn HostedService>>>,
    cancel: CancellationToken,
    started: AtomicBool,
    shutdown_initiated: AtomicBool,
    stop_timeout: Duration,
}

impl ServiceHost {
    pub fn new(services: Container) -> Self {
        Self {
            services,
            extra: Mutex::new(Vec::new()),
            running: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            shutdown_initiated: AtomicBool::new(false),
            stop_timeout: Duration::from_secs(30),
        }
    }

    /// Upper bound for the whole stop sequence
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// The host container
    pub fn services(&self) -> &Container {
        &self.services
    }

    /// Supervise a service that is not registered in the container.
    ///
    /// Added services start after the registered ones.
    pub fn add_service(&self, service: Arc<dyn HostedService>) {
        self.extra.lock().push(service);
    }

    /// Token cancelled when the host stops
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.is_shutting_down()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Start all services. Fails on the first start hook error.
    pub async fn start(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Lifecycle("Host already started".to_string()));
        }

        let mut services = lifecycle::hosted_services(&self.services)?;
        services.extend(self.extra.lock().iter().cloned());

        info!(service_count = services.len(), "Starting host services");
        lifecycle::run_start_phases(&services, &self.cancel).await?;
        *self.running.lock() = services;
        info!("Host started");
        Ok(())
    }

    /// Cancel the host token and stop started services, best-effort.
    ///
    /// Returns the hooks that failed. A second call is a no-op.
    pub async fn stop(&self) -> Vec<HookFailure> {
        if self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already initiated");
            return Vec::new();
        }

        info!("Initiating host shutdown");
        self.cancel.cancel();

        let services = std::mem::take(&mut *self.running.lock());
        // Hooks see a fresh token; the host token is already cancelled
        let stop_token = CancellationToken::new();
        let failures = match tokio::time::timeout(
            self.stop_timeout,
            lifecycle::run_stop_phases(&services, &stop_token),
        )
        .await
        {
            Ok(failures) => failures,
            Err(_) => {
                stop_token.cancel();
                warn!(timeout = ?self.stop_timeout, "Host shutdown timed out");
                Vec::new()
            }
        };

        info!(failures = failures.len(), "Host shutdown complete");
        failures
    }

    /// Start, wait for Ctrl-C or cancellation, then stop
    pub async fn run_until_ctrl_c(&self) -> Result<(), Error> {
        self.start().await?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
            _ = self.cancel.cancelled() => {}
        }
        self.stop().await;
        Ok(())
    }
}

impl std::fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHost")
            .field("services", &self.services)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ServiceCollection;
    use crate::lifecycle::LifecycleResult;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Worker {
        starts: AtomicUsize,
        stops: AtomicUsize,
        cancelled_on_stop: AtomicBool,
        token: Mutex<Option<CancellationToken>>,
    }

    #[async_trait]
    impl HostedService for Worker {
        async fn start(&self, cancel: &CancellationToken) -> LifecycleResult {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.token.lock() = Some(cancel.clone());
            Ok(())
        }

        async fn stop(&self, _cancel: &CancellationToken) -> LifecycleResult {
            self.stops.fetch_add(1, Ordering::SeqCst);
            let cancelled = self.token.lock().as_ref().is_some_and(|t| t.is_cancelled());
            self.cancelled_on_stop.store(cancelled, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_added_service() {
        let host = ServiceHost::new(ServiceCollection::new().build());
        let worker = Arc::new(Worker::default());
        host.add_service(worker.clone());

        host.start().await.unwrap();
        assert!(host.is_running());
        assert_eq!(worker.starts.load(Ordering::SeqCst), 1);

        assert!(host.stop().await.is_empty());
        assert!(!host.is_running());
        assert_eq!(worker.stops.load(Ordering::SeqCst), 1);
        assert!(worker.cancelled_on_stop.load(Ordering::SeqCst));

        // Second stop is a no-op
        host.stop().await;
        assert_eq!(worker.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let host = ServiceHost::new(Container::new());
        host.start().await.unwrap();
        assert!(matches!(host.start().await, Err(Error::Lifecycle(_))));
    }

    #[tokio::test]
    async fn test_registered_services_are_started() {
        let mut services = ServiceCollection::new();
        services.add_hosted_service(Worker::default());
        let host = ServiceHost::new(services.build());

        host.start().await.unwrap();
        assert_eq!(host.running.lock().len(), 1);
        host.stop().await;
        assert!(host.running.lock().is_empty());
    }
}
