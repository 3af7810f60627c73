//! Hosted services and the three-phase start/stop protocol.
//!
//! A hosted service is a background component owned by a container. Startup
//! runs `starting` on every service, then `start` on every service, then
//! `started`; shutdown runs `stopping`, `stop` and `stopped` the same way.
//! Each phase completes for all services before the next phase begins.
//!
//! Startup is fail-fast: the first error aborts and is returned. Shutdown is
//! best-effort: failures and panics are logged and collected, and every
//! remaining hook still runs.
//!
//! ```
//! use tenantry_core::lifecycle::{HostedService, LifecycleResult};
//! use tenantry_core::ServiceCollection;
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Warmup;
//!
//! #[async_trait]
//! impl HostedService for Warmup {
//!     async fn start(&self, _cancel: &CancellationToken) -> LifecycleResult {
//!         Ok(())
//!     }
//! }
//!
//! let mut services = ServiceCollection::new();
//! services.add_hosted_service(Warmup);
//! let container = services.build();
//!
//! let hosted = tenantry_core::lifecycle::hosted_services(&container).unwrap();
//! let cancel = CancellationToken::new();
//! # tokio_test::block_on(async {
//! tenantry_core::lifecycle::run_start_phases(&hosted, &cancel).await.unwrap();
//! assert!(tenantry_core::lifecycle::run_stop_phases(&hosted, &cancel).await.is_empty());
//! # });
//! ```

use crate::container::{ServiceCollection, ServiceProvider, ServiceProviderExt};
use crate::logging::{debug, error};
use crate::Error;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Error type for lifecycle operations
pub type LifecycleResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A background component started and stopped with its container.
///
/// Only `start` and `stop` are required; the surrounding phases default to
/// no-ops.
#[async_trait]
pub trait HostedService: Send + Sync {
    async fn starting(&self, _cancel: &CancellationToken) -> LifecycleResult {
        Ok(())
    }

    async fn start(&self, cancel: &CancellationToken) -> LifecycleResult;

    async fn started(&self, _cancel: &CancellationToken) -> LifecycleResult {
        Ok(())
    }

    async fn stopping(&self, _cancel: &CancellationToken) -> LifecycleResult {
        Ok(())
    }

    async fn stop(&self, _cancel: &CancellationToken) -> LifecycleResult {
        Ok(())
    }

    async fn stopped(&self, _cancel: &CancellationToken) -> LifecycleResult {
        Ok(())
    }

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// One step of the start/stop protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Start,
    Started,
    Stopping,
    Stop,
    Stopped,
}

impl Phase {
    pub const STARTUP: [Phase; 3] = [Phase::Starting, Phase::Start, Phase::Started];
    pub const SHUTDOWN: [Phase; 3] = [Phase::Stopping, Phase::Stop, Phase::Stopped];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Starting => "starting",
            Phase::Start => "start",
            Phase::Started => "started",
            Phase::Stopping => "stopping",
            Phase::Stop => "stop",
            Phase::Stopped => "stopped",
        }
    }

    async fn invoke(
        self,
        service: &dyn HostedService,
        cancel: &CancellationToken,
    ) -> LifecycleResult {
        match self {
            Phase::Starting => service.starting(cancel).await,
            Phase::Start => service.start(cancel).await,
            Phase::Started => service.started(cancel).await,
            Phase::Stopping => service.stopping(cancel).await,
            Phase::Stop => service.stop(cancel).await,
            Phase::Stopped => service.stopped(cancel).await,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stop hook that failed or panicked
#[derive(Debug, Clone)]
pub struct HookFailure {
    pub service: &'static str,
    pub phase: Phase,
    pub message: String,
}

/// Run one hook, turning a panic into an error message
async fn invoke_guarded(
    phase: Phase,
    service: &dyn HostedService,
    cancel: &CancellationToken,
) -> Result<(), String> {
    match AssertUnwindSafe(phase.invoke(service, cancel))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

/// Render a caught panic payload for logs
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

/// Run `starting`, `start`, `started` across all services.
///
/// Stops at the first failure.
pub async fn run_start_phases(
    services: &[Arc<dyn HostedService>],
    cancel: &CancellationToken,
) -> Result<(), Error> {
    for phase in Phase::STARTUP {
        for service in services {
            if let Err(message) = invoke_guarded(phase, service.as_ref(), cancel).await {
                return Err(Error::Lifecycle(format!(
                    "{} failed during {}: {}",
                    service.name(),
                    phase,
                    message
                )));
            }
            debug!(service = service.name(), phase = %phase, "Hosted service phase completed");
        }
    }
    Ok(())
}

/// Run `stopping`, `stop`, `stopped` across all services, in the given order.
///
/// Never fails; every hook runs and the failures are returned.
pub async fn run_stop_phases(
    services: &[Arc<dyn HostedService>],
    cancel: &CancellationToken,
) -> Vec<HookFailure> {
    let mut failures = Vec::new();
    for phase in Phase::SHUTDOWN {
        for service in services {
            match invoke_guarded(phase, service.as_ref(), cancel).await {
                Ok(()) => {
                    debug!(service = service.name(), phase = %phase, "Hosted service phase completed");
                }
                Err(message) => {
                    error!(
                        service = service.name(),
                        phase = %phase,
                        error = %message,
                        "Hosted service failed to stop"
                    );
                    failures.push(HookFailure {
                        service: service.name(),
                        phase,
                        message,
                    });
                }
            }
        }
    }
    failures
}

/// Every hosted service registered in a provider, in registration order
pub fn hosted_services(
    provider: &dyn ServiceProvider,
) -> Result<Vec<Arc<dyn HostedService>>, Error> {
    Ok(provider
        .resolve_all::<Arc<dyn HostedService>>()?
        .into_iter()
        .map(|service| (*service).clone())
        .collect())
}

impl ServiceCollection {
    /// Register a hosted service instance
    pub fn add_hosted_service<S: HostedService + 'static>(&mut self, service: S) -> &mut Self {
        let service: Arc<dyn HostedService> = Arc::new(service);
        self.add_singleton(service)
    }

    /// Register a hosted service built from the container on first start
    pub fn add_hosted_service_factory<S, F>(&mut self, factory: F) -> &mut Self
    where
        S: HostedService + 'static,
        F: Fn(&dyn ServiceProvider) -> Result<S, Error> + Send + Sync + 'static,
    {
        self.add_singleton_factory(move |provider| {
            factory(provider).map(|service| Arc::new(service) as Arc<dyn HostedService>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        id: &'static str,
        log: Log,
        fail_on: Option<Phase>,
    }

    impl Recorder {
        fn new(id: &'static str, log: &Log) -> Arc<dyn HostedService> {
            Arc::new(Self {
                id,
                log: log.clone(),
                fail_on: None,
            })
        }

        fn failing(id: &'static str, log: &Log, phase: Phase) -> Arc<dyn HostedService> {
            Arc::new(Self {
                id,
                log: log.clone(),
                fail_on: Some(phase),
            })
        }

        fn record(&self, phase: Phase) -> LifecycleResult {
            self.log.lock().push(format!("{}:{}", self.id, phase));
            if self.fail_on == Some(phase) {
                return Err(format!("{} refused {}", self.id, phase).into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl HostedService for Recorder {
        async fn starting(&self, _: &CancellationToken) -> LifecycleResult {
            self.record(Phase::Starting)
        }
        async fn start(&self, _: &CancellationToken) -> LifecycleResult {
            self.record(Phase::Start)
        }
        async fn started(&self, _: &CancellationToken) -> LifecycleResult {
            self.record(Phase::Started)
        }
        async fn stopping(&self, _: &CancellationToken) -> LifecycleResult {
            self.record(Phase::Stopping)
        }
        async fn stop(&self, _: &CancellationToken) -> LifecycleResult {
            self.record(Phase::Stop)
        }
        async fn stopped(&self, _: &CancellationToken) -> LifecycleResult {
            self.record(Phase::Stopped)
        }
    }

    #[tokio::test]
    async fn test_phases_complete_across_services_before_next_phase() {
        let log: Log = Arc::default();
        let services = vec![Recorder::new("a", &log), Recorder::new("b", &log)];
        let cancel = CancellationToken::new();

        run_start_phases(&services, &cancel).await.unwrap();
        let failures = run_stop_phases(&services, &cancel).await;

        assert!(failures.is_empty());
        assert_eq!(
            *log.lock(),
            vec![
                "a:starting", "b:starting", "a:start", "b:start", "a:started", "b:started",
                "a:stopping", "b:stopping", "a:stop", "b:stop", "a:stopped", "b:stopped",
            ]
        );
    }

    #[tokio::test]
    async fn test_start_failure_aborts() {
        let log: Log = Arc::default();
        let services = vec![
            Recorder::failing("a", &log, Phase::Start),
            Recorder::new("b", &log),
        ];

        let result = run_start_phases(&services, &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Lifecycle(_))));
        assert_eq!(*log.lock(), vec!["a:starting", "b:starting", "a:start"]);
    }

    #[tokio::test]
    async fn test_stop_failure_is_collected_and_teardown_continues() {
        let log: Log = Arc::default();
        let services = vec![
            Recorder::failing("a", &log, Phase::Stopping),
            Recorder::new("b", &log),
        ];

        let failures = run_stop_phases(&services, &CancellationToken::new()).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].phase, Phase::Stopping);
        assert_eq!(log.lock().len(), 6);
    }

    #[tokio::test]
    async fn test_stop_panic_is_contained() {
        struct Panics;

        #[async_trait]
        impl HostedService for Panics {
            async fn start(&self, _: &CancellationToken) -> LifecycleResult {
                Ok(())
            }
            async fn stop(&self, _: &CancellationToken) -> LifecycleResult {
                panic!("boom");
            }
        }

        let log: Log = Arc::default();
        let services: Vec<Arc<dyn HostedService>> = vec![Arc::new(Panics), Recorder::new("b", &log)];

        let failures = run_stop_phases(&services, &CancellationToken::new()).await;
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("boom"));
        assert!(log.lock().contains(&"b:stopped".to_string()));
    }

    #[test]
    fn test_hosted_services_resolve_in_registration_order() {
        let log: Log = Arc::default();
        let mut services = ServiceCollection::new();
        services.add_hosted_service(Recorder {
            id: "first",
            log: log.clone(),
            fail_on: None,
        });
        services.add_hosted_service_factory(move |_| {
            Ok(Recorder {
                id: "second",
                log: log.clone(),
                fail_on: None,
            })
        });
        let container = services.build();

        let resolved = hosted_services(&container).unwrap();
        assert_eq!(resolved.len(), 2);
    }
}
