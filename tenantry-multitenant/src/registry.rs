//! The set of running tenants.
//!
//! [`TenantRegistry::get_or_start`] returns the running tenant for a code,
//! creating it on first use. Creation is serialized per code: concurrent
//! first callers for one code wait for a single creation and all receive the
//! same tenant, while other codes proceed independently.
//!
//! A tenant is visible to lookups only once its start hooks have completed.
//! [`TenantRegistry::stop`] removes the tenant before running its stop
//! hooks, so the next lookup builds a fresh tenant right away.

use crate::bridge::FallbackNotices;
use crate::initializer::{TenantBuilder, TenantInitializer};
use crate::options::LiveOptions;
use crate::pipeline::PipelineCache;
use crate::tenant::{HostContext, Tenant, TenantContext, TenantState};
use crate::{Result, TenantError};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tenantry_core::lifecycle::{self, HookFailure};
use tenantry_core::{Container, Instance, Lifetime, ServiceDescriptor, ServiceType, factory_fn};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Gates = DashMap<String, Arc<AsyncMutex<()>>>;

/// A clone of the creation gate for one code.
///
/// Dropping it, including when the caller's future is cancelled, removes the
/// gate from the map once no other caller holds it.
struct GateLease<'a> {
    gates: &'a Gates,
    code: &'a str,
    gate: Arc<AsyncMutex<()>>,
}

impl<'a> GateLease<'a> {
    fn acquire(gates: &'a Gates, code: &'a str) -> Self {
        let gate = gates.entry(code.to_string()).or_default().clone();
        Self { gates, code, gate }
    }
}

impl Drop for GateLease<'_> {
    fn drop(&mut self) {
        // Our clone goes first; a count of one then means nobody else waits
        drop(std::mem::take(&mut self.gate));
        self.gates
            .remove_if(self.code, |_, gate| Arc::strong_count(gate) == 1);
    }
}

pub struct TenantRegistry {
    tenants: DashMap<String, Tenant>,
    gates: Gates,
    initializers: Vec<Arc<dyn TenantInitializer>>,
    host: Container,
    options: LiveOptions,
    notices: FallbackNotices,
    shutdown: CancellationToken,
    containers_built: AtomicUsize,
}

impl TenantRegistry {
    pub fn new(host: Container, options: LiveOptions) -> Self {
        Self::with_initializers(host, options, Vec::new())
    }

    pub fn with_initializers(
        host: Container,
        options: LiveOptions,
        initializers: Vec<Arc<dyn TenantInitializer>>,
    ) -> Self {
        Self {
            tenants: DashMap::new(),
            gates: DashMap::new(),
            initializers,
            host,
            options,
            notices: FallbackNotices::new(),
            shutdown: CancellationToken::new(),
            containers_built: AtomicUsize::new(0),
        }
    }

    /// Hand tenant hooks a process-wide token instead of the registry's own
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn host(&self) -> &Container {
        &self.host
    }

    pub fn options(&self) -> &LiveOptions {
        &self.options
    }

    pub fn notices(&self) -> &FallbackNotices {
        &self.notices
    }

    /// Total tenant containers built, including ones that failed to start
    pub fn containers_built(&self) -> usize {
        self.containers_built.load(Ordering::Acquire)
    }

    /// The running tenant for `code`, starting it if needed
    pub async fn get_or_start(&self, code: &str) -> Result<Tenant> {
        if code.trim().is_empty() {
            return Err(TenantError::Invalid(code.to_string()));
        }
        if let Some(tenant) = self.lookup(code) {
            return Ok(tenant);
        }

        let lease = GateLease::acquire(&self.gates, code);
        let _guard = lease.gate.lock().await;
        match self.lookup(code) {
            Some(tenant) => Ok(tenant),
            None => self.start_tenant(code).await,
        }
    }

    /// The running tenant for `code`, if any, marked as accessed
    pub fn lookup(&self, code: &str) -> Option<Tenant> {
        let tenant = self.tenants.get(code)?.clone();
        tenant.context().touch();
        Some(tenant)
    }

    /// Whether a tenant is running for `code`, without touching it
    pub fn contains(&self, code: &str) -> bool {
        self.tenants.contains_key(code)
    }

    /// Snapshot of the running tenants
    pub fn active_tenants(&self) -> Vec<Tenant> {
        self.tenants.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    async fn start_tenant(&self, code: &str) -> Result<Tenant> {
        let context = Arc::new(TenantContext::new(code));
        let mut builder = TenantBuilder::new(code, self.host.clone(), self.options.snapshot());

        for initializer in &self.initializers {
            debug!(tenant = %code, initializer = initializer.name(), "Running tenant initializer");
            initializer
                .initialize(&mut builder)
                .await
                .map_err(|e| TenantError::start_failed(code, e))?;
        }

        let mut services = builder.into_services();
        let context_instance: Instance = context.clone();
        services.try_add(ServiceDescriptor::new(
            ServiceType::of::<TenantContext>(),
            Lifetime::Singleton,
            factory_fn(move |_| Ok(context_instance.clone())),
        ));
        services.try_add_singleton(HostContext::new(self.host.clone()));
        services.try_add_singleton(PipelineCache::new());

        let container = services.build_named(format!("tenant:{}", code));
        self.containers_built.fetch_add(1, Ordering::AcqRel);

        let hosted = match lifecycle::hosted_services(&container) {
            Ok(hosted) => hosted,
            Err(e) => {
                container.dispose();
                return Err(TenantError::start_failed(code, e));
            }
        };
        if let Err(e) = lifecycle::run_start_phases(&hosted, &self.shutdown.child_token()).await {
            error!(tenant = %code, error = %e, "Tenant failed to start");
            container.dispose();
            return Err(TenantError::start_failed(code, e));
        }

        context.advance(TenantState::Starting);
        let tenant = Tenant::new(context, container);
        self.tenants.insert(code.to_string(), tenant.clone());
        info!(tenant = %code, hosted_services = hosted.len(), "Tenant started");
        Ok(tenant)
    }

    /// Stop and forget the tenant for `code`. No-op when it is not running.
    ///
    /// Stop hook failures are logged and returned; the tenant is gone either way.
    pub async fn stop(&self, code: &str) -> Vec<HookFailure> {
        let Some((_, tenant)) = self.tenants.remove(code) else {
            debug!(tenant = %code, "Stop requested for a tenant that is not running");
            return Vec::new();
        };
        self.shutdown_tenant(tenant).await
    }

    /// Stop `tenant` if it is still the one registered for its code and has
    /// been idle for at least `interval` at `now`.
    ///
    /// The identity and idle checks run atomically with the removal, so a
    /// replacement started under the same code, or a tenant touched since
    /// the caller looked at it, is left running. Returns `None` when nothing
    /// was stopped.
    pub async fn stop_if_idle(
        &self,
        tenant: &Tenant,
        now: DateTime<Utc>,
        interval: TimeDelta,
    ) -> Option<Vec<HookFailure>> {
        let (_, stopped) = self.tenants.remove_if(tenant.code(), |_, current| {
            current.ptr_eq(tenant) && now.signed_duration_since(current.last_accessed()) >= interval
        })?;
        Some(self.shutdown_tenant(stopped).await)
    }

    /// Stop every running tenant
    pub async fn stop_all(&self) -> usize {
        let codes: Vec<String> = self.tenants.iter().map(|e| e.key().clone()).collect();
        let mut stopped = 0;
        for code in codes {
            if let Some((_, tenant)) = self.tenants.remove(&code) {
                self.shutdown_tenant(tenant).await;
                stopped += 1;
            }
        }
        stopped
    }

    async fn shutdown_tenant(&self, tenant: Tenant) -> Vec<HookFailure> {
        let code = tenant.code().to_string();
        if !tenant.context().advance(TenantState::Running) {
            warn!(tenant = %code, state = %tenant.state(), "Tenant was not running when stopped");
        }
        info!(tenant = %code, "Stopping tenant");

        let failures = match lifecycle::hosted_services(tenant.services()) {
            Ok(hosted) => lifecycle::run_stop_phases(&hosted, &self.shutdown).await,
            Err(e) => {
                error!(tenant = %code, error = %e, "Could not resolve tenant hosted services");
                Vec::new()
            }
        };
        for failure in &failures {
            error!(
                tenant = %code,
                service = failure.service,
                phase = %failure.phase,
                error = %failure.message,
                "Tenant service failed to stop"
            );
        }

        tenant.context().advance(TenantState::Stopping);
        tenant.services().dispose();
        info!(tenant = %code, failures = failures.len(), "Tenant stopped");
        failures
    }
}

impl std::fmt::Debug for TenantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRegistry")
            .field("tenants", &self.len())
            .field("initializers", &self.initializers.len())
            .finish()
    }
}
