//! Host-level setup of the tenant runtime.
//!
//! ```
//! use tenantry_core::{HttpRequest, HttpResponse, ServiceCollection};
//! use tenantry_multitenant::TenantHostBuilder;
//!
//! let host = TenantHostBuilder::new()
//!     .resolve_tenant_by_host(false)
//!     .configure_tenant(|tenant| {
//!         let code = tenant.code().to_string();
//!         tenant.services_mut().add_singleton(code);
//!         Ok(())
//!     })
//!     .build(ServiceCollection::new().build_named("host"))
//!     .unwrap();
//!
//! let _stage = host.use_multi_tenant(|app| {
//!     app.get("/", |_req: HttpRequest| async { Ok(HttpResponse::ok()) });
//!     Ok(())
//! });
//!
//! # tokio_test::block_on(async {
//! host.start().await.unwrap();
//! let tenant = host.registry().get_or_start("acme").await.unwrap();
//! assert_eq!(tenant.code(), "acme");
//! assert!(host.stop().await.is_empty());
//! # });
//! ```

use crate::config::TenantSettings;
use crate::initializer::{AsyncInitializer, FnInitializer, RedirectSingleton, TenantBuilder, TenantInitializer};
use crate::middleware::MultiTenantMiddleware;
use crate::options::{LiveOptions, TenantOptions};
use crate::pipeline::TenantApplicationBuilder;
use crate::reaper::IdleReaper;
use crate::registry::TenantRegistry;
use crate::resolver::{FnTenantResolver, HeaderTenantResolver, HostTenantResolver, TenantResolver};
use crate::{Result, TenantError};
use std::future::Future;
use std::sync::Arc;
use tenantry_core::{Container, HookFailure, HttpRequest, ServiceCollection, ServiceHost};
use tracing::info;

/// Collects initializers, options and the tenant resolver for a host
pub struct TenantHostBuilder {
    initializers: Vec<Arc<dyn TenantInitializer>>,
    options: TenantOptions,
    option_errors: Vec<TenantError>,
    resolver: Option<Arc<dyn TenantResolver>>,
}

impl TenantHostBuilder {
    pub fn new() -> Self {
        Self {
            initializers: Vec::new(),
            options: TenantOptions::default(),
            option_errors: Vec::new(),
            resolver: None,
        }
    }

    /// Run `initializer` for every new tenant, after those added before it
    pub fn add_initializer<I: TenantInitializer + 'static>(mut self, initializer: I) -> Self {
        self.initializers.push(Arc::new(initializer));
        self
    }

    pub fn configure_tenant<F>(self, configure: F) -> Self
    where
        F: Fn(&mut TenantBuilder) -> Result<()> + Send + Sync + 'static,
    {
        self.add_initializer(FnInitializer::new(configure))
    }

    /// Async configuration: the closure gets the tenant code and host
    /// container and returns registrations to add to the tenant
    pub fn configure_tenant_async<F, Fut>(self, configure: F) -> Self
    where
        F: Fn(String, Container) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ServiceCollection>> + Send + 'static,
    {
        self.add_initializer(AsyncInitializer::new(configure))
    }

    /// Configure only the tenant's service registrations
    pub fn configure_tenant_services<F>(self, configure: F) -> Self
    where
        F: Fn(&str, &mut ServiceCollection) + Send + Sync + 'static,
    {
        self.configure_tenant(move |tenant| {
            let code = tenant.code().to_string();
            configure(&code, tenant.services_mut());
            Ok(())
        })
    }

    pub fn configure_options<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(&mut TenantOptions),
    {
        configure(&mut self.options);
        self
    }

    /// Take the scalar knobs from loaded settings
    pub fn with_settings(mut self, settings: &TenantSettings) -> Self {
        settings.apply_to(&mut self.options);
        self
    }

    /// Every tenant shares the host's singleton `T`
    pub fn redirect_singleton_to_host<T: ?Sized + 'static>(self) -> Self {
        self.add_initializer(RedirectSingleton::<T>::new())
    }

    /// Tenants resolve `T` from the host's request services
    pub fn redirect_scoped_to_host<T: ?Sized + 'static>(mut self) -> Self {
        self.options.redirect::<T>();
        self
    }

    /// Like [`redirect_scoped_to_host`](Self::redirect_scoped_to_host) for
    /// every instantiation of the generic type of `T`
    pub fn redirect_scoped_generic_to_host<T: ?Sized + 'static>(mut self) -> Self {
        if let Err(e) = self.options.redirect_generic::<T>() {
            self.option_errors.push(e);
        }
        self
    }

    /// Use the `Host` header as the tenant code
    pub fn resolve_tenant_by_host(self, include_port: bool) -> Self {
        self.resolve_tenant_with(HostTenantResolver::new(include_port))
    }

    pub fn resolve_tenant_by_header(self, header: impl Into<String>) -> Self {
        self.resolve_tenant_with(HeaderTenantResolver::new(header))
    }

    pub fn resolve_tenant_by<F>(self, f: F) -> Self
    where
        F: Fn(&HttpRequest) -> Option<String> + Send + Sync + 'static,
    {
        self.resolve_tenant_with(FnTenantResolver::new(f))
    }

    pub fn resolve_tenant_with<R: TenantResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Assemble the runtime around the host container
    pub fn build(mut self, host: Container) -> Result<MultiTenantHost> {
        if let Some(error) = self.option_errors.pop() {
            return Err(error);
        }
        if self.options.reaper_period.is_zero() {
            return Err(TenantError::Configuration(
                "Reaper period must be greater than zero".to_string(),
            ));
        }
        let resolver = self
            .resolver
            .ok_or_else(|| TenantError::Configuration("No tenant resolver configured".to_string()))?;

        let supervisor = ServiceHost::new(host.clone());
        let options = LiveOptions::new(self.options);
        let registry = Arc::new(
            TenantRegistry::with_initializers(host, options, self.initializers)
                .with_shutdown_token(supervisor.cancellation_token()),
        );
        let reaper = IdleReaper::new(registry.clone());
        supervisor.add_service(Arc::new(reaper.clone()));

        Ok(MultiTenantHost {
            registry,
            resolver,
            reaper,
            supervisor,
        })
    }
}

impl Default for TenantHostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled tenant runtime of one host
pub struct MultiTenantHost {
    registry: Arc<TenantRegistry>,
    resolver: Arc<dyn TenantResolver>,
    reaper: IdleReaper,
    supervisor: ServiceHost,
}

impl MultiTenantHost {
    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub fn host_services(&self) -> &Container {
        self.registry.host()
    }

    pub fn options(&self) -> &LiveOptions {
        self.registry.options()
    }

    pub fn reaper(&self) -> &IdleReaper {
        &self.reaper
    }

    pub fn supervisor(&self) -> &ServiceHost {
        &self.supervisor
    }

    /// A host pipeline stage running requests through their tenant's
    /// pipeline, configured by `configure`
    pub fn use_multi_tenant<F>(&self, configure: F) -> MultiTenantMiddleware
    where
        F: Fn(&mut TenantApplicationBuilder) -> Result<()> + Send + Sync + 'static,
    {
        MultiTenantMiddleware::new(self.registry.clone(), self.resolver.clone(), configure)
    }

    /// Attach a fresh host request scope to `request`
    pub fn prepare_request(&self, request: HttpRequest) -> HttpRequest {
        request.with_services(Arc::new(self.host_services().create_scope()))
    }

    /// Apply new settings; later requests and reaper passes see them
    pub fn reload_settings(&self, settings: &TenantSettings) -> u64 {
        self.options().update(|options| settings.apply_to(options))
    }

    /// Start the host services, the idle reaper among them
    pub async fn start(&self) -> Result<()> {
        self.supervisor.start().await?;
        info!("Tenant host started");
        Ok(())
    }

    /// Stop the host services, then every running tenant
    pub async fn stop(&self) -> Vec<HookFailure> {
        let failures = self.supervisor.stop().await;
        let tenants = self.registry.stop_all().await;
        info!(tenants, "Tenant host stopped");
        failures
    }
}

impl std::fmt::Debug for MultiTenantHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiTenantHost")
            .field("registry", &self.registry)
            .field("reaper", &self.reaper)
            .finish()
    }
}
