// Tenantry - a multi-tenant application runtime for Rust
//
// One host process serves many tenants, each with its own service container,
// hosted-service lifecycle and request pipeline.

// Re-export core functionality
pub use tenantry_core::*;

// Re-export the tenant runtime
pub use tenantry_multitenant as multitenant;
pub use tenantry_multitenant::{
    FallbackNotices, IdleReaper, MultiTenantHost, MultiTenantMiddleware, ResolutionBridge,
    Tenant, TenantApplicationBuilder, TenantBuilder, TenantContext, TenantError,
    TenantHostBuilder, TenantInitializer, TenantOptions, TenantRegistry, TenantResolver,
    TenantSettings, TenantState,
};

/// Prelude for common imports
///
/// ```
/// use tenantry::prelude::*;
///
/// let host = TenantHostBuilder::new()
///     .resolve_tenant_by_header("x-tenant")
///     .build(ServiceCollection::new().build_named("app"))
///     .unwrap();
///
/// # tokio_test::block_on(async {
/// let tenant = host.registry().get_or_start("acme").await.unwrap();
/// assert_eq!(tenant.code(), "acme");
/// # });
/// ```
pub mod prelude {
    pub use crate::{
        Container,
        Error,
        HostedService,
        HttpRequest,
        HttpResponse,
        Middleware,
        MiddlewareChain,
        MultiTenantHost,
        Next,
        ServiceCollection,
        ServiceProvider,
        ServiceProviderExt,
        Tenant,
        TenantApplicationBuilder,
        TenantBuilder,
        TenantError,
        TenantHostBuilder,
        TenantOptions,
        handler_fn,
    };
    pub use tenantry_multitenant::{AuthServicesExt, Authenticator, AuthorizationPolicy, Principal};
}
