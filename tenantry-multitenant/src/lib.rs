//! Multi-tenant runtime for Tenantry
//!
//! One host process serves many tenants. Each tenant gets its own service
//! container, its own hosted-service lifecycle and its own request pipeline,
//! created on first request and stopped when idle.
//!
//! # Features
//!
//! - **Tenant registry** - exactly-once tenant startup under concurrency
//! - **Resolution bridge** - tenant services first, host services by
//!   redirect or optional fallback
//! - **Lifecycle** - three-phase start and stop of tenant hosted services
//! - **Idle reaper** - stops tenants not accessed within an interval
//! - **Per-tenant pipelines** - built once per tenant, with automatic
//!   routing and auth stages that never run twice
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tenantry_multitenant::*;
//!
//! let host = TenantHostBuilder::new()
//!     .resolve_tenant_by_host(false)
//!     .configure_options(|o| o.stop_interval = Some(Duration::from_secs(600)))
//!     .configure_tenant_services(|code, services| {
//!         services.add_singleton(TenantDatabase::for_tenant(code));
//!     })
//!     .redirect_singleton_to_host::<Metrics>()
//!     .build(host_container)?;
//!
//! host.start().await?;
//!
//! let mut chain = MiddlewareChain::new();
//! chain.use_middleware(host.use_multi_tenant(|app| {
//!     app.use_authentication();
//!     app.get("/orders", list_orders);
//!     Ok(())
//! }));
//! ```
//!
//! # Redirects and fallback
//!
//! A tenant resolves a service from its own container first. Types redirected
//! with [`TenantHostBuilder::redirect_scoped_to_host`] come from the host's
//! request services instead. Anything else the tenant does not provide is
//! absent unless [`TenantOptions::allow_fallback_to_host`] is set, in which
//! case the host is asked and a notice is logged once per type.

pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod initializer;
pub mod middleware;
pub mod options;
pub mod pipeline;
pub mod reaper;
pub mod registry;
pub mod resolver;
pub mod tenant;

pub use bridge::{FallbackNotices, ResolutionBridge};
pub use config::{ENV_PREFIX, FileFormat, TenantSettings, Validate};
pub use error::{Result, TenantError};
pub use host::{MultiTenantHost, TenantHostBuilder};
pub use initializer::{AsyncInitializer, FnInitializer, TenantBuilder, TenantInitializer};
pub use middleware::{ConfigureFn, MultiTenantMiddleware, TenantCode};
pub use options::{DEFAULT_REAPER_PERIOD, LiveOptions, TenantOptions};
pub use pipeline::{
    AUTHENTICATION_MARKER, AUTHORIZATION_MARKER, AuthServicesExt, AuthorizationPolicy,
    Authenticator, PipelineCache, PipelineId, Principal, ROUTING_MARKER, RequestPipeline,
    TenantApplicationBuilder,
};
pub use reaper::IdleReaper;
pub use registry::TenantRegistry;
pub use resolver::{FnTenantResolver, HeaderTenantResolver, HostTenantResolver, TenantResolver};
pub use tenant::{HostContext, Tenant, TenantContext, TenantState};
