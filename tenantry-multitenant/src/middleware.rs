// The host pipeline stage that hands requests to their tenant

use crate::bridge::ResolutionBridge;
use crate::pipeline::{PipelineCache, PipelineId, TenantApplicationBuilder};
use crate::registry::TenantRegistry;
use crate::resolver::TenantResolver;
use crate::{Result, TenantError};
use async_trait::async_trait;
use std::sync::Arc;
use tenantry_core::{
    BoxFuture, Error, HttpRequest, HttpResponse, Middleware, Next, ServiceProvider,
    ServiceProviderExt,
};
use tracing::Instrument;

/// Configures a tenant's pipeline; runs once per tenant and stage
pub type ConfigureFn = Arc<dyn Fn(&mut TenantApplicationBuilder) -> Result<()> + Send + Sync>;

/// The tenant code resolved for a request, cached in its extensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantCode(pub String);

/// The bridge installed by an enclosing multi-tenant stage
struct ActiveBridge {
    code: String,
    bridge: Arc<ResolutionBridge>,
}

/// Host services to restore when the tenant pipeline hands the request back
struct HostServices(Option<Arc<dyn ServiceProvider>>);

/// Runs each request through its tenant's pipeline.
///
/// The stage resolves the tenant code (or reuses one cached on the request),
/// starts the tenant if needed, installs a [`ResolutionBridge`] as the
/// request services and runs the tenant pipeline. Requests the tenant
/// pipeline does not answer continue down the host pipeline with the host
/// services restored.
pub struct MultiTenantMiddleware {
    id: PipelineId,
    registry: Arc<TenantRegistry>,
    resolver: Arc<dyn TenantResolver>,
    configure: ConfigureFn,
}

impl MultiTenantMiddleware {
    pub fn new<F>(registry: Arc<TenantRegistry>, resolver: Arc<dyn TenantResolver>, configure: F) -> Self
    where
        F: Fn(&mut TenantApplicationBuilder) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            id: PipelineId::new(),
            registry,
            resolver,
            configure: Arc::new(configure),
        }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    async fn tenant_code(&self, req: &mut HttpRequest) -> Result<String> {
        if let Some(TenantCode(code)) = req.extensions.get::<TenantCode>() {
            return Ok(code.clone());
        }
        let code = self
            .resolver
            .resolve(req)
            .await?
            .ok_or(TenantError::Unresolved)?;
        req.extensions.insert(TenantCode(code.clone()));
        Ok(code)
    }
}

#[async_trait]
impl Middleware for MultiTenantMiddleware {
    async fn handle(&self, mut req: HttpRequest, next: Next) -> std::result::Result<HttpResponse, Error> {
        let code = self.tenant_code(&mut req).await?;
        let tenant = self.registry.get_or_start(&code).await?;

        let cache = tenant.services().resolve_required::<PipelineCache>()?;
        let pipeline = cache
            .get_or_build(self.id, || async {
                let mut builder =
                    TenantApplicationBuilder::new(tenant.clone(), self.registry.host().clone());
                (self.configure)(&mut builder)?;
                builder.build()
            })
            .await?;

        // An enclosing stage for the same tenant already installed a bridge
        let reused = req
            .extensions
            .get_arc::<ActiveBridge>()
            .filter(|active| active.code == code);
        if let Some(active) = reused {
            req.services = Some(active.bridge.clone());
            return pipeline.handle(req, next).await;
        }

        let host: Arc<dyn ServiceProvider> = match &req.services {
            Some(services) => services.clone(),
            None => Arc::new(self.registry.host().clone()),
        };
        let bridge = Arc::new(ResolutionBridge::new(
            tenant,
            host,
            self.registry.options().snapshot(),
            self.registry.notices().clone(),
        ));

        let saved = req.services.replace(bridge.clone());
        req.extensions.insert(HostServices(saved));
        req.extensions.insert(ActiveBridge {
            code: code.clone(),
            bridge,
        });

        let restore: Next = Box::new(move |mut req: HttpRequest| -> BoxFuture {
            req.extensions.remove::<ActiveBridge>();
            if let Some(saved) = req.extensions.take::<HostServices>() {
                req.services = saved.0.clone();
            }
            next(req)
        });

        pipeline
            .handle(req, restore)
            .instrument(tracing::debug_span!("tenant", tenant = %code))
            .await
    }

    fn name(&self) -> &'static str {
        "multi_tenant"
    }
}
