//! Per-Tenant Counter Example
//!
//! Each tenant (picked by the `Host` header) gets its own counter service
//! with its own lifecycle. Tenants idle for two seconds are stopped by the
//! reaper and start fresh on their next request.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tenantry::logging::{LogConfig, LogLevel};
use tenantry::prelude::*;
use tenantry::{HandlerFn, LifecycleResult};
use tokio_util::sync::CancellationToken;

struct Counter {
    tenant: String,
    hits: AtomicU64,
}

#[async_trait]
impl HostedService for Counter {
    async fn start(&self, _cancel: &CancellationToken) -> LifecycleResult {
        println!("  ▶ counter for {} started", self.tenant);
        Ok(())
    }

    async fn stop(&self, _cancel: &CancellationToken) -> LifecycleResult {
        println!(
            "  ■ counter for {} stopped after {} hits",
            self.tenant,
            self.hits.load(Ordering::SeqCst)
        );
        Ok(())
    }
}

fn fallthrough() -> HandlerFn {
    handler_fn(|_req: HttpRequest| async { Ok(HttpResponse::not_found()) })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = LogConfig::new().level(LogLevel::Info).init()?;

    let host = TenantHostBuilder::new()
        .resolve_tenant_by_host(false)
        .configure_options(|o| {
            o.stop_interval = Some(Duration::from_secs(2));
            o.reaper_period = Duration::from_secs(1);
        })
        .configure_tenant(|tenant| {
            let counter = Arc::new(Counter {
                tenant: tenant.code().to_string(),
                hits: AtomicU64::new(0),
            });
            let hosted: Arc<dyn HostedService> = counter.clone();
            tenant.services_mut().add_singleton(counter).add_singleton(hosted);
            Ok(())
        })
        .build(ServiceCollection::new().build_named("demo"))?;
    host.start().await?;

    let mut chain = MiddlewareChain::new();
    chain.use_middleware(host.use_multi_tenant(|app| {
        app.get("/hit", |req: HttpRequest| async move {
            let services = req
                .services
                .clone()
                .ok_or_else(|| Error::Internal("missing services".to_string()))?;
            let counter = services.resolve_required::<Arc<Counter>>()?;
            let hits = counter.hits.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(HttpResponse::ok().with_text(format!("{} hits for {}", hits, counter.tenant)))
        });
        Ok(())
    }));

    println!("=== Per-Tenant Counter Example ===\n");
    for authority in ["alpha.local", "beta.local", "alpha.local", "alpha.local"] {
        let request =
            host.prepare_request(HttpRequest::new("GET", "/hit").with_header("Host", authority));
        let response = chain.apply(request, fallthrough()).await?;
        println!("  {} -> {}", authority, response.text());
    }

    println!("\nWaiting for the reaper...");
    tokio::time::sleep(Duration::from_secs(4)).await;
    println!("Active tenants: {}", host.registry().len());

    let request =
        host.prepare_request(HttpRequest::new("GET", "/hit").with_header("Host", "alpha.local"));
    println!("  alpha.local -> {}", chain.apply(request, fallthrough()).await?.text());

    host.stop().await;
    Ok(())
}
