//! Integration tests for common Tenantry workflows.
//!
//! These tests drive the facade crate the way an application would.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tenantry::prelude::*;

struct Greeting(String);

fn fallthrough() -> tenantry::HandlerFn {
    handler_fn(|_req: HttpRequest| async { Ok(HttpResponse::not_found()) })
}

fn greeting_host() -> MultiTenantHost {
    TenantHostBuilder::new()
        .resolve_tenant_by_host(false)
        .configure_tenant(|tenant| {
            let greeting = format!("hello from {}", tenant.code());
            tenant.services_mut().add_singleton(Greeting(greeting));
            Ok(())
        })
        .build(ServiceCollection::new().build_named("app"))
        .unwrap()
}

fn greeting_chain(host: &MultiTenantHost) -> MiddlewareChain {
    let mut chain = MiddlewareChain::new();
    chain.use_middleware(host.use_multi_tenant(|app| {
        app.get("/greet", |req: HttpRequest| async move {
            let services = req
                .services
                .clone()
                .ok_or_else(|| Error::Internal("missing services".to_string()))?;
            let greeting = services.resolve_required::<Greeting>()?;
            Ok(HttpResponse::ok().with_text(greeting.0.clone()))
        });
        Ok(())
    }));
    chain
}

#[tokio::test]
async fn test_each_host_gets_its_own_tenant_singleton() {
    let host = greeting_host();
    let chain = greeting_chain(&host);

    let request = |authority: &str| {
        host.prepare_request(HttpRequest::new("GET", "/greet").with_header("Host", authority))
    };

    let a = chain.apply(request("a"), fallthrough()).await.unwrap();
    let b = chain.apply(request("b"), fallthrough()).await.unwrap();
    assert_eq!(a.text(), "hello from a");
    assert_eq!(b.text(), "hello from b");

    let tenant_a = host.registry().lookup("a").unwrap();
    let tenant_b = host.registry().lookup("b").unwrap();
    let greeting_a = tenant_a.services().resolve_required::<Greeting>().unwrap();
    let greeting_b = tenant_b.services().resolve_required::<Greeting>().unwrap();
    assert!(!Arc::ptr_eq(&greeting_a, &greeting_b));
}

#[tokio::test]
async fn test_unmatched_path_reaches_host_handler() {
    let host = greeting_host();
    let chain = greeting_chain(&host);

    let request =
        host.prepare_request(HttpRequest::new("GET", "/static/app.js").with_header("Host", "a"));
    let response = chain.apply(request, fallthrough()).await.unwrap();
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_missing_host_header_is_bad_request() {
    let host = greeting_host();
    let chain = greeting_chain(&host);

    let result = chain
        .apply(host.prepare_request(HttpRequest::new("GET", "/greet")), fallthrough())
        .await;
    assert_eq!(result.unwrap_err().status_code(), 400);
    assert!(host.registry().is_empty());
}

#[tokio::test]
async fn test_authentication_runs_once_per_request() {
    struct CountingAuthenticator(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl Authenticator for CountingAuthenticator {
        async fn authenticate(&self, req: &HttpRequest) -> Result<Option<Principal>, Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(req.header("authorization").map(Principal::new))
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let host = TenantHostBuilder::new()
        .resolve_tenant_by_header("x-tenant")
        .configure_tenant(move |tenant| {
            tenant
                .services_mut()
                .add_authenticator(CountingAuthenticator(counter.clone()));
            Ok(())
        })
        .build(ServiceCollection::new().build_named("app"))
        .unwrap();

    let mut chain = MiddlewareChain::new();
    chain.use_middleware(host.use_multi_tenant(|app| {
        app.use_authentication();
        app.map("/api", |api| {
            api.use_authentication();
            api.get("/me", |req: HttpRequest| async move {
                let principal = req.extensions.get::<Principal>().map(|p| p.subject.clone());
                Ok(HttpResponse::ok().with_text(principal.unwrap_or_default()))
            });
        });
        Ok(())
    }));

    let request = HttpRequest::new("GET", "/api/me")
        .with_header("x-tenant", "acme")
        .with_header("authorization", "alice");
    let response = chain
        .apply(host.prepare_request(request), fallthrough())
        .await
        .unwrap();

    assert_eq!(response.text(), "alice");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
