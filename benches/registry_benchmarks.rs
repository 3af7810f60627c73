use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use tenantry::multitenant::{
    LiveOptions, PipelineCache, PipelineId, ResolutionBridge, TenantApplicationBuilder,
    TenantOptions, TenantRegistry,
};
use tenantry::{Container, HttpRequest, HttpResponse, ServiceCollection, ServiceProviderExt};

struct TenantConfig;
struct HostClock;

fn registry() -> TenantRegistry {
    let mut host = ServiceCollection::new();
    host.add_singleton(HostClock);
    TenantRegistry::new(
        host.build_named("host"),
        LiveOptions::new(TenantOptions::new().with_fallback_to_host(true)),
    )
}

fn bench_get_or_start(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let registry = registry();
    runtime.block_on(registry.get_or_start("warm")).unwrap();

    let mut group = c.benchmark_group("registry");
    group.bench_function("get_or_start_existing", |b| {
        b.to_async(&runtime)
            .iter(|| async { black_box(registry.get_or_start(black_box("warm")).await.unwrap()) })
    });
    group.bench_function("lookup", |b| b.iter(|| black_box(registry.lookup(black_box("warm")))));
    group.finish();
}

fn bench_bridge_resolution(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let registry = registry();
    let tenant = runtime.block_on(registry.get_or_start("acme")).unwrap();
    let host: Container = registry.host().clone();

    let options = Arc::new(TenantOptions::new().with_fallback_to_host(true));

    let bridge = ResolutionBridge::new(
        tenant,
        Arc::new(host),
        options,
        registry.notices().clone(),
    );

    let mut group = c.benchmark_group("bridge");
    group.bench_function("tenant_miss_fallback_hit", |b| {
        b.iter(|| black_box(bridge.resolve::<HostClock>().unwrap()))
    });
    group.bench_function("absent_everywhere", |b| {
        b.iter(|| black_box(bridge.resolve::<TenantConfig>().unwrap()))
    });
    group.finish();
}

fn bench_cached_pipeline(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let registry = registry();
    let tenant = runtime.block_on(registry.get_or_start("acme")).unwrap();
    let cache = tenant.services().resolve_required::<PipelineCache>().unwrap();
    let id = PipelineId::new();
    let build = || async {
        let mut app = TenantApplicationBuilder::new(tenant.clone(), registry.host().clone());
        app.get("/", |_req: HttpRequest| async { Ok(HttpResponse::ok()) });
        app.build()
    };
    runtime.block_on(cache.get_or_build(id, build)).unwrap();

    c.bench_function("pipeline_cache_hit", |b| {
        b.to_async(&runtime)
            .iter(|| async { black_box(cache.get_or_build(id, build).await.unwrap()) })
    });
}

criterion_group!(
    benches,
    bench_get_or_start,
    bench_bridge_resolution,
    bench_cached_pipeline
);
criterion_main!(benches);
