// Compiled pipelines, cached per tenant and per pipeline identity

use crate::{Result, TenantError};
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tenantry_core::{Error, HttpRequest, HttpResponse, MiddlewareChain, Next, continuation_handler};
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Identity of one multi-tenant stage in the host pipeline.
///
/// Each stage compiles its own pipeline per tenant; two stages never share
/// a compiled chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(Uuid);

impl PipelineId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PipelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A tenant's compiled chain of stages
pub struct RequestPipeline {
    chain: MiddlewareChain,
}

impl RequestPipeline {
    pub(crate) fn new(chain: MiddlewareChain) -> Self {
        Self { chain }
    }

    /// Run the chain; when it completes without answering, `next` gets the request
    pub async fn handle(&self, req: HttpRequest, next: Next) -> std::result::Result<HttpResponse, Error> {
        self.chain.apply(req, continuation_handler(next)).await
    }

    /// Stage names in execution order
    pub fn stages(&self) -> Vec<&'static str> {
        self.chain.names()
    }
}

impl fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("stages", &self.stages())
            .finish()
    }
}

type Slot = Arc<OnceCell<Arc<RequestPipeline>>>;

/// Per-tenant cache of compiled pipelines.
///
/// Registered as a singleton in every tenant container. Concurrent first
/// requests for the same identity build the pipeline once; other
/// identities are not held up.
#[derive(Default)]
pub struct PipelineCache {
    slots: DashMap<PipelineId, Slot>,
    builds: AtomicUsize,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached pipeline for `id`, building it with `build` on first use.
    ///
    /// A failed build is not cached; the next call tries again.
    pub async fn get_or_build<F, Fut>(&self, id: PipelineId, build: F) -> Result<Arc<RequestPipeline>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RequestPipeline>>,
    {
        let slot: Slot = self.slots.entry(id).or_default().clone();
        if let Some(pipeline) = slot.get() {
            return Ok(pipeline.clone());
        }

        let pipeline = slot
            .get_or_try_init(|| async {
                let pipeline = build().await?;
                self.builds.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(pipeline = %id, stages = ?pipeline.stages(), "Built tenant pipeline");
                Ok::<_, TenantError>(Arc::new(pipeline))
            })
            .await?;
        Ok(pipeline.clone())
    }

    pub fn get(&self, id: PipelineId) -> Option<Arc<RequestPipeline>> {
        self.slots.get(&id).and_then(|slot| slot.get().cloned())
    }

    /// Number of pipelines built so far
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCache")
            .field("pipelines", &self.len())
            .field("builds", &self.builds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantry_core::FnMiddleware;

    fn pipeline() -> RequestPipeline {
        let mut chain = MiddlewareChain::new();
        chain.use_middleware(FnMiddleware::new("pass", |req, next: Next| next(req)));
        RequestPipeline::new(chain)
    }

    #[tokio::test]
    async fn test_second_call_reuses_pipeline() {
        let cache = PipelineCache::new();
        let id = PipelineId::new();

        let first = cache.get_or_build(id, || async { Ok(pipeline()) }).await.unwrap();
        let second = cache.get_or_build(id, || async { Ok(pipeline()) }).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.builds(), 1);
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let cache = PipelineCache::new();
        let a = cache.get_or_build(PipelineId::new(), || async { Ok(pipeline()) }).await.unwrap();
        let b = cache.get_or_build(PipelineId::new(), || async { Ok(pipeline()) }).await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_build_is_retried() {
        let cache = PipelineCache::new();
        let id = PipelineId::new();

        let failed = cache
            .get_or_build(id, || async { Err(TenantError::Configuration("bad".into())) })
            .await;
        assert!(failed.is_err());
        assert!(cache.get(id).is_none());

        cache.get_or_build(id, || async { Ok(pipeline()) }).await.unwrap();
        assert!(cache.get(id).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_requests_build_once() {
        let cache = Arc::new(PipelineCache::new());
        let id = PipelineId::new();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_build(id, || async {
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                            Ok(pipeline())
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut built = Vec::new();
        for task in tasks {
            built.push(task.await.unwrap());
        }
        assert_eq!(cache.builds(), 1);
        assert!(built.iter().all(|p| Arc::ptr_eq(p, &built[0])));
    }

    #[tokio::test]
    async fn test_pipeline_hands_unanswered_request_to_next() {
        let pipeline = pipeline();
        let next: Next = Box::new(|_req| -> tenantry_core::BoxFuture {
            Box::pin(async { Ok(HttpResponse::new(204)) })
        });
        let response = pipeline.handle(HttpRequest::new("GET", "/"), next).await.unwrap();
        assert_eq!(response.status, 204);
    }
}
