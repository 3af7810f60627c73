//! Composition of a tenant's request pipeline.
//!
//! A [`TenantApplicationBuilder`] collects stages, branches and routes for
//! one tenant and compiles them into a [`RequestPipeline`]. Builders share a
//! [`PropertyBag`]: a branch gets a fork of its parent's bag, so it sees the
//! parent's markers while its own writes stay local.
//!
//! Compilation applies these rules, in this order:
//!
//! 1. If any route was registered and no routing stage is already placed,
//!    a routing stage is inserted first.
//! 2. If the tenant registers an [`Authenticator`] (or an
//!    [`AuthorizationPolicy`]) and no such stage is already placed, the
//!    stage is inserted next.
//! 3. The builder's own stages follow in the order they were added.
//! 4. If any route was registered, an endpoint stage runs last.
//!
//! "Already placed" is tracked with markers in the bag, so asking for the
//! authentication stage in both a parent and a branch yields one stage.

use super::cache::RequestPipeline;
use super::stages::{
    AuthenticationStage, AuthorizationPolicy, Authenticator, AuthorizationStage, BranchStage,
    EndpointStage, RoutingStage,
};
use crate::tenant::Tenant;
use crate::{Result, TenantError};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tenantry_core::{
    Container, FnMiddleware, HandlerFn, HttpRequest, HttpResponse, Middleware, MiddlewareChain,
    Next, PropertyBag, Route, Router, ServiceProviderExt, handler_fn,
};

/// Marker: a routing stage is placed
pub const ROUTING_MARKER: &str = "tenantry.routing";
/// Marker: an authentication stage is placed
pub const AUTHENTICATION_MARKER: &str = "tenantry.authentication";
/// Marker: an authorization stage is placed
pub const AUTHORIZATION_MARKER: &str = "tenantry.authorization";
/// The route table shared by a builder and its branches
const ROUTE_TABLE_KEY: &str = "tenantry.route_table";

/// Routes registered by a builder tree, in registration order
#[derive(Default)]
struct RouteTable {
    routes: Mutex<Vec<Route>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marked {
    Routing,
    Authentication,
    Authorization,
}

impl Marked {
    fn marker(self) -> &'static str {
        match self {
            Marked::Routing => ROUTING_MARKER,
            Marked::Authentication => AUTHENTICATION_MARKER,
            Marked::Authorization => AUTHORIZATION_MARKER,
        }
    }
}

enum Component {
    Stage(Arc<dyn Middleware>),
    Marked(Marked),
    Branch {
        prefix: String,
        builder: Box<TenantApplicationBuilder>,
    },
}

/// Builds the request pipeline of one tenant
pub struct TenantApplicationBuilder {
    tenant: Tenant,
    host: Container,
    properties: PropertyBag,
    route_prefix: String,
    components: Vec<Component>,
}

impl TenantApplicationBuilder {
    /// A root builder with a fresh property bag
    pub fn new(tenant: Tenant, host: Container) -> Self {
        let properties = PropertyBag::new();
        properties.insert(ROUTE_TABLE_KEY, RouteTable::default());
        Self {
            tenant,
            host,
            properties,
            route_prefix: String::new(),
            components: Vec::new(),
        }
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn code(&self) -> &str {
        self.tenant.code()
    }

    /// The tenant's container
    pub fn tenant_services(&self) -> &Container {
        self.tenant.services()
    }

    /// The host root container
    pub fn host_services(&self) -> &Container {
        &self.host
    }

    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// A builder for a nested pipeline.
    ///
    /// It forks this builder's bag and registers its routes in the same
    /// table.
    pub fn new_child(&self) -> Self {
        Self {
            tenant: self.tenant.clone(),
            host: self.host.clone(),
            properties: self.properties.fork(),
            route_prefix: self.route_prefix.clone(),
            components: Vec::new(),
        }
    }

    pub fn use_middleware<M: Middleware + 'static>(&mut self, middleware: M) -> &mut Self {
        self.components.push(Component::Stage(Arc::new(middleware)));
        self
    }

    /// Add a stage from a closure taking the request and the continuation
    pub fn use_fn<F, Fut>(&mut self, name: &'static str, f: F) -> &mut Self
    where
        F: Fn(HttpRequest, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<HttpResponse, tenantry_core::Error>> + Send + 'static,
    {
        self.use_middleware(FnMiddleware::new(name, f))
    }

    /// Place the routing stage here instead of at the front
    pub fn use_routing(&mut self) -> &mut Self {
        self.components.push(Component::Marked(Marked::Routing));
        self
    }

    /// Place the authentication stage here. Requires an [`Authenticator`].
    pub fn use_authentication(&mut self) -> &mut Self {
        self.components.push(Component::Marked(Marked::Authentication));
        self
    }

    /// Place the authorization stage here. Requires an [`AuthorizationPolicy`].
    pub fn use_authorization(&mut self) -> &mut Self {
        self.components.push(Component::Marked(Marked::Authorization));
        self
    }

    /// Run a nested pipeline for requests under `prefix`.
    ///
    /// Routes added in the branch are registered below `prefix`. Requests
    /// the branch does not answer continue with the rest of this pipeline.
    pub fn map<F>(&mut self, prefix: &str, configure: F) -> &mut Self
    where
        F: FnOnce(&mut TenantApplicationBuilder),
    {
        let prefix = normalize_prefix(prefix);
        let mut child = self.new_child();
        child.route_prefix = join_path(&self.route_prefix, &prefix);
        configure(&mut child);
        self.components.push(Component::Branch {
            prefix,
            builder: Box::new(child),
        });
        self
    }

    /// Run a nested pipeline built with [`new_child`](Self::new_child) for every request
    pub fn nest(&mut self, child: TenantApplicationBuilder) -> &mut Self {
        self.components.push(Component::Branch {
            prefix: String::new(),
            builder: Box::new(child),
        });
        self
    }

    /// Register an endpoint
    pub fn route(&mut self, method: &str, path: &str, handler: HandlerFn) -> &mut Self {
        let path = join_path(&self.route_prefix, path);
        if let Some(table) = self.properties.get_as::<RouteTable>(ROUTE_TABLE_KEY) {
            table.routes.lock().push(Route::new(method, path, handler));
        }
        self
    }

    pub fn get<F, Fut>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<HttpResponse, tenantry_core::Error>> + Send + 'static,
    {
        self.route("GET", path, handler_fn(handler))
    }

    pub fn post<F, Fut>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<HttpResponse, tenantry_core::Error>> + Send + 'static,
    {
        self.route("POST", path, handler_fn(handler))
    }

    /// Number of routes registered in this builder tree
    pub fn route_count(&self) -> usize {
        self.properties
            .get_as::<RouteTable>(ROUTE_TABLE_KEY)
            .map_or(0, |table| table.routes.lock().len())
    }

    /// Compile the pipeline
    pub fn build(self) -> Result<RequestPipeline> {
        let routes = match self.properties.remove(ROUTE_TABLE_KEY) {
            Some(value) => value
                .downcast::<RouteTable>()
                .map(|table| std::mem::take(&mut *table.routes.lock()))
                .unwrap_or_default(),
            None => Vec::new(),
        };

        let mut router = Router::new();
        for route in routes {
            router.add_route(route)?;
        }
        let router = Arc::new(router);

        let chain = self.compile(&router, true)?;
        Ok(RequestPipeline::new(chain))
    }

    fn compile(self, router: &Arc<Router>, root: bool) -> Result<MiddlewareChain> {
        let has_routes = !router.is_empty();
        let services = self.tenant.services().clone();
        let mut chain = MiddlewareChain::new();

        // Claim markers for this level before compiling branches, so a
        // branch sees every stage placed by its parent
        let mut explicit = Vec::new();
        for kind in [Marked::Routing, Marked::Authentication, Marked::Authorization] {
            let requested = self
                .components
                .iter()
                .any(|c| matches!(c, Component::Marked(k) if *k == kind));
            if requested {
                if self.claim(kind) {
                    explicit.push(kind);
                }
                continue;
            }
            let automatic = match kind {
                Marked::Routing => root && has_routes,
                Marked::Authentication => services.has::<Arc<dyn Authenticator>>(),
                Marked::Authorization => services.has::<Arc<dyn AuthorizationPolicy>>(),
            };
            if automatic && self.claim(kind) {
                chain.push(stage_for(kind, router));
            }
        }

        for kind in &explicit {
            self.check_capability(*kind)?;
        }

        for component in self.components {
            match component {
                Component::Stage(middleware) => chain.push(middleware),
                Component::Marked(kind) => {
                    if let Some(pos) = explicit.iter().position(|k| *k == kind) {
                        explicit.remove(pos);
                        chain.push(stage_for(kind, router));
                    }
                }
                Component::Branch { prefix, builder } => {
                    let branch = builder.compile(router, false)?;
                    chain.push(Arc::new(BranchStage::new(prefix, branch)));
                }
            }
        }

        if root && has_routes {
            chain.push(Arc::new(EndpointStage));
        }
        Ok(chain)
    }

    /// Mark `kind` as placed. False if a stage of that kind is already placed.
    fn claim(&self, kind: Marked) -> bool {
        if self.properties.contains(kind.marker()) {
            return false;
        }
        self.properties.set_flag(kind.marker());
        true
    }

    fn check_capability(&self, kind: Marked) -> Result<()> {
        let services = self.tenant.services();
        let missing = match kind {
            Marked::Routing => None,
            Marked::Authentication => (!services.has::<Arc<dyn Authenticator>>())
                .then_some("an Authenticator"),
            Marked::Authorization => (!services.has::<Arc<dyn AuthorizationPolicy>>())
                .then_some("an AuthorizationPolicy"),
        };
        match missing {
            Some(what) => Err(TenantError::Configuration(format!(
                "Tenant '{}' uses {:?} but does not register {}",
                self.code(),
                kind,
                what
            ))),
            None => Ok(()),
        }
    }
}

fn stage_for(kind: Marked, router: &Arc<Router>) -> Arc<dyn Middleware> {
    match kind {
        Marked::Routing => Arc::new(RoutingStage::new(router.clone())),
        Marked::Authentication => Arc::new(AuthenticationStage),
        Marked::Authorization => Arc::new(AuthorizationStage),
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

fn join_path(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        return path.to_string();
    }
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, path)
    }
}

impl std::fmt::Debug for TenantApplicationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantApplicationBuilder")
            .field("tenant", &self.code())
            .field("components", &self.components.len())
            .field("routes", &self.route_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stages::{AuthServicesExt, Principal};
    use crate::tenant::TenantContext;
    use async_trait::async_trait;
    use tenantry_core::{BoxFuture, Error, ServiceCollection};

    struct HeaderAuth;

    #[async_trait]
    impl Authenticator for HeaderAuth {
        async fn authenticate(&self, request: &HttpRequest) -> std::result::Result<Option<Principal>, Error> {
            Ok(request.header("x-user").map(Principal::new))
        }
    }

    struct RequireUser;

    #[async_trait]
    impl AuthorizationPolicy for RequireUser {
        async fn authorize(
            &self,
            principal: Option<&Principal>,
            _request: &HttpRequest,
        ) -> std::result::Result<bool, Error> {
            Ok(principal.is_some())
        }
    }

    fn tenant(services: ServiceCollection) -> Tenant {
        Tenant::new(Arc::new(TenantContext::new("acme")), services.build())
    }

    fn builder(services: ServiceCollection) -> TenantApplicationBuilder {
        TenantApplicationBuilder::new(tenant(services), Container::new())
    }

    fn auth_services() -> ServiceCollection {
        let mut services = ServiceCollection::new();
        services.add_authenticator(HeaderAuth);
        services
    }

    fn fallthrough() -> Next {
        Box::new(|_req| -> BoxFuture { Box::pin(async { Ok(HttpResponse::new(299)) }) })
    }

    fn request(path: &str, services: &Tenant) -> HttpRequest {
        HttpRequest::new("GET", path).with_services(Arc::new(services.services().clone()))
    }

    #[test]
    fn test_routes_insert_routing_and_endpoints() {
        let mut app = builder(ServiceCollection::new());
        app.use_fn("log", |req, next: Next| next(req));
        app.get("/hello", |_req| async { Ok(HttpResponse::ok()) });

        let pipeline = app.build().unwrap();
        assert_eq!(pipeline.stages(), vec!["routing", "log", "endpoints"]);
    }

    #[test]
    fn test_no_routes_no_routing() {
        let mut app = builder(ServiceCollection::new());
        app.use_fn("log", |req, next: Next| next(req));
        assert_eq!(app.build().unwrap().stages(), vec!["log"]);
    }

    #[test]
    fn test_explicit_routing_keeps_its_position() {
        let mut app = builder(ServiceCollection::new());
        app.use_fn("first", |req, next: Next| next(req));
        app.use_routing();
        app.get("/", |_req| async { Ok(HttpResponse::ok()) });

        assert_eq!(
            app.build().unwrap().stages(),
            vec!["first", "routing", "endpoints"]
        );
    }

    #[test]
    fn test_authentication_inserted_when_registered() {
        let mut app = builder(auth_services());
        app.use_fn("log", |req, next: Next| next(req));
        assert_eq!(app.build().unwrap().stages(), vec!["authentication", "log"]);
    }

    #[test]
    fn test_duplicate_authentication_is_suppressed_across_branches() {
        let mut app = builder(auth_services());
        app.use_authentication();
        app.map("/admin", |admin| {
            admin.use_authentication();
            admin.use_fn("admin", |req, next: Next| next(req));
        });
        app.use_authentication();

        let pipeline = app.build().unwrap();
        assert_eq!(pipeline.stages(), vec!["authentication", "branch"]);
    }

    #[tokio::test]
    async fn test_branch_uses_parent_authentication_once() {
        let mut app = builder(auth_services());
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = counter.clone();
        app.map("/admin", move |admin| {
            admin.use_authentication();
            let seen = seen.clone();
            admin.use_fn("count", move |req: HttpRequest, next: Next| {
                if req.extensions.contains::<Principal>() {
                    seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
                next(req)
            });
        });
        let tenant = app.tenant().clone();
        let pipeline = app.build().unwrap();

        let req = request("/admin/users", &tenant).with_header("x-user", "alice");
        let response = pipeline.handle(req, fallthrough()).await.unwrap();
        assert_eq!(response.status, 299);
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_explicit_authentication_without_authenticator_fails() {
        let mut app = builder(ServiceCollection::new());
        app.use_authentication();
        assert!(matches!(app.build(), Err(TenantError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_branch_routes_are_prefixed() {
        let mut app = builder(ServiceCollection::new());
        app.map("/api/", |api| {
            api.get("/items/{id}", |req: HttpRequest| async move {
                Ok(HttpResponse::ok().with_text(req.param("id").cloned().unwrap_or_default()))
            });
        });
        let tenant = app.tenant().clone();
        let pipeline = app.build().unwrap();
        assert_eq!(pipeline.stages(), vec!["routing", "branch", "endpoints"]);

        let response = pipeline
            .handle(request("/api/items/7", &tenant), fallthrough())
            .await
            .unwrap();
        assert_eq!(response.text(), "7");

        let missed = pipeline
            .handle(request("/items/7", &tenant), fallthrough())
            .await
            .unwrap();
        assert_eq!(missed.status, 299);
    }

    #[tokio::test]
    async fn test_authorization_rejects_anonymous() {
        let mut services = auth_services();
        services.add_authorization_policy(RequireUser);
        let mut app = builder(services);
        app.get("/secret", |_req| async { Ok(HttpResponse::ok()) });
        let tenant = app.tenant().clone();
        let pipeline = app.build().unwrap();
        assert_eq!(
            pipeline.stages(),
            vec!["routing", "authentication", "authorization", "endpoints"]
        );

        let anonymous = pipeline.handle(request("/secret", &tenant), fallthrough()).await;
        assert!(matches!(anonymous, Err(Error::Unauthorized(_))));

        let allowed = pipeline
            .handle(request("/secret", &tenant).with_header("x-user", "bob"), fallthrough())
            .await
            .unwrap();
        assert_eq!(allowed.status, 200);
    }

    #[test]
    fn test_conflicting_routes_fail_the_build() {
        let mut app = builder(ServiceCollection::new());
        app.get("/users/{id}", |_req| async { Ok(HttpResponse::ok()) });
        app.get("/users/{name}", |_req| async { Ok(HttpResponse::ok()) });
        assert!(matches!(app.build(), Err(TenantError::Container(_))));
    }

    #[test]
    fn test_child_bag_is_copy_on_write() {
        let app = builder(ServiceCollection::new());
        app.properties().set_flag("parent");
        let child = app.new_child();
        child.properties().set_flag("child");

        assert!(child.properties().contains("parent"));
        assert!(!app.properties().contains("child"));
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "/a"), "/a");
        assert_eq!(join_path("/api", "/a"), "/api/a");
        assert_eq!(join_path("/api", "/"), "/api");
        assert_eq!(normalize_prefix("api/"), "/api");
        assert_eq!(normalize_prefix("/"), "");
    }
}
