// Built-in pipeline stages

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tenantry_core::{
    Error, HttpRequest, HttpResponse, Middleware, MiddlewareChain, Next, RouteMatch, Router,
    ServiceCollection, ServiceProvider, ServiceProviderExt, continuation_handler,
};

/// The authenticated caller of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub claims: HashMap<String, String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            claims: HashMap::new(),
        }
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }

    pub fn claim(&self, key: &str) -> Option<&str> {
        self.claims.get(key).map(String::as_str)
    }
}

/// Identifies the caller of a request. `Ok(None)` means anonymous.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &HttpRequest) -> Result<Option<Principal>, Error>;
}

/// Decides whether a caller may proceed
#[async_trait]
pub trait AuthorizationPolicy: Send + Sync {
    async fn authorize(
        &self,
        principal: Option<&Principal>,
        request: &HttpRequest,
    ) -> Result<bool, Error>;
}

/// Registration helpers for the authentication capabilities
pub trait AuthServicesExt {
    fn add_authenticator<A: Authenticator + 'static>(&mut self, authenticator: A) -> &mut Self;

    fn add_authorization_policy<P: AuthorizationPolicy + 'static>(&mut self, policy: P)
    -> &mut Self;
}

impl AuthServicesExt for ServiceCollection {
    fn add_authenticator<A: Authenticator + 'static>(&mut self, authenticator: A) -> &mut Self {
        let authenticator: Arc<dyn Authenticator> = Arc::new(authenticator);
        self.add_singleton(authenticator)
    }

    fn add_authorization_policy<P: AuthorizationPolicy + 'static>(
        &mut self,
        policy: P,
    ) -> &mut Self {
        let policy: Arc<dyn AuthorizationPolicy> = Arc::new(policy);
        self.add_singleton(policy)
    }
}

/// Matches the request against the route table and records the match
pub(crate) struct RoutingStage {
    router: Arc<Router>,
}

impl RoutingStage {
    pub(crate) fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Middleware for RoutingStage {
    async fn handle(&self, mut req: HttpRequest, next: Next) -> Result<HttpResponse, Error> {
        if !req.extensions.contains::<RouteMatch>() {
            if let Some(matched) = self.router.lookup(&req) {
                req.extensions.insert(matched);
            }
        }
        next(req).await
    }

    fn name(&self) -> &'static str {
        "routing"
    }
}

/// Runs the matched endpoint; unmatched requests continue
pub(crate) struct EndpointStage;

#[async_trait]
impl Middleware for EndpointStage {
    async fn handle(&self, mut req: HttpRequest, next: Next) -> Result<HttpResponse, Error> {
        match req.extensions.take::<RouteMatch>() {
            Some(matched) => Arc::unwrap_or_clone(matched).dispatch(req).await,
            None => next(req).await,
        }
    }

    fn name(&self) -> &'static str {
        "endpoints"
    }
}

/// Resolves the request's [`Principal`] with the tenant's authenticator
pub(crate) struct AuthenticationStage;

#[async_trait]
impl Middleware for AuthenticationStage {
    async fn handle(&self, mut req: HttpRequest, next: Next) -> Result<HttpResponse, Error> {
        let authenticator = request_services(&req)?.resolve_required::<Arc<dyn Authenticator>>()?;
        if let Some(principal) = authenticator.authenticate(&req).await? {
            tracing::trace!(subject = %principal.subject, "Request authenticated");
            req.extensions.insert(principal);
        }
        next(req).await
    }

    fn name(&self) -> &'static str {
        "authentication"
    }
}

/// Rejects requests the tenant's policy does not allow
pub(crate) struct AuthorizationStage;

#[async_trait]
impl Middleware for AuthorizationStage {
    async fn handle(&self, req: HttpRequest, next: Next) -> Result<HttpResponse, Error> {
        let policy = request_services(&req)?.resolve_required::<Arc<dyn AuthorizationPolicy>>()?;
        let principal = req.extensions.get::<Principal>().cloned();
        if policy.authorize(principal.as_ref(), &req).await? {
            return next(req).await;
        }
        match principal {
            Some(principal) => Err(Error::Forbidden(format!(
                "{} may not access {}",
                principal.subject,
                req.route_path()
            ))),
            None => Err(Error::Unauthorized("Authentication required".to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "authorization"
    }
}

/// Runs a nested chain for requests under a path prefix, then rejoins
pub(crate) struct BranchStage {
    prefix: String,
    chain: MiddlewareChain,
}

impl BranchStage {
    pub(crate) fn new(prefix: String, chain: MiddlewareChain) -> Self {
        Self { prefix, chain }
    }
}

#[async_trait]
impl Middleware for BranchStage {
    async fn handle(&self, req: HttpRequest, next: Next) -> Result<HttpResponse, Error> {
        if path_in_prefix(req.route_path(), &self.prefix) {
            self.chain.apply(req, continuation_handler(next)).await
        } else {
            next(req).await
        }
    }

    fn name(&self) -> &'static str {
        "branch"
    }
}

fn request_services(req: &HttpRequest) -> Result<&Arc<dyn ServiceProvider>, Error> {
    req.services
        .as_ref()
        .ok_or_else(|| Error::Internal("Request has no services attached".to_string()))
}

/// Whether `path` is `prefix` or lies below it, on segment boundaries
pub(crate) fn path_in_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_in_prefix() {
        assert!(path_in_prefix("/admin", "/admin"));
        assert!(path_in_prefix("/admin/users", "/admin/"));
        assert!(!path_in_prefix("/administrator", "/admin"));
        assert!(!path_in_prefix("/", "/admin"));
        assert!(path_in_prefix("/anything", ""));
    }

    #[test]
    fn test_principal_claims() {
        let principal = Principal::new("alice").with_claim("role", "admin");
        assert_eq!(principal.claim("role"), Some("admin"));
        assert_eq!(principal.claim("missing"), None);
    }
}
