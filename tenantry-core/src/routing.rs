// Route table for request dispatch
//
// Patterns use matchit syntax: `/users/{id}` captures a segment,
// `/files/{*rest}` captures the remainder.

use crate::logging::trace;
use crate::middleware::HandlerFn;
use crate::{Error, HttpRequest, HttpResponse};
use std::collections::HashMap;

/// Route definition with handler
#[derive(Clone)]
pub struct Route {
    pub method: String,
    pub path: String,
    pub handler: HandlerFn,
}

impl Route {
    pub fn new(method: impl Into<String>, path: impl Into<String>, handler: HandlerFn) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            handler,
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// A resolved endpoint, ready to run
#[derive(Clone)]
pub struct RouteMatch {
    handler: HandlerFn,
    pub path_params: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
}

impl RouteMatch {
    /// Run the endpoint with the captured parameters
    pub async fn dispatch(self, mut request: HttpRequest) -> Result<HttpResponse, Error> {
        request.path_params = self.path_params;
        request.query_params = self.query_params;
        trace!(method = %request.method, path = %request.path, "Dispatching endpoint");
        (self.handler)(request).await
    }
}

impl std::fmt::Debug for RouteMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteMatch")
            .field("path_params", &self.path_params)
            .finish()
    }
}

/// Compiled route table, one radix tree per method
#[derive(Clone, Default)]
pub struct Router {
    trees: HashMap<String, matchit::Router<HandlerFn>>,
    routes: Vec<(String, String)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. Fails on an invalid or conflicting pattern.
    pub fn add_route(&mut self, route: Route) -> Result<(), Error> {
        self.trees
            .entry(route.method.clone())
            .or_insert_with(matchit::Router::new)
            .insert(route.path.clone(), route.handler)
            .map_err(|e| {
                Error::Configuration(format!(
                    "Invalid route {} {}: {}",
                    route.method, route.path, e
                ))
            })?;
        self.routes.push((route.method, route.path));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered `(method, pattern)` pairs in insertion order
    pub fn routes(&self) -> &[(String, String)] {
        &self.routes
    }

    /// Find the handler for a request without running it
    pub fn lookup(&self, request: &HttpRequest) -> Option<RouteMatch> {
        let (path, query) = match request.path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (request.path.as_str(), None),
        };

        let matched = self
            .trees
            .get(&request.method.to_ascii_uppercase())?
            .at(path)
            .ok()?;

        Some(RouteMatch {
            handler: matched.value.clone(),
            path_params: matched
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            query_params: query.map(parse_query_string).unwrap_or_default(),
        })
    }

    /// Dispatch to the matching handler, filling path and query parameters
    pub async fn route(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        match self.lookup(&request) {
            Some(matched) => matched.dispatch(request).await,
            None => Err(Error::RouteNotFound(format!(
                "{} {}",
                request.method,
                request.route_path()
            ))),
        }
    }

    /// Whether any route matches the method and path
    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.trees
            .get(&method.to_ascii_uppercase())
            .is_some_and(|tree| tree.at(path).is_ok())
    }
}

/// Parse a query string into a map of parameters
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}
