//! Resolving the tenant code of a request.

use crate::Result;
use async_trait::async_trait;
use tenantry_core::HttpRequest;

/// Maps a request to a tenant code. `Ok(None)` means no tenant applies.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    async fn resolve(&self, request: &HttpRequest) -> Result<Option<String>>;
}

/// Uses the `Host` header as the tenant code.
///
/// Without `include_port` only the host name is used. With it, the port is
/// kept unless it is the default for the request scheme (80 for http, 443
/// for https). The scheme comes from `X-Forwarded-Proto`, defaulting to
/// http.
#[derive(Debug, Clone, Default)]
pub struct HostTenantResolver {
    include_port: bool,
}

impl HostTenantResolver {
    pub fn new(include_port: bool) -> Self {
        Self { include_port }
    }

    /// Derive the tenant code from a `Host` value and scheme
    pub fn code_for(&self, host: &str, scheme: &str) -> Option<String> {
        let host = host.trim();
        if host.is_empty() {
            return None;
        }
        let (name, port) = split_host_port(host);
        if name.is_empty() {
            return None;
        }

        match port {
            Some(port) if self.include_port && !is_default_port(scheme, port) => {
                Some(format!("{}:{}", name, port))
            }
            _ => Some(name.to_string()),
        }
    }
}

#[async_trait]
impl TenantResolver for HostTenantResolver {
    async fn resolve(&self, request: &HttpRequest) -> Result<Option<String>> {
        let scheme = request.header("x-forwarded-proto").unwrap_or("http");
        Ok(request
            .header("host")
            .and_then(|host| self.code_for(host, scheme)))
    }
}

fn split_host_port(host: &str) -> (&str, Option<&str>) {
    // Bracketed IPv6 literal, e.g. [::1]:8080
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => {
                let port = host[end + 1..].strip_prefix(':');
                (&host[..=end], port.filter(|p| !p.is_empty()))
            }
            None => (host, None),
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() => (name, Some(port)),
        Some((name, _)) => (name, None),
        None => (host, None),
    }
}

fn is_default_port(scheme: &str, port: &str) -> bool {
    matches!(
        (scheme.to_ascii_lowercase().as_str(), port),
        ("http", "80") | ("https", "443")
    )
}

/// Reads the tenant code from a request header
#[derive(Debug, Clone)]
pub struct HeaderTenantResolver {
    header: String,
}

impl HeaderTenantResolver {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

#[async_trait]
impl TenantResolver for HeaderTenantResolver {
    async fn resolve(&self, request: &HttpRequest) -> Result<Option<String>> {
        Ok(request
            .header(&self.header)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string))
    }
}

/// Resolver built from a closure
pub struct FnTenantResolver<F> {
    f: F,
}

impl<F> FnTenantResolver<F>
where
    F: Fn(&HttpRequest) -> Option<String> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> TenantResolver for FnTenantResolver<F>
where
    F: Fn(&HttpRequest) -> Option<String> + Send + Sync,
{
    async fn resolve(&self, request: &HttpRequest) -> Result<Option<String>> {
        Ok((self.f)(request))
    }
}
