//! Per-request resolution across the tenant and host containers.
//!
//! A [`ResolutionBridge`] answers service lookups for one request:
//!
//! 1. the tenant's request scope, if the tenant registers the type;
//! 2. otherwise the host's request services, if the type is redirected;
//! 3. otherwise the host's request services, if fallback is enabled. The
//!    first fallback for a type emits one debug notice for the process;
//! 4. otherwise the type is reported absent.
//!
//! Tenant factories resolve their own dependencies through the bridge, so
//! a tenant service can depend on a redirected host service.

use crate::options::TenantOptions;
use crate::tenant::Tenant;
use dashmap::DashSet;
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;
use tenantry_core::{Error, Instance, Scope, ServiceProvider, ServiceType};

/// Types already reported as falling back to the host.
///
/// Keyed by type only, so one notice covers every tenant.
#[derive(Clone, Default)]
pub struct FallbackNotices {
    notified: Arc<DashSet<TypeId>>,
}

impl FallbackNotices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit the notice for `service_type` unless it was already emitted
    pub fn notify_once(&self, service_type: &ServiceType, tenant: &str) -> bool {
        let first = self.notified.insert(service_type.id());
        if first {
            tracing::debug!(
                service = service_type.name(),
                tenant = %tenant,
                "Resolving from the host container; register the type in the tenant or redirect it to silence this"
            );
        }
        first
    }

    pub fn contains(&self, service_type: &ServiceType) -> bool {
        self.notified.contains(&service_type.id())
    }

    pub fn len(&self) -> usize {
        self.notified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notified.is_empty()
    }
}

/// The provider seen by tenant code during a request
pub struct ResolutionBridge {
    tenant: Tenant,
    scope: Scope,
    host: Arc<dyn ServiceProvider>,
    options: Arc<TenantOptions>,
    notices: FallbackNotices,
}

impl ResolutionBridge {
    /// Open a tenant request scope bridged to `host`
    pub fn new(
        tenant: Tenant,
        host: Arc<dyn ServiceProvider>,
        options: Arc<TenantOptions>,
        notices: FallbackNotices,
    ) -> Self {
        let scope = tenant.services().create_scope();
        Self {
            tenant,
            scope,
            host,
            options,
            notices,
        }
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    /// The host request services this bridge falls back to
    pub fn host(&self) -> &Arc<dyn ServiceProvider> {
        &self.host
    }

    /// The host provider to consult for a type the tenant lacks, if any
    fn host_for(&self, service_type: &ServiceType) -> Option<&dyn ServiceProvider> {
        if self.options.is_redirected(service_type) {
            return Some(self.host.as_ref());
        }
        if self.options.allow_fallback_to_host {
            self.notices.notify_once(service_type, self.tenant.code());
            return Some(self.host.as_ref());
        }
        None
    }
}

impl ServiceProvider for ResolutionBridge {
    fn get_service(&self, service_type: &ServiceType) -> Result<Option<Instance>, Error> {
        if let Some(instance) = self.scope.get_service_via(service_type, self)? {
            return Ok(Some(instance));
        }
        match self.host_for(service_type) {
            Some(host) => host.get_service(service_type),
            None => Ok(None),
        }
    }

    fn get_services(&self, service_type: &ServiceType) -> Result<Vec<Instance>, Error> {
        let local = self.scope.get_services_via(service_type, self)?;
        if !local.is_empty() {
            return Ok(local);
        }
        match self.host_for(service_type) {
            Some(host) => host.get_services(service_type),
            None => Ok(Vec::new()),
        }
    }

    fn is_registered(&self, service_type: &ServiceType) -> bool {
        if self.scope.is_registered(service_type) {
            return true;
        }
        (self.options.is_redirected(service_type) || self.options.allow_fallback_to_host)
            && self.host.is_registered(service_type)
    }
}

impl fmt::Debug for ResolutionBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionBridge")
            .field("tenant", &self.tenant.code())
            .field("fallback", &self.options.allow_fallback_to_host)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::TenantContext;
    use tenantry_core::{ServiceCollection, ServiceProviderExt};

    struct Greeting(&'static str);
    struct HostOnly(&'static str);
    struct Missing;

    fn tenant_with(services: ServiceCollection) -> Tenant {
        Tenant::new(Arc::new(TenantContext::new("acme")), services.build_named("tenant:acme"))
    }

    fn host() -> Arc<dyn ServiceProvider> {
        let mut services = ServiceCollection::new();
        services.add_singleton(Greeting("host"));
        services.add_singleton(HostOnly("host"));
        Arc::new(services.build_named("host"))
    }

    fn tenant() -> Tenant {
        let mut services = ServiceCollection::new();
        services.add_singleton(Greeting("tenant"));
        tenant_with(services)
    }

    #[test]
    fn test_tenant_registration_wins() {
        let bridge = ResolutionBridge::new(tenant(), host(), Arc::default(), FallbackNotices::new());
        assert_eq!(bridge.resolve_required::<Greeting>().unwrap().0, "tenant");
    }

    #[test]
    fn test_host_only_type_is_absent_without_fallback() {
        let notices = FallbackNotices::new();
        let bridge = ResolutionBridge::new(tenant(), host(), Arc::default(), notices.clone());

        assert!(bridge.resolve::<HostOnly>().unwrap().is_none());
        assert!(!bridge.has::<HostOnly>());
        assert!(notices.is_empty());
    }

    #[test]
    fn test_redirected_type_comes_from_host() {
        let mut options = TenantOptions::new();
        options.redirect::<HostOnly>();
        let bridge = ResolutionBridge::new(tenant(), host(), Arc::new(options), FallbackNotices::new());

        assert_eq!(bridge.resolve_required::<HostOnly>().unwrap().0, "host");
        assert!(bridge.has::<HostOnly>());
    }

    #[test]
    fn test_fallback_notice_is_emitted_once_per_type() {
        let notices = FallbackNotices::new();
        let options = Arc::new(TenantOptions::new().with_fallback_to_host(true));
        let bridge = ResolutionBridge::new(tenant(), host(), options.clone(), notices.clone());

        assert_eq!(bridge.resolve_required::<HostOnly>().unwrap().0, "host");
        assert!(bridge.resolve::<Missing>().unwrap().is_none());
        assert_eq!(notices.len(), 2);

        // Another tenant sharing the notices does not report the type again
        let other = ResolutionBridge::new(tenant(), host(), options, notices.clone());
        other.resolve::<HostOnly>().unwrap();
        assert_eq!(notices.len(), 2);
        assert!(notices.contains(&ServiceType::of::<HostOnly>()));
    }

    #[test]
    fn test_tenant_factory_resolves_dependencies_through_bridge() {
        struct Report(String);

        let mut services = ServiceCollection::new();
        services.add_scoped(|sp: &dyn ServiceProvider| {
            let clock = sp.resolve_required::<HostOnly>()?;
            Ok(Report(format!("from {}", clock.0)))
        });
        let mut options = TenantOptions::new();
        options.redirect::<HostOnly>();

        let bridge = ResolutionBridge::new(
            tenant_with(services),
            host(),
            Arc::new(options),
            FallbackNotices::new(),
        );
        assert_eq!(bridge.resolve_required::<Report>().unwrap().0, "from host");
    }

    #[test]
    fn test_scoped_instances_are_per_bridge() {
        struct Counter;

        let mut services = ServiceCollection::new();
        services.add_scoped(|_| Ok(Counter));
        let tenant = tenant_with(services);

        let first = ResolutionBridge::new(tenant.clone(), host(), Arc::default(), FallbackNotices::new());
        let second = ResolutionBridge::new(tenant, host(), Arc::default(), FallbackNotices::new());

        let a = first.resolve_required::<Counter>().unwrap();
        assert!(Arc::ptr_eq(&a, &first.resolve_required::<Counter>().unwrap()));
        assert!(!Arc::ptr_eq(&a, &second.resolve_required::<Counter>().unwrap()));
    }
}
