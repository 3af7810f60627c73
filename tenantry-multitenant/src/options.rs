//! Runtime options for the tenant host.
//!
//! [`TenantOptions`] is a plain value. [`LiveOptions`] holds the current
//! value behind a copy-on-write cell: readers take a cheap snapshot, writers
//! publish a new version, and snapshots already handed out never change.

use crate::{Result, TenantError};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tenantry_core::ServiceType;

/// Default period of the idle reaper
pub const DEFAULT_REAPER_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TenantOptions {
    /// Idle time after which a tenant is stopped. `None` or zero: never.
    pub stop_interval: Option<Duration>,
    /// Consult the host container for types the tenant does not register
    pub allow_fallback_to_host: bool,
    /// How often the reaper looks for idle tenants
    pub reaper_period: Duration,
    redirect_types: HashSet<ServiceType>,
    redirect_generics: HashSet<&'static str>,
}

impl Default for TenantOptions {
    fn default() -> Self {
        Self {
            stop_interval: None,
            allow_fallback_to_host: false,
            reaper_period: DEFAULT_REAPER_PERIOD,
            redirect_types: HashSet::new(),
            redirect_generics: HashSet::new(),
        }
    }
}

impl TenantOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stop_interval(mut self, interval: Duration) -> Self {
        self.stop_interval = Some(interval);
        self
    }

    pub fn with_fallback_to_host(mut self, allow: bool) -> Self {
        self.allow_fallback_to_host = allow;
        self
    }

    pub fn with_reaper_period(mut self, period: Duration) -> Self {
        self.reaper_period = period;
        self
    }

    /// Resolve `T` from the host even when the tenant could
    pub fn redirect<T: ?Sized + 'static>(&mut self) -> &mut Self {
        self.redirect_types.insert(ServiceType::of::<T>());
        self
    }

    /// Redirect every instantiation of the generic type `T` belongs to.
    ///
    /// `T` is any instantiation; `Repository<()>` redirects `Repository<User>`
    /// too. Fails when `T` is not generic.
    pub fn redirect_generic<T: ?Sized + 'static>(&mut self) -> Result<&mut Self> {
        let service_type = ServiceType::of::<T>();
        let definition = service_type.generic_definition().ok_or_else(|| {
            TenantError::Configuration(format!("{} is not a generic type", service_type))
        })?;
        self.redirect_generics.insert(definition);
        Ok(self)
    }

    /// Whether resolution of `service_type` goes to the host
    pub fn is_redirected(&self, service_type: &ServiceType) -> bool {
        self.redirect_types.contains(service_type)
            || service_type
                .generic_definition()
                .is_some_and(|definition| self.redirect_generics.contains(definition))
    }

    pub fn redirect_count(&self) -> usize {
        self.redirect_types.len() + self.redirect_generics.len()
    }

    /// The idle interval that triggers eviction, if eviction is enabled
    pub fn eviction_interval(&self) -> Option<Duration> {
        self.stop_interval.filter(|interval| !interval.is_zero())
    }
}

/// Shared, live-reconfigurable [`TenantOptions`]
#[derive(Clone)]
pub struct LiveOptions {
    current: Arc<RwLock<Arc<TenantOptions>>>,
    version: Arc<AtomicU64>,
}

impl LiveOptions {
    pub fn new(options: TenantOptions) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(options))),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The current options; unaffected by later updates
    pub fn snapshot(&self) -> Arc<TenantOptions> {
        self.current.read().clone()
    }

    /// Publish a modified copy of the current options
    pub fn update<F: FnOnce(&mut TenantOptions)>(&self, f: F) -> u64 {
        let mut current = self.current.write();
        let mut next = TenantOptions::clone(&current);
        f(&mut next);
        *current = Arc::new(next);
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn replace(&self, options: TenantOptions) -> u64 {
        *self.current.write() = Arc::new(options);
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of updates published so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self::new(TenantOptions::default())
    }
}

impl std::fmt::Debug for LiveOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveOptions")
            .field("current", &self.snapshot())
            .field("version", &self.version())
            .finish()
    }
}
