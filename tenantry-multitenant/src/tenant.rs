//! The tenant entity and its lifecycle state.
//!
//! A [`Tenant`] pairs a shared [`TenantContext`] (code, state, access time)
//! with the tenant's own container. Handles are cheap to clone; every clone
//! refers to the same running tenant.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tenantry_core::Container;

/// Lifecycle state of a tenant.
///
/// Transitions only move forward one step at a time:
/// `Starting -> Running -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TenantState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl TenantState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TenantState::Starting,
            1 => TenantState::Running,
            2 => TenantState::Stopping,
            _ => TenantState::Stopped,
        }
    }

    /// The state that may follow this one
    pub fn next(self) -> Option<TenantState> {
        match self {
            TenantState::Starting => Some(TenantState::Running),
            TenantState::Running => Some(TenantState::Stopping),
            TenantState::Stopping => Some(TenantState::Stopped),
            TenantState::Stopped => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TenantState::Starting => "starting",
            TenantState::Running => "running",
            TenantState::Stopping => "stopping",
            TenantState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TenantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and bookkeeping of one tenant.
///
/// Registered in the tenant's own container, so tenant services can ask
/// which tenant they belong to.
pub struct TenantContext {
    code: String,
    state: AtomicU8,
    created_at: DateTime<Utc>,
    last_accessed: Mutex<DateTime<Utc>>,
}

impl TenantContext {
    pub(crate) fn new(code: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            code: code.into(),
            state: AtomicU8::new(TenantState::Starting as u8),
            created_at: now,
            last_accessed: Mutex::new(now),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn state(&self) -> TenantState {
        TenantState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        *self.last_accessed.lock()
    }

    /// Record an access now
    pub fn touch(&self) {
        self.touch_at(Utc::now());
    }

    /// Record an access at a given instant. Never moves the clock backwards.
    pub fn touch_at(&self, at: DateTime<Utc>) {
        let mut last = self.last_accessed.lock();
        if at > *last {
            *last = at;
        }
    }

    /// Move from `from` to its successor. Returns false if the tenant was not in `from`.
    pub(crate) fn advance(&self, from: TenantState) -> bool {
        let Some(to) = from.next() else {
            return false;
        };
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[cfg(test)]
    pub(crate) fn set_last_accessed(&self, at: DateTime<Utc>) {
        *self.last_accessed.lock() = at;
    }
}

impl fmt::Debug for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantContext")
            .field("code", &self.code)
            .field("state", &self.state())
            .field("last_accessed", &self.last_accessed())
            .finish()
    }
}

/// Access to the host container from inside a tenant
#[derive(Clone)]
pub struct HostContext {
    services: Container,
}

impl HostContext {
    pub(crate) fn new(services: Container) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Container {
        &self.services
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("services", &self.services)
            .finish()
    }
}

/// A running tenant: its context and its container
#[derive(Clone)]
pub struct Tenant {
    context: Arc<TenantContext>,
    services: Container,
}

impl Tenant {
    pub(crate) fn new(context: Arc<TenantContext>, services: Container) -> Self {
        Self { context, services }
    }

    pub fn code(&self) -> &str {
        self.context.code()
    }

    pub fn state(&self) -> TenantState {
        self.context.state()
    }

    pub fn context(&self) -> &Arc<TenantContext> {
        &self.context
    }

    /// The tenant's own container
    pub fn services(&self) -> &Container {
        &self.services
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        self.context.last_accessed()
    }

    /// Whether both handles refer to the same tenant instance
    pub fn ptr_eq(&self, other: &Tenant) -> bool {
        Arc::ptr_eq(&self.context, &other.context)
    }
}

impl fmt::Debug for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenant")
            .field("code", &self.code())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_states_advance_one_step_at_a_time() {
        let context = TenantContext::new("acme");
        assert_eq!(context.state(), TenantState::Starting);

        // Skipping Running is rejected
        assert!(!context.advance(TenantState::Running));
        assert_eq!(context.state(), TenantState::Starting);

        assert!(context.advance(TenantState::Starting));
        assert!(context.advance(TenantState::Running));
        assert!(context.advance(TenantState::Stopping));
        assert_eq!(context.state(), TenantState::Stopped);
        assert!(!context.advance(TenantState::Stopped));
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let context = TenantContext::new("acme");
        let now = context.last_accessed();

        context.touch_at(now - Duration::minutes(5));
        assert_eq!(context.last_accessed(), now);

        context.touch_at(now + Duration::seconds(1));
        assert_eq!(context.last_accessed(), now + Duration::seconds(1));
    }

    #[test]
    fn test_tenant_handles_share_context() {
        let tenant = Tenant::new(Arc::new(TenantContext::new("a")), Container::new());
        let other = Tenant::new(Arc::new(TenantContext::new("a")), Container::new());

        assert!(tenant.ptr_eq(&tenant.clone()));
        assert!(!tenant.ptr_eq(&other));
        assert_eq!(tenant.code(), "a");
    }
}
