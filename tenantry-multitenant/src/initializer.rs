//! Per-tenant configuration steps.
//!
//! Initializers run once per tenant creation, in registration order, and
//! fill the tenant's [`ServiceCollection`] before its container is built.

use crate::options::TenantOptions;
use crate::Result;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tenantry_core::{
    Container, Error, Instance, Lifetime, PropertyBag, ServiceCollection, ServiceDescriptor,
    ServiceProvider, ServiceType, factory_fn,
};

/// Everything an initializer may read or change for one tenant
pub struct TenantBuilder {
    code: String,
    services: ServiceCollection,
    host: Container,
    items: PropertyBag,
    options: Arc<TenantOptions>,
}

impl TenantBuilder {
    pub(crate) fn new(code: impl Into<String>, host: Container, options: Arc<TenantOptions>) -> Self {
        Self {
            code: code.into(),
            services: ServiceCollection::new(),
            host,
            items: PropertyBag::new(),
            options,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// The tenant's registrations so far
    pub fn services(&self) -> &ServiceCollection {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut ServiceCollection {
        &mut self.services
    }

    /// The host root container
    pub fn host(&self) -> &Container {
        &self.host
    }

    /// Scratch values shared by the initializers of this tenant
    pub fn items(&self) -> &PropertyBag {
        &self.items
    }

    /// The options in effect when the tenant was created
    pub fn options(&self) -> &TenantOptions {
        &self.options
    }

    pub(crate) fn into_services(self) -> ServiceCollection {
        self.services
    }
}

impl std::fmt::Debug for TenantBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantBuilder")
            .field("code", &self.code)
            .field("services", &self.services.len())
            .field("items", &self.items)
            .finish()
    }
}

/// A configuration step run for every new tenant
#[async_trait]
pub trait TenantInitializer: Send + Sync {
    async fn initialize(&self, builder: &mut TenantBuilder) -> Result<()>;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Initializer from a synchronous closure
pub struct FnInitializer<F> {
    f: F,
}

impl<F> FnInitializer<F>
where
    F: Fn(&mut TenantBuilder) -> Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> TenantInitializer for FnInitializer<F>
where
    F: Fn(&mut TenantBuilder) -> Result<()> + Send + Sync,
{
    async fn initialize(&self, builder: &mut TenantBuilder) -> Result<()> {
        (self.f)(builder)
    }
}

/// Initializer from an async closure.
///
/// The closure gets the tenant code and the host container and returns the
/// registrations to add. Keeping the builder out of the future lets the
/// closure await freely.
pub struct AsyncInitializer<F> {
    f: F,
}

impl<F, Fut> AsyncInitializer<F>
where
    F: Fn(String, Container) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ServiceCollection>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TenantInitializer for AsyncInitializer<F>
where
    F: Fn(String, Container) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ServiceCollection>> + Send + 'static,
{
    async fn initialize(&self, builder: &mut TenantBuilder) -> Result<()> {
        let added = (self.f)(builder.code().to_string(), builder.host().clone()).await?;
        for descriptor in added.descriptors() {
            builder.services_mut().add(descriptor.clone());
        }
        Ok(())
    }
}

/// Registers, in every tenant, a singleton that is the host's instance of `T`
pub(crate) struct RedirectSingleton<T: ?Sized> {
    _marker: PhantomData<fn() -> Box<T>>,
}

impl<T: ?Sized + 'static> RedirectSingleton<T> {
    pub(crate) fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: ?Sized + 'static> TenantInitializer for RedirectSingleton<T> {
    async fn initialize(&self, builder: &mut TenantBuilder) -> Result<()> {
        let service_type = ServiceType::of::<T>();
        let host = builder.host().clone();
        let factory = factory_fn(move |_: &dyn ServiceProvider| -> std::result::Result<Instance, Error> {
            host.get_service(&service_type)?.ok_or_else(|| {
                Error::ProviderNotFound(format!(
                    "Host does not provide {}",
                    service_type.name()
                ))
            })
        });
        builder
            .services_mut()
            .add(ServiceDescriptor::new(service_type, Lifetime::Singleton, factory));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "RedirectSingleton"
    }
}
