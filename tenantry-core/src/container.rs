// Dependency injection container
//
// Registration happens on a `ServiceCollection`; `build()` freezes it into a
// `Container`. Singletons live in the container, scoped instances live in a
// `Scope` created per request, transients are created on every resolution.

use crate::Error;
use crate::logging::{debug, trace};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A type-erased, shareable service instance
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Factory producing an instance. Receives the provider used to resolve dependencies.
pub type Factory = Arc<dyn Fn(&dyn ServiceProvider) -> Result<Instance, Error> + Send + Sync>;

/// Identity of a registered service type.
///
/// Equality and hashing use the `TypeId` only; the name is kept for
/// diagnostics and for matching generic definitions.
#[derive(Clone, Copy)]
pub struct ServiceType {
    id: TypeId,
    name: &'static str,
}

impl ServiceType {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The unparameterized form of a generic type.
    ///
    /// `app::Repository<app::User>` yields `Some("app::Repository")`;
    /// non-generic types yield `None`.
    pub fn generic_definition(&self) -> Option<&'static str> {
        self.name.find('<').map(|idx| &self.name[..idx])
    }
}

impl PartialEq for ServiceType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceType {}

impl Hash for ServiceType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// How long a resolved instance lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// One instance per container
    Singleton,
    /// One instance per scope
    Scoped,
    /// A new instance per resolution
    Transient,
}

/// A single registration
#[derive(Clone)]
pub struct ServiceDescriptor {
    service_type: ServiceType,
    lifetime: Lifetime,
    factory: Factory,
}

impl ServiceDescriptor {
    pub fn new(service_type: ServiceType, lifetime: Lifetime, factory: Factory) -> Self {
        Self {
            service_type,
            lifetime,
            factory,
        }
    }

    pub fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("service_type", &self.service_type)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

/// Read side of the container abstraction.
///
/// `Ok(None)` means "not registered"; `Err` means a registration exists but
/// could not be activated (or the container was disposed).
pub trait ServiceProvider: Send + Sync {
    /// Resolve the last registration for a type
    fn get_service(&self, service_type: &ServiceType) -> Result<Option<Instance>, Error>;

    /// Resolve every registration for a type, in registration order
    fn get_services(&self, service_type: &ServiceType) -> Result<Vec<Instance>, Error>;

    /// Whether a registration exists, without activating anything
    fn is_registered(&self, service_type: &ServiceType) -> bool;
}

/// Typed helpers available on every provider, including `dyn ServiceProvider`
pub trait ServiceProviderExt: ServiceProvider {
    /// Resolve a provider by type
    fn resolve<T: Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>, Error> {
        match self.get_service(&ServiceType::of::<T>())? {
            Some(instance) => downcast::<T>(instance).map(Some),
            None => Ok(None),
        }
    }

    /// Resolve a provider, failing when it is not registered
    fn resolve_required<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, Error> {
        self.resolve::<T>()?.ok_or_else(|| {
            Error::ProviderNotFound(format!(
                "Provider not found: {}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Resolve every registration of a type
    fn resolve_all<T: Send + Sync + 'static>(&self) -> Result<Vec<Arc<T>>, Error> {
        self.get_services(&ServiceType::of::<T>())?
            .into_iter()
            .map(downcast::<T>)
            .collect()
    }

    /// Check if a provider is registered
    fn has<T: ?Sized + 'static>(&self) -> bool {
        self.is_registered(&ServiceType::of::<T>())
    }
}

impl<P: ServiceProvider + ?Sized> ServiceProviderExt for P {}

fn downcast<T: Send + Sync + 'static>(instance: Instance) -> Result<Arc<T>, Error> {
    instance.downcast::<T>().map_err(|_| {
        Error::DependencyInjection(format!(
            "Registered instance is not a {}",
            std::any::type_name::<T>()
        ))
    })
}

/// Mutable registration list, frozen by [`ServiceCollection::build`]
#[derive(Clone, Default)]
pub struct ServiceCollection {
    descriptors: Vec<ServiceDescriptor>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[ServiceDescriptor] {
        &self.descriptors
    }

    /// Append a registration
    pub fn add(&mut self, descriptor: ServiceDescriptor) -> &mut Self {
        trace!(
            provider = descriptor.service_type.name,
            lifetime = ?descriptor.lifetime,
            "Registering provider"
        );
        self.descriptors.push(descriptor);
        self
    }

    /// Append a registration only if the type has none yet
    pub fn try_add(&mut self, descriptor: ServiceDescriptor) -> bool {
        if self.contains_type(&descriptor.service_type) {
            return false;
        }
        self.add(descriptor);
        true
    }

    /// Register an existing instance as a singleton
    pub fn add_singleton<T: Send + Sync + 'static>(&mut self, instance: T) -> &mut Self {
        self.add(singleton_instance(instance))
    }

    /// Register an existing instance unless the type is already registered
    pub fn try_add_singleton<T: Send + Sync + 'static>(&mut self, instance: T) -> bool {
        self.try_add(singleton_instance(instance))
    }

    /// Register a singleton built lazily on first resolution
    pub fn add_singleton_factory<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&dyn ServiceProvider) -> Result<T, Error> + Send + Sync + 'static,
    {
        self.add(typed_descriptor(Lifetime::Singleton, factory))
    }

    /// Register a service created once per scope
    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&dyn ServiceProvider) -> Result<T, Error> + Send + Sync + 'static,
    {
        self.add(typed_descriptor(Lifetime::Scoped, factory))
    }

    /// Register a service created on every resolution
    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&dyn ServiceProvider) -> Result<T, Error> + Send + Sync + 'static,
    {
        self.add(typed_descriptor(Lifetime::Transient, factory))
    }

    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.contains_type(&ServiceType::of::<T>())
    }

    pub fn contains_type(&self, service_type: &ServiceType) -> bool {
        self.descriptors
            .iter()
            .any(|d| d.service_type == *service_type)
    }

    /// Drop every registration of a type
    pub fn remove_all<T: ?Sized + 'static>(&mut self) -> usize {
        let service_type = ServiceType::of::<T>();
        let before = self.descriptors.len();
        self.descriptors.retain(|d| d.service_type != service_type);
        before - self.descriptors.len()
    }

    /// Freeze the registrations into a container
    pub fn build(self) -> Container {
        self.build_named("container")
    }

    /// Freeze the registrations into a container with a diagnostic name
    pub fn build_named(self, name: impl Into<String>) -> Container {
        Container::from_descriptors(name.into(), self.descriptors)
    }
}

/// Box a closure as a [`Factory`]
pub fn factory_fn<F>(f: F) -> Factory
where
    F: Fn(&dyn ServiceProvider) -> Result<Instance, Error> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn singleton_instance<T: Send + Sync + 'static>(instance: T) -> ServiceDescriptor {
    let instance: Instance = Arc::new(instance);
    ServiceDescriptor::new(
        ServiceType::of::<T>(),
        Lifetime::Singleton,
        factory_fn(move |_| Ok(instance.clone())),
    )
}

fn typed_descriptor<T, F>(lifetime: Lifetime, factory: F) -> ServiceDescriptor
where
    T: Send + Sync + 'static,
    F: Fn(&dyn ServiceProvider) -> Result<T, Error> + Send + Sync + 'static,
{
    ServiceDescriptor::new(
        ServiceType::of::<T>(),
        lifetime,
        factory_fn(move |provider| factory(provider).map(|value| Arc::new(value) as Instance)),
    )
}

struct Registrations {
    descriptors: Vec<ServiceDescriptor>,
    index: HashMap<TypeId, Vec<usize>>,
    singletons: Vec<OnceCell<Instance>>,
}

struct ContainerInner {
    name: String,
    registrations: RwLock<Option<Registrations>>,
}

/// The dependency injection container
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    /// Create an empty container
    pub fn new() -> Self {
        ServiceCollection::new().build()
    }

    fn from_descriptors(name: String, descriptors: Vec<ServiceDescriptor>) -> Self {
        let mut index: HashMap<TypeId, Vec<usize>> = HashMap::new();
        for (i, descriptor) in descriptors.iter().enumerate() {
            index.entry(descriptor.service_type.id).or_default().push(i);
        }
        let singletons = descriptors.iter().map(|_| OnceCell::new()).collect();

        debug!(
            container = %name,
            provider_count = descriptors.len(),
            "Creating new DI container"
        );

        Self {
            inner: Arc::new(ContainerInner {
                name,
                registrations: RwLock::new(Some(Registrations {
                    descriptors,
                    index,
                    singletons,
                })),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Create a scope for scoped services (one per request)
    pub fn create_scope(&self) -> Scope {
        trace!(container = %self.inner.name, "Creating scope");
        Scope {
            root: self.clone(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Whether two handles refer to the same container
    pub fn ptr_eq(&self, other: &Container) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.registrations.read().is_none()
    }

    /// Release every cached instance. Later resolutions fail.
    ///
    /// Returns false when the container was already disposed.
    pub fn dispose(&self) -> bool {
        let taken = self.inner.registrations.write().take();
        match taken {
            Some(registrations) => {
                let count = registrations.descriptors.len();
                drop(registrations);
                debug!(
                    container = %self.inner.name,
                    provider_count = count,
                    "Disposed DI container"
                );
                true
            }
            None => false,
        }
    }

    fn with_registrations<R>(
        &self,
        f: impl FnOnce(&Registrations) -> Result<R, Error>,
    ) -> Result<R, Error> {
        // Recursive read: factories resolve their dependencies through the same container
        let guard = self.inner.registrations.read_recursive();
        match guard.as_ref() {
            Some(registrations) => f(registrations),
            None => Err(Error::ContainerDisposed(self.inner.name.clone())),
        }
    }

    fn activate(
        &self,
        registrations: &Registrations,
        index: usize,
        scope: Option<&Scope>,
        outer: &dyn ServiceProvider,
    ) -> Result<Instance, Error> {
        let descriptor = &registrations.descriptors[index];
        let root: &dyn ServiceProvider = self;
        match descriptor.lifetime {
            Lifetime::Singleton => registrations.singletons[index]
                .get_or_try_init(|| (descriptor.factory)(root))
                .cloned(),
            Lifetime::Scoped => match scope {
                Some(scope) => scope.get_or_create(index, || (descriptor.factory)(outer)),
                None => Err(Error::DependencyInjection(format!(
                    "Scoped service {} cannot be resolved from the root container",
                    descriptor.service_type
                ))),
            },
            Lifetime::Transient => (descriptor.factory)(outer),
        }
    }

    fn resolve_in(
        &self,
        service_type: &ServiceType,
        scope: Option<&Scope>,
        outer: &dyn ServiceProvider,
    ) -> Result<Option<Instance>, Error> {
        self.with_registrations(|registrations| {
            let Some(&index) = registrations
                .index
                .get(&service_type.id)
                .and_then(|indices| indices.last())
            else {
                trace!(provider = service_type.name, "Provider not found in container");
                return Ok(None);
            };
            self.activate(registrations, index, scope, outer).map(Some)
        })
    }

    fn resolve_all_in(
        &self,
        service_type: &ServiceType,
        scope: Option<&Scope>,
        outer: &dyn ServiceProvider,
    ) -> Result<Vec<Instance>, Error> {
        self.with_registrations(|registrations| {
            let Some(indices) = registrations.index.get(&service_type.id) else {
                return Ok(Vec::new());
            };
            indices
                .iter()
                .map(|&index| self.activate(registrations, index, scope, outer))
                .collect()
        })
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.inner.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl ServiceProvider for Container {
    fn get_service(&self, service_type: &ServiceType) -> Result<Option<Instance>, Error> {
        self.resolve_in(service_type, None, self)
    }

    fn get_services(&self, service_type: &ServiceType) -> Result<Vec<Instance>, Error> {
        self.resolve_all_in(service_type, None, self)
    }

    fn is_registered(&self, service_type: &ServiceType) -> bool {
        self.inner
            .registrations
            .read_recursive()
            .as_ref()
            .is_some_and(|r| r.index.contains_key(&service_type.id))
    }
}

/// A resolution scope. Scoped instances are dropped with the scope.
pub struct Scope {
    root: Container,
    instances: Mutex<HashMap<usize, Instance>>,
}

impl Scope {
    pub fn container(&self) -> &Container {
        &self.root
    }

    /// Resolve through this scope, handing `outer` to factories so that
    /// dependencies are looked up through a wrapping provider.
    pub fn get_service_via(
        &self,
        service_type: &ServiceType,
        outer: &dyn ServiceProvider,
    ) -> Result<Option<Instance>, Error> {
        self.root.resolve_in(service_type, Some(self), outer)
    }

    pub fn get_services_via(
        &self,
        service_type: &ServiceType,
        outer: &dyn ServiceProvider,
    ) -> Result<Vec<Instance>, Error> {
        self.root.resolve_all_in(service_type, Some(self), outer)
    }

    fn get_or_create(
        &self,
        index: usize,
        create: impl FnOnce() -> Result<Instance, Error>,
    ) -> Result<Instance, Error> {
        if let Some(existing) = self.instances.lock().get(&index) {
            return Ok(existing.clone());
        }
        // The lock is released while the factory runs; it may resolve other scoped services
        let created = create()?;
        Ok(self
            .instances
            .lock()
            .entry(index)
            .or_insert(created)
            .clone())
    }
}

impl ServiceProvider for Scope {
    fn get_service(&self, service_type: &ServiceType) -> Result<Option<Instance>, Error> {
        self.get_service_via(service_type, self)
    }

    fn get_services(&self, service_type: &ServiceType) -> Result<Vec<Instance>, Error> {
        self.get_services_via(service_type, self)
    }

    fn is_registered(&self, service_type: &ServiceType) -> bool {
        self.root.is_registered(service_type)
    }
}
