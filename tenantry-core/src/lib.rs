// Core library for the Tenantry multi-tenant runtime
// Dependency injection, hosted-service lifecycle, request pipeline primitives

pub mod container;
pub mod error;
pub mod extensions;
pub mod host;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod middleware;
pub mod property_bag;
pub mod routing;

// Re-export commonly used types
pub use container::*;
pub use error::*;
pub use extensions::*;
pub use host::*;
pub use http::*;
pub use lifecycle::{HookFailure, HostedService, LifecycleResult, Phase};
pub use middleware::*;
pub use property_bag::*;
pub use routing::{Route, RouteMatch, Router};
