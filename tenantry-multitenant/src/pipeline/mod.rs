//! Per-tenant request pipelines: composition, built-in stages and caching.

mod builder;
mod cache;
mod stages;

pub use builder::{
    AUTHENTICATION_MARKER, AUTHORIZATION_MARKER, ROUTING_MARKER, TenantApplicationBuilder,
};
pub use cache::{PipelineCache, PipelineId, RequestPipeline};
pub use stages::{AuthServicesExt, AuthorizationPolicy, Authenticator, Principal};
