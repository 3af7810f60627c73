// Error types for the Tenantry runtime

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Dependency injection error: {0}")]
    DependencyInjection(String),

    #[error("Container disposed: {0}")]
    ContainerDisposed(String),

    #[error("Lifecycle hook failed: {0}")]
    Lifecycle(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Service Unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::RouteNotFound(_) => 404,
            Error::BadRequest(_) | Error::Deserialization(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::ServiceUnavailable(_) => 503,

            // Missing registrations and broken configuration are server faults
            _ => 500,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}
