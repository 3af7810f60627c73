// Error types for the tenant runtime

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TenantError {
    #[error("Tenant could not be resolved from the request")]
    Unresolved,

    #[error("Invalid tenant code: {0}")]
    Invalid(String),

    #[error("Tenant '{code}' failed to start: {reason}")]
    StartFailed { code: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Container(#[from] tenantry_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TenantError {
    pub(crate) fn start_failed(code: &str, reason: impl std::fmt::Display) -> Self {
        TenantError::StartFailed {
            code: code.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<TenantError> for tenantry_core::Error {
    fn from(err: TenantError) -> Self {
        match err {
            TenantError::Container(inner) => inner,
            TenantError::Unresolved | TenantError::Invalid(_) => {
                tenantry_core::Error::BadRequest(err.to_string())
            }
            TenantError::StartFailed { .. } => {
                tenantry_core::Error::ServiceUnavailable(err.to_string())
            }
            TenantError::Io(inner) => tenantry_core::Error::Io(inner),
            TenantError::Configuration(_) | TenantError::Parse(_) => {
                tenantry_core::Error::Configuration(err.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, TenantError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_is_client_error() {
        let err: tenantry_core::Error = TenantError::Unresolved.into();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_start_failure_is_unavailable() {
        let err: tenantry_core::Error = TenantError::start_failed("acme", "boom").into();
        assert_eq!(err.status_code(), 503);
        assert!(err.to_string().contains("acme"));
    }

    #[test]
    fn test_container_error_passes_through() {
        let inner = tenantry_core::Error::Forbidden("nope".into());
        let err: tenantry_core::Error = TenantError::from(inner).into();
        assert!(matches!(err, tenantry_core::Error::Forbidden(_)));
    }
}
