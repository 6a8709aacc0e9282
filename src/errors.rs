//! Error types for the pool core

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool not open")]
    PoolClosed,

    #[error("Monitoring is not enabled for this pool")]
    MonitoringDisabled,

    #[error("Notification listener is not registered")]
    ListenerNotFound,

    #[error("Object validation failed")]
    ValidationFailed,

    #[error("Resource factory failed: {0}")]
    Factory(String),

    #[error("Eviction failed: {0}")]
    Eviction(String),
}

pub type PoolResult<T> = Result<T, PoolError>;
