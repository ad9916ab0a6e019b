//! Error types for Intercom

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("instance already registered: {service}/{instance_id}")]
    DuplicateInstance { service: String, instance_id: String },

    #[error("instance not found: {service}/{instance_id}")]
    InstanceNotFound { service: String, instance_id: String },

    #[error("task already exists: {0}")]
    DuplicateTask(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn duplicate_instance(service: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self::DuplicateInstance {
            service: service.into(),
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_not_found(service: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self::InstanceNotFound {
            service: service.into(),
            instance_id: instance_id.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Caller referenced an entity that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::InstanceNotFound { .. } | Self::TaskNotFound(_))
    }

    /// Caller tried to create an entity whose identity is already taken.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::DuplicateInstance { .. } | Self::DuplicateTask(_))
    }
}
