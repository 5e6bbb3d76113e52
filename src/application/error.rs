use thiserror::Error;

use crate::{config::LoadError, infra::error::InfraError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
}

impl From<crate::cache::StoreError> for AppError {
    fn from(err: crate::cache::StoreError) -> Self {
        Self::Infra(InfraError::from(err))
    }
}
