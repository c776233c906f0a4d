use crate::config::ConfigError;
use thiserror::Error;
use vista_assets::LoadError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Scene has no panorama URL")]
    EmptyUrl,
    #[error("Load of {url} was cancelled")]
    Cancelled { url: String },
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("Invalid pipeline configuration: {0}")]
    Config(#[from] ConfigError),
}
