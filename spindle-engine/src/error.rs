//! Engine error surface.

use spindle_dir::DirError;
use spindle_model::ModelError;
use spindle_proto::ProtoError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Dir(#[from] DirError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error("provider: {0}")]
    Provider(#[from] crate::provider::ProviderError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("configuration rejected: {0}")]
    Config(String),
    #[error("shutting down")]
    Shutdown,
}
