//! Model preview conversion (STL to GLB) behind a blocking port.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("conversion failed: {0}")]
    Failed(String),
    #[error("conversion timed out after {0:?}")]
    Timeout(Duration),
    #[error("converter task aborted: {0}")]
    Aborted(String),
}

/// Synchronous converter. Called on a blocking thread.
pub trait ModelConverter: Send + Sync {
    /// Returns a reference to the generated preview.
    fn convert(&self, model_ref: &str) -> Result<String, ConversionError>;
}

pub async fn convert_with_timeout(
    converter: Arc<dyn ModelConverter>,
    model_ref: String,
    timeout: Duration,
) -> Result<String, ConversionError> {
    let task = tokio::task::spawn_blocking(move || converter.convert(&model_ref));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(ConversionError::Aborted(join.to_string())),
        Err(_) => Err(ConversionError::Timeout(timeout)),
    }
}
