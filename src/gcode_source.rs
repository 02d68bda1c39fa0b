//! Resolution of G-code resource references into printable lines.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::FleetError;

#[async_trait]
pub trait GcodeSource: Send + Sync {
    /// Returns the lines that will be streamed to the driver, in order.
    async fn load(&self, gcode_ref: &str) -> Result<Arc<Vec<String>>, FleetError>;
}

/// Drops blank lines and whole-line comments, trims the rest.
pub fn printable_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with(';'))
        .map(str::to_string)
        .collect()
}

/// Reads G-code files below a root directory.
#[derive(Debug, Clone)]
pub struct FileGcodeSource {
    root: PathBuf,
}

impl FileGcodeSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, gcode_ref: &str) -> Result<PathBuf, FleetError> {
        let relative = Path::new(gcode_ref);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(FleetError::Validation(format!(
                "gcode ref {gcode_ref:?} escapes the gcode root"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl GcodeSource for FileGcodeSource {
    async fn load(&self, gcode_ref: &str) -> Result<Arc<Vec<String>>, FleetError> {
        let path = self.resolve(gcode_ref)?;
        tracing::info!("Reading G-code file: {}", path.display());
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FleetError::not_found("gcode", gcode_ref),
            _ => FleetError::Gcode(format!("{}: {e}", path.display())),
        })?;
        let lines = printable_lines(&content);
        tracing::info!("Processed {} G-code lines from {}", lines.len(), path.display());
        Ok(Arc::new(lines))
    }
}

/// G-code kept in memory, keyed by reference.
#[derive(Debug, Default)]
pub struct InMemoryGcodeSource {
    programs: RwLock<HashMap<String, Arc<Vec<String>>>>,
}

impl InMemoryGcodeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, gcode_ref: impl Into<String>, content: &str) {
        self.programs
            .write()
            .await
            .insert(gcode_ref.into(), Arc::new(printable_lines(content)));
    }
}

#[async_trait]
impl GcodeSource for InMemoryGcodeSource {
    async fn load(&self, gcode_ref: &str) -> Result<Arc<Vec<String>>, FleetError> {
        self.programs
            .read()
            .await
            .get(gcode_ref)
            .cloned()
            .ok_or_else(|| FleetError::not_found("gcode", gcode_ref))
    }
}
