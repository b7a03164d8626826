//! Resolution of per-container log paths from container labels.
//!
//! Logs land under
//! `<root>/<application>/<partition>/<instance>/<code package>/<code package instance>/application.log`,
//! where every component comes from a container label.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::config::DriverConfig;
use crate::error::{LogDriverError, Result};
use crate::types::StreamMetadata;

/// Label naming the root directory for a container's logs.
pub const LOG_ROOT_LABEL: &str = "LogRootPath";
/// Label carrying the digested application name.
pub const APPLICATION_LABEL: &str = "DigestedApplicationName";
/// Label carrying the partition id.
pub const PARTITION_LABEL: &str = "PartitionId";
/// Label carrying the service package activation id.
pub const INSTANCE_LABEL: &str = "ServicePackageActivationId";
/// Label carrying the code package name.
pub const CODE_PACKAGE_LABEL: &str = "CodePackageName";
/// Label carrying the code package instance.
pub const CODE_PACKAGE_INSTANCE_LABEL: &str = "CodePackageInstance";

const COMPONENT_LABELS: [&str; 5] = [
    APPLICATION_LABEL,
    PARTITION_LABEL,
    INSTANCE_LABEL,
    CODE_PACKAGE_LABEL,
    CODE_PACKAGE_INSTANCE_LABEL,
];

/// Maps stream metadata to the path handed to the storage engine.
///
/// Implementations must create any intermediate directories.
pub trait LogPathPolicy: Send + Sync {
    /// Resolves the log file path for a stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid or its directories cannot be
    /// created.
    fn resolve(&self, metadata: &StreamMetadata) -> Result<PathBuf>;
}

/// Label-driven path layout.
#[derive(Debug, Clone)]
pub struct LabelPathPolicy {
    default_root: PathBuf,
    file_name: String,
}

impl Default for LabelPathPolicy {
    fn default() -> Self {
        Self::from_config(&DriverConfig::default())
    }
}

impl LabelPathPolicy {
    /// Creates a policy with the given fallback root and file name.
    #[must_use]
    pub fn new(default_root: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            default_root: default_root.into(),
            file_name: file_name.into(),
        }
    }

    /// Creates a policy from driver configuration.
    #[must_use]
    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(config.log_root.clone(), config.log_file_name.clone())
    }

    /// Returns the fallback root.
    #[must_use]
    pub fn default_root(&self) -> &Path {
        &self.default_root
    }

    /// Computes the path without touching the filesystem beyond root validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the labelled root is not an existing directory or a
    /// component label would escape the root.
    pub fn compute(&self, metadata: &StreamMetadata) -> Result<PathBuf> {
        let mut path = self.root_for(metadata)?;

        for label in COMPONENT_LABELS {
            let Some(value) = metadata.label(label).filter(|v| !v.is_empty()) else {
                continue;
            };
            check_component(label, value, &path)?;
            path.push(value);
        }

        path.push(&self.file_name);
        Ok(path)
    }

    fn root_for(&self, metadata: &StreamMetadata) -> Result<PathBuf> {
        let root = metadata.label(LOG_ROOT_LABEL).map(str::trim).unwrap_or_default();

        if root.is_empty() {
            warn!(
                container_id = %metadata.container_id,
                root = %self.default_root.display(),
                "log root label is not set on the container, using default root"
            );
            return Ok(self.default_root.clone());
        }

        let root = PathBuf::from(root);
        match fs::metadata(&root) {
            Ok(info) if info.is_dir() => Ok(root),
            Ok(_) => Err(LogDriverError::InvalidPath {
                path: root,
                reason: "not a directory".to_string(),
            }),
            Err(e) => Err(LogDriverError::InvalidPath {
                path: root,
                reason: e.to_string(),
            }),
        }
    }
}

impl LogPathPolicy for LabelPathPolicy {
    fn resolve(&self, metadata: &StreamMetadata) -> Result<PathBuf> {
        let path = self.compute(metadata)?;

        if let Some(parent) = path.parent() {
            create_log_dir(parent)?;
        }

        debug!(
            container_id = %metadata.container_id,
            path = %path.display(),
            "resolved log path"
        );
        Ok(path)
    }
}

fn check_component(label: &str, value: &str, at: &Path) -> Result<()> {
    let mut components = Path::new(value).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );

    if single_normal {
        Ok(())
    } else {
        Err(LogDriverError::InvalidPath {
            path: at.join(value),
            reason: format!("label {label} must be a single path component"),
        })
    }
}

#[cfg(unix)]
fn create_log_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(dir)
        .map_err(|e| LogDriverError::setup("error setting up logger dir", e))
}

#[cfg(not(unix))]
fn create_log_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| LogDriverError::setup("error setting up logger dir", e))
}
