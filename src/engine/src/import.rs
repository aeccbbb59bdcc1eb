//! Load orchestration: runtime detection plus bundle loading.

use std::path::Path;

use imgcd_core::Result;

use crate::bundle::BundleLoader;
use crate::runtime::{detect_runtime, ContainerRuntime};

/// Imports bundles into the detected local container runtime.
pub struct Importer {
    runtime: Box<dyn ContainerRuntime>,
}

impl Importer {
    /// Detect a local runtime (docker first, then containerd).
    pub async fn detect() -> Result<Self> {
        let runtime = detect_runtime().await?;
        Ok(Self { runtime })
    }

    /// Construct over an explicit runtime.
    pub fn with_runtime(runtime: Box<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// The detected runtime's name.
    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    /// Load a bundle. Returns the imported image reference.
    pub async fn load(&self, bundle_path: &Path) -> Result<String> {
        BundleLoader::new(self.runtime.as_ref())
            .load(bundle_path)
            .await
    }

    /// Release the runtime client.
    pub async fn close(&self) -> Result<()> {
        self.runtime.close().await
    }
}
