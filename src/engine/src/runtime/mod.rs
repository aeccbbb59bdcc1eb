//! Local container runtime collaborators.
//!
//! The engine never talks to runtime APIs directly; it shells out through
//! this narrow interface, and only on the load side (plus base-image
//! export for incremental loads).

mod containerd;
mod docker;

pub use containerd::ContainerdRuntime;
pub use docker::DockerRuntime;

use std::path::Path;

use async_trait::async_trait;
use imgcd_core::{Error, Result};
use tokio::io::AsyncRead;

/// A local container runtime reachable through `save`/`load` operations.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// The runtime's name ("docker", "containerd").
    fn name(&self) -> &str;

    /// Export an image to a Docker archive at `out_path`.
    async fn save_image(&self, reference: &str, out_path: &Path) -> Result<()>;

    /// Load a Docker archive streamed from `reader`.
    async fn load_image_from(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()>;

    /// Release any resources held by the runtime client.
    async fn close(&self) -> Result<()>;
}

/// Detect the first available runtime: docker, then containerd.
pub async fn detect_runtime() -> Result<Box<dyn ContainerRuntime>> {
    if let Ok(docker) = DockerRuntime::detect().await {
        tracing::debug!("Detected docker runtime");
        return Ok(Box::new(docker));
    }

    if let Ok(containerd) = ContainerdRuntime::detect().await {
        tracing::debug!("Detected containerd runtime");
        return Ok(Box::new(containerd));
    }

    Err(Error::NoRuntime)
}

/// In-memory runtime double for loader tests.
#[cfg(test)]
pub struct MockRuntime {
    /// reference → Docker archive bytes the runtime can "save"
    images: std::collections::HashMap<String, Vec<u8>>,
    /// Archives handed to `load_image_from`
    loaded: std::sync::Mutex<Vec<Vec<u8>>>,
}

#[cfg(test)]
impl MockRuntime {
    pub fn new(images: std::collections::HashMap<String, Vec<u8>>) -> Self {
        Self {
            images,
            loaded: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn loaded(&self) -> Vec<Vec<u8>> {
        self.loaded.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn save_image(&self, reference: &str, out_path: &Path) -> Result<()> {
        match self.images.get(reference) {
            Some(bytes) => {
                tokio::fs::write(out_path, bytes).await?;
                Ok(())
            }
            None => Err(Error::Runtime(format!("no such image: {}", reference))),
        }
    }

    async fn load_image_from(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        use tokio::io::AsyncReadExt;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        self.loaded.lock().unwrap().push(data);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
