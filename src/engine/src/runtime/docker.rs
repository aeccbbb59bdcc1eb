//! Docker runtime collaborator (shells out to the `docker` CLI).

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use imgcd_core::{Error, Result};
use tokio::process::Command;

use super::ContainerRuntime;

pub struct DockerRuntime;

impl DockerRuntime {
    /// Probe for a usable docker daemon.
    pub async fn detect() -> Result<Self> {
        let status = Command::new("docker")
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Runtime(format!("docker not available: {}", e)))?;

        if !status.success() {
            return Err(Error::Runtime("docker daemon not responding".to_string()));
        }

        Ok(Self)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn save_image(&self, reference: &str, out_path: &Path) -> Result<()> {
        let output = Command::new("docker")
            .arg("save")
            .arg("-o")
            .arg(out_path)
            .arg(reference)
            .output()
            .await
            .map_err(|e| Error::Runtime(format!("failed to run docker save: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "docker save {} failed: {}",
                reference,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }

    async fn load_image_from(
        &self,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let mut child = Command::new("docker")
            .arg("load")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Runtime(format!("failed to run docker load: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Runtime("docker load stdin unavailable".to_string()))?;
        tokio::io::copy(reader, &mut stdin).await?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Runtime(format!("docker load did not finish: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "docker load failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::debug!(
            output = %String::from_utf8_lossy(&output.stdout).trim(),
            "docker load finished"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
