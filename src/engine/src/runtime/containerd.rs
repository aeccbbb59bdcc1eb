//! containerd runtime collaborator (shells out to the `ctr` CLI).

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use imgcd_core::{Error, Result};
use tokio::process::Command;

use super::ContainerRuntime;

pub struct ContainerdRuntime;

impl ContainerdRuntime {
    /// Probe for a usable containerd via `ctr`.
    pub async fn detect() -> Result<Self> {
        let status = Command::new("ctr")
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Runtime(format!("ctr not available: {}", e)))?;

        if !status.success() {
            return Err(Error::Runtime("containerd not responding".to_string()));
        }

        Ok(Self)
    }
}

#[async_trait]
impl ContainerRuntime for ContainerdRuntime {
    fn name(&self) -> &str {
        "containerd"
    }

    async fn save_image(&self, reference: &str, out_path: &Path) -> Result<()> {
        let output = Command::new("ctr")
            .arg("images")
            .arg("export")
            .arg(out_path)
            .arg(reference)
            .output()
            .await
            .map_err(|e| Error::Runtime(format!("failed to run ctr images export: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "ctr images export {} failed: {}",
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
        // ctr wants a file argument; stage the stream to a temp file.
        let staged = tempfile::NamedTempFile::new()
            .map_err(|e| Error::Runtime(format!("failed to stage archive: {}", e)))?;
        let std_file = staged
            .reopen()
            .map_err(|e| Error::Runtime(format!("failed to stage archive: {}", e)))?;
        let mut file = tokio::fs::File::from_std(std_file);
        tokio::io::copy(reader, &mut file).await?;

        let output = Command::new("ctr")
            .arg("images")
            .arg("import")
            .arg(staged.path())
            .output()
            .await
            .map_err(|e| Error::Runtime(format!("failed to run ctr images import: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "ctr images import failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
