//! Renders a [`DiffResult`] as text or JSON.

use std::io::Write;

use imgcd_core::Result;

use super::{DiffResult, LayerStatus};

/// Output format for diff results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Formatting options.
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub format: OutputFormat,
    /// Include per-layer details.
    pub verbose: bool,
}

/// Formats diff results for output.
pub struct DiffFormatter {
    options: FormatOptions,
}

impl DiffFormatter {
    pub fn new(options: FormatOptions) -> Self {
        Self { options }
    }

    /// Write the formatted result to `w`.
    pub fn format(&self, w: &mut dyn Write, result: &DiffResult) -> Result<()> {
        match self.options.format {
            OutputFormat::Json => self.format_json(w, result),
            OutputFormat::Text => self.format_text(w, result),
        }
    }

    fn format_json(&self, w: &mut dyn Write, result: &DiffResult) -> Result<()> {
        let mut output = serde_json::json!({
            "newImage": result.new_image.reference,
            "baseImage": result.base_image.reference,
            "platform": result.new_image.platform,
            "newDigest": result.new_image.manifest_digest,
            "baseDigest": result.base_image.manifest_digest,
            "summary": {
                "totalLayers": result.layer_diffs.len(),
                "newLayers": result.new_layers().count(),
                "sharedLayers": result.shared_layers().count(),
                "sharedPrefixLength": result.shared_prefix_len,
                "newLayersSize": result.new_layers_size,
                "sharedLayersSize": result.shared_layers_size,
                "totalSize": result.total_new_image_size,
                "savingsSize": result.savings_size,
                "savingsPercentage": result.savings_percentage,
            },
        });

        if self.options.verbose {
            let layers: Vec<serde_json::Value> = result
                .layer_diffs
                .iter()
                .map(|layer| {
                    serde_json::json!({
                        "diffId": layer.diff_id,
                        "digest": layer.digest,
                        "size": layer.size,
                        "command": layer.command,
                        "status": status_str(layer.status),
                    })
                })
                .collect();
            output["layers"] = serde_json::Value::Array(layers);
        }

        serde_json::to_writer_pretty(&mut *w, &output)?;
        writeln!(w)?;
        Ok(())
    }

    fn format_text(&self, w: &mut dyn Write, result: &DiffResult) -> Result<()> {
        writeln!(w, "Image:    {}", result.new_image.reference)?;
        writeln!(w, "Base:     {}", result.base_image.reference)?;
        writeln!(w, "Platform: {}", result.new_image.platform)?;
        writeln!(w)?;

        if self.options.verbose {
            writeln!(w, "Layer details:")?;
            for layer in &result.layer_diffs {
                let status = match layer.status {
                    LayerStatus::New => "NEW   ",
                    LayerStatus::Shared => "SHARED",
                };
                writeln!(
                    w,
                    "  [{}] {} ({})  {}",
                    status,
                    truncate(&layer.diff_id, 19),
                    format_size(layer.size),
                    clean_command(&layer.command),
                )?;
            }
            writeln!(w)?;
        }

        writeln!(
            w,
            "Layers:   {} total, {} new, {} shared (shared prefix: {})",
            result.layer_diffs.len(),
            result.new_layers().count(),
            result.shared_layers().count(),
            result.shared_prefix_len,
        )?;
        writeln!(
            w,
            "Transfer: {} of {} ({:.1}% saved)",
            format_size(result.new_layers_size),
            format_size(result.total_new_image_size),
            result.savings_percentage,
        )?;

        Ok(())
    }
}

fn status_str(status: LayerStatus) -> &'static str {
    match status {
        LayerStatus::New => "NEW",
        LayerStatus::Shared => "SHARED",
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        format!("{}...", &s[..max])
    } else {
        s.to_string()
    }
}

/// Strip shell prefixes docker writes into history entries.
fn clean_command(command: &str) -> String {
    let cleaned = command
        .trim_start_matches("/bin/sh -c ")
        .trim_start_matches("RUN ");
    truncate(cleaned, 60)
}

fn format_size(bytes: i64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * KB;

    let bytes_f = bytes as f64;
    if bytes_f >= MB {
        format!("{:.1} MB", bytes_f / MB)
    } else if bytes_f >= KB {
        format!("{:.1} KB", bytes_f / KB)
    } else {
        format!("{} B", bytes)
    }
}
