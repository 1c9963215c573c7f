//! Output formatting for CLI commands.
//!
//! Provides abstraction layer for outputting results in text or JSON format.

use anyhow::Result;
use hoard_core::{Digest, FsckReport};
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    /// Create a new OutputWriter.
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write output using the configured format.
    ///
    /// The `text_fn` closure is called only in text mode to generate the
    /// human-readable output.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error message to stderr.
    ///
    /// In JSON mode, writes a JSON error object with success=false.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

/// Error output structure.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `init` command.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
    pub algorithm: String,
    pub split_at: usize,
}

/// Output for `fsck` command.
#[derive(Debug, Serialize)]
pub struct FsckOutput {
    pub success: bool,
    pub result_code: u8,
    pub blobs: usize,
    pub nodes: usize,
    pub corrupt_blobs: Vec<Digest>,
    pub dangling_nodes: Vec<String>,
    pub stale_staged: usize,
    pub errors: Vec<String>,
}

impl From<&FsckReport> for FsckOutput {
    fn from(report: &FsckReport) -> Self {
        Self {
            success: report.is_ok(),
            result_code: if report.is_ok() { 0 } else { 1 },
            blobs: report.blobs,
            nodes: report.nodes,
            corrupt_blobs: report.corrupt_blobs.clone(),
            dangling_nodes: report.dangling_nodes.clone(),
            stale_staged: report.stale_staged,
            errors: report.errors.clone(),
        }
    }
}

/// Output for `gc` command.
#[derive(Debug, Serialize)]
pub struct GcOutput {
    pub success: bool,
    pub result_code: u8,
    pub dry_run: bool,
    pub blobs_scanned: usize,
    pub nodes_scanned: usize,
    pub orphans: usize,
    pub bytes_freed: u64,
    pub dangling: usize,
}

/// Node record information for `nodes`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub item: String,
    pub entry: Digest,
    pub comment: String,
}

/// Output for `nodes` command.
#[derive(Debug, Serialize)]
pub struct NodesOutput {
    pub success: bool,
    pub result_code: u8,
    pub nodes: Vec<NodeInfo>,
}

/// Output for `rm-node` command.
#[derive(Debug, Serialize)]
pub struct RemoveNodeOutput {
    pub success: bool,
    pub result_code: u8,
    pub item: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fsck_output_reflects_errors() {
        let mut report = FsckReport {
            blobs: 3,
            nodes: 2,
            ..FsckReport::default()
        };
        let ok = FsckOutput::from(&report);
        assert!(ok.success);
        assert_eq!(ok.result_code, 0);

        report.errors.push("failed reading cas/abc".to_string());
        let failed = FsckOutput::from(&report);
        assert!(!failed.success);
        assert_eq!(failed.result_code, 1);
    }

    #[test]
    fn test_digest_serializes_as_hex() {
        let info = NodeInfo {
            item: "tags/home".to_string(),
            entry: Digest::of_bytes(b"root"),
            comment: String::new(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["entry"], Digest::of_bytes(b"root").to_hex());
    }
}
