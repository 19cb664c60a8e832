//! Configuration for the Burrow forwarding proxy
//!
//! This crate parses and validates the listener and cluster configuration.
//! KDL is the primary format; JSON is accepted for generated configs.
//!
//! # Module Organization
//!
//! - [`server`]: Listener configuration
//! - [`clusters`]: Cluster and transport socket configuration
//! - [`validation`]: Semantic validation
//! - `kdl`: KDL format parsing

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use validator::Validate;

use burrow_common::errors::{BurrowError, BurrowResult};

// ============================================================================
// Module Declarations
// ============================================================================

pub mod clusters;
mod kdl;
pub mod server;
pub mod validation;

// ============================================================================
// Re-exports
// ============================================================================

pub use clusters::{
    ClusterConfig, ConnectAuthority, ConnectHeader, ConnectionPoolConfig, Http11ConnectConfig,
    HttpProtocol, TransportSocketConfig, UpstreamTimeouts, UpstreamTlsConfig,
};
pub use server::ListenerConfig;

// ============================================================================
// Main Configuration Structure
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validation::validate_config_semantics"))]
pub struct Config {
    /// Listener configurations
    #[validate(length(min = 1, message = "At least one listener is required"))]
    pub listeners: Vec<ListenerConfig>,

    /// Cluster configurations keyed by id
    #[serde(default)]
    pub clusters: HashMap<String, ClusterConfig>,
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("kdl");

        match extension {
            "kdl" => Self::from_kdl(&content),
            "json" => Self::from_json(&content),
            _ => Err(anyhow::anyhow!("Unsupported config format: {}", extension)),
        }
    }

    /// Parse configuration from KDL format
    pub fn from_kdl(content: &str) -> Result<Self> {
        let doc: ::kdl::KdlDocument = content
            .parse()
            .map_err(|e: ::kdl::KdlError| anyhow::anyhow!("{}", render_kdl_error(content, &e)))?;

        kdl::parse_kdl_document(doc)
    }

    /// Parse configuration from JSON format
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse JSON configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> BurrowResult<()> {
        Validate::validate(self).map_err(|e| {
            BurrowError::config(format!("Configuration validation failed: {}", e))
        })?;

        for listener in &self.listeners {
            listener.validate().map_err(|e| {
                BurrowError::config(format!("Listener '{}' is invalid: {}", listener.id, e))
            })?;
        }
        for cluster in self.clusters.values() {
            cluster.validate().map_err(|e| {
                BurrowError::config(format!("Cluster '{}' is invalid: {}", cluster.id, e))
            })?;
        }

        Ok(())
    }

    /// Get a cluster by ID
    pub fn get_cluster(&self, id: &str) -> Option<&ClusterConfig> {
        self.clusters.get(id)
    }
}

/// Render a KDL parse failure with line/column context for each label
fn render_kdl_error(content: &str, e: &::kdl::KdlError) -> String {
    use miette::Diagnostic;

    let mut error_msg = String::from("KDL configuration parse error:\n\n");
    let lines: Vec<&str> = content.lines().collect();

    let mut found_details = false;
    if let Some(related) = e.related() {
        for diagnostic in related {
            error_msg.push_str(&format!("  {}\n", diagnostic));
            found_details = true;

            if let Some(labels) = diagnostic.labels() {
                for label in labels {
                    let (line, col) = kdl::offset_to_line_col(content, label.offset());
                    error_msg.push_str(&format!("\n  --> at line {}, column {}\n", line, col));

                    if let Some(line_content) = lines.get(line.saturating_sub(1)) {
                        error_msg.push_str(&format!("{:>4} | {}\n", line, line_content));
                        error_msg.push_str(&format!(
                            "     | {}^",
                            " ".repeat(col.saturating_sub(1))
                        ));
                        if let Some(label_msg) = label.label() {
                            error_msg.push_str(&format!(" {}", label_msg));
                        }
                        error_msg.push('\n');
                    }
                }
            }

            if let Some(help) = diagnostic.help() {
                error_msg.push_str(&format!("\n  Help: {}\n", help));
            }
        }
    }

    if !found_details {
        error_msg.push_str(&format!("  {}\n", e));
    }

    error_msg
}
