//! KDL configuration parsing.
//!
//! - `helpers`: Common parsing utility functions
//! - `server`: Listener parsing
//! - `clusters`: Cluster and transport socket parsing

mod clusters;
mod helpers;
mod server;

pub use helpers::{
    find_child, get_bool_entry, get_first_arg_string, get_int_entry, get_string_entry,
    offset_to_line_col,
};

pub use clusters::parse_clusters;
pub use server::parse_listeners;

use anyhow::Result;
use std::collections::HashMap;

use crate::Config;

/// Convert a parsed KDL document to Config
pub fn parse_kdl_document(doc: kdl::KdlDocument) -> Result<Config> {
    let mut listeners = Vec::new();
    let mut clusters = HashMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "listeners" => {
                listeners = parse_listeners(node)?;
            }
            "clusters" => {
                clusters = parse_clusters(node)?;
            }
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown top-level configuration block: '{}'\n\
                     Valid blocks are: listeners, clusters",
                    other
                ));
            }
        }
    }

    if listeners.is_empty() {
        return Err(anyhow::anyhow!(
            "Missing required 'listeners' configuration block\n\
             Example:\n\
             listeners {{\n\
                 listener \"http\" {{\n\
                     address \"127.0.0.1:8080\"\n\
                     cluster \"egress\"\n\
                 }}\n\
             }}"
        ));
    }

    Ok(Config {
        listeners,
        clusters,
    })
}
