//! Listener KDL parsing.

use anyhow::Result;
use std::net::SocketAddr;

use crate::server::*;

use super::helpers::{get_first_arg_string, get_string_entry};

/// Parse listeners configuration block
pub fn parse_listeners(node: &kdl::KdlNode) -> Result<Vec<ListenerConfig>> {
    let mut listeners = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "listener" {
                return Err(anyhow::anyhow!(
                    "Unknown node '{}' in listeners block, expected 'listener'",
                    child.name().value()
                ));
            }

            let id = get_first_arg_string(child).ok_or_else(|| {
                anyhow::anyhow!(
                    "Listener requires an ID argument, e.g., listener \"http\" {{ ... }}"
                )
            })?;

            let address = get_string_entry(child, "address").ok_or_else(|| {
                anyhow::anyhow!(
                    "Listener '{}' requires an 'address' field, e.g., address \"127.0.0.1:8080\"",
                    id
                )
            })?;
            let address: SocketAddr = address.parse().map_err(|_| {
                anyhow::anyhow!(
                    "Listener '{}' has invalid address '{}', expected ip:port",
                    id,
                    address
                )
            })?;

            let cluster = get_string_entry(child, "cluster").ok_or_else(|| {
                anyhow::anyhow!(
                    "Listener '{}' requires a 'cluster' field, e.g., cluster \"egress\"",
                    id
                )
            })?;

            listeners.push(ListenerConfig {
                id,
                address,
                cluster,
                proxy_header: get_string_entry(child, "proxy-header")
                    .map(|h| h.to_ascii_lowercase())
                    .unwrap_or_else(default_proxy_header),
            });
        }
    }

    Ok(listeners)
}
