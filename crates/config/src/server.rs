//! Listener configuration types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use validator::Validate;

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ListenerConfig {
    /// Unique listener identifier
    #[validate(length(min = 1, message = "Listener id must not be empty"))]
    pub id: String,

    /// Socket address to bind
    pub address: SocketAddr,

    /// Cluster that receives forwarded requests
    #[validate(length(min = 1, message = "Listener cluster must not be empty"))]
    pub cluster: String,

    /// Request header carrying the override destination
    #[serde(default = "default_proxy_header")]
    pub proxy_header: String,
}

impl ListenerConfig {
    pub fn new(id: impl Into<String>, address: SocketAddr, cluster: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address,
            cluster: cluster.into(),
            proxy_header: default_proxy_header(),
        }
    }
}

pub fn default_proxy_header() -> String {
    "connect-proxy".to_string()
}
