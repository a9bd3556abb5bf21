//! Endpoint payload stored under registered paths

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Describes one discoverable endpoint.
///
/// Field names on the wire are kept compatible with existing registrants, so an
/// endpoint written by another client deserializes here unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    /// Unique identity of the instance
    #[serde(rename = "ID")]
    pub id: i64,
    /// Host name
    #[serde(rename = "HostName")]
    pub host_name: String,
    /// gRPC port
    #[serde(rename = "GRPCPort")]
    pub grpc_port: u16,
    /// Domain the host lives in (may be empty)
    #[serde(rename = "Domain")]
    pub domain: String,
    /// Service identifier
    #[serde(rename = "ServiceId")]
    pub service_id: i64,
    /// HTTP port
    #[serde(rename = "HttpPort")]
    pub http_port: u16,
    /// Free-form extension data
    #[serde(rename = "MetaData", deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
}

/// Registrants that never set metadata publish `null` for the map.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Endpoint {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            ..Default::default()
        }
    }

    /// Host address, qualified by the domain when one is set.
    pub fn addr(&self) -> String {
        if self.domain.is_empty() {
            self.host_name.clone()
        } else {
            format!("{}.{}", self.host_name, self.domain)
        }
    }

    /// `host:port` target for gRPC clients
    pub fn grpc_addr(&self) -> String {
        format!("{}:{}", self.addr(), self.grpc_port)
    }

    /// Base URL for HTTP clients
    pub fn http_base_url(&self) -> String {
        format!("http://{}:{}", self.addr(), self.http_port)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
