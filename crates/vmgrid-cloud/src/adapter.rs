//! Adapter contracts for external collaborators.
//!
//! Each trait returns boxed `Send` futures so implementations can be held
//! as `Arc<dyn Trait>` and swapped for test doubles. Implementations
//! perform their own retries, if any; the control plane applies a timeout
//! around every call and never retries.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use vmgrid_state::TransportProtocol;

use crate::error::CloudResult;

/// Boxed future alias for adapter results.
pub type CloudFuture<'a, T> = Pin<Box<dyn Future<Output = CloudResult<T>> + Send + 'a>>;

/// A server as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id_at_site: String,
    pub name: String,
    /// Raw provider status, e.g. `ACTIVE` or `BUILD`.
    pub status: String,
    pub ip: Option<String>,
    pub flavor_id_at_site: Option<String>,
    pub image_id_at_site: Option<String>,
}

/// What to boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub image_id_at_site: String,
    pub flavor_id_at_site: String,
}

/// An image as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id_at_site: String,
    pub name: String,
    /// Raw provider status, e.g. `active` or `saving`.
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub timestamp: u64,
}

/// One port to expose on a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnatTarget {
    pub template_id: u64,
    pub target_port: u16,
    pub transport: TransportProtocol,
}

/// A DNAT rule the provider installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnatRule {
    pub template_id: u64,
    pub public_ip: String,
    pub source_port: u16,
}

/// List, create, destroy and reboot servers and list images on one site.
pub trait ComputeSiteClient: Send + Sync {
    fn list_servers(&self) -> CloudFuture<'_, Vec<ServerInfo>>;

    fn create_server<'a>(&'a self, spec: &'a ServerSpec) -> CloudFuture<'a, ServerInfo>;

    /// Returns `false` when the provider refused to destroy the server.
    fn destroy_server<'a>(&'a self, id_at_site: &'a str) -> CloudFuture<'a, bool>;

    fn reboot_server<'a>(&'a self, id_at_site: &'a str) -> CloudFuture<'a, ()>;

    fn list_images(&self) -> CloudFuture<'_, Vec<ImageInfo>>;
}

/// Host registration and load metrics.
pub trait MonitoringClient: Send + Sync {
    /// Register a host, returning the monitoring system's host id.
    fn register_host<'a>(&'a self, uuid: &'a str, ip: &'a str) -> CloudFuture<'a, u64>;

    fn unregister_host(&self, host_id: u64) -> CloudFuture<'_, ()>;

    fn fetch_metrics(&self, host_id: u64) -> CloudFuture<'_, Vec<MetricSample>>;
}

/// Transport-level port forwarding in front of VM private addresses.
pub trait DnatClient: Send + Sync {
    fn add_dnat_for_vm<'a>(
        &'a self,
        vm_ip: &'a str,
        targets: &'a [DnatTarget],
    ) -> CloudFuture<'a, Vec<DnatRule>>;

    /// Drop every rule pointing at `vm_ip`.
    fn remove_dnat_for_vm<'a>(&'a self, vm_ip: &'a str) -> CloudFuture<'a, bool>;

    fn remove_port_mapping<'a>(
        &'a self,
        public_ip: &'a str,
        source_port: u16,
    ) -> CloudFuture<'a, bool>;
}
