//! Per-site adapter lookup with timeouts applied to every call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::adapter::*;
use crate::error::{CloudError, CloudResult};

/// Await `fut`, failing with [`CloudError::Timeout`] after `timeout`.
pub async fn with_timeout<T>(
    timeout: Duration,
    op: &'static str,
    fut: impl Future<Output = CloudResult<T>>,
) -> CloudResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(CloudError::Timeout {
            op,
            after_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Adapters of one compute site. DNAT rules address private IPs, which are
/// only unique within a site, so every site has its own forwarder.
#[derive(Clone)]
struct SiteClients {
    compute: Arc<dyn ComputeSiteClient>,
    dnat: Arc<dyn DnatClient>,
}

/// The adapters the control plane talks to, keyed by compute site id.
#[derive(Clone)]
pub struct Clouds {
    sites: HashMap<String, SiteClients>,
    monitoring: Arc<dyn MonitoringClient>,
    timeout: Duration,
}

impl Clouds {
    pub fn new(monitoring: Arc<dyn MonitoringClient>, timeout: Duration) -> Self {
        Self {
            sites: HashMap::new(),
            monitoring,
            timeout,
        }
    }

    pub fn with_site(
        mut self,
        site_id: &str,
        compute: Arc<dyn ComputeSiteClient>,
        dnat: Arc<dyn DnatClient>,
    ) -> Self {
        self.add_site(site_id, compute, dnat);
        self
    }

    pub fn add_site(
        &mut self,
        site_id: &str,
        compute: Arc<dyn ComputeSiteClient>,
        dnat: Arc<dyn DnatClient>,
    ) {
        debug!(site = %site_id, "compute site adapters registered");
        self.sites
            .insert(site_id.to_string(), SiteClients { compute, dnat });
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clients(&self, site_id: &str) -> CloudResult<&SiteClients> {
        self.sites
            .get(site_id)
            .ok_or_else(|| CloudError::UnknownSite(site_id.to_string()))
    }

    fn site(&self, site_id: &str) -> CloudResult<&Arc<dyn ComputeSiteClient>> {
        Ok(&self.clients(site_id)?.compute)
    }

    fn dnat(&self, site_id: &str) -> CloudResult<&Arc<dyn DnatClient>> {
        Ok(&self.clients(site_id)?.dnat)
    }

    // ── Compute site ───────────────────────────────────────────────

    pub async fn list_servers(&self, site_id: &str) -> CloudResult<Vec<ServerInfo>> {
        let client = self.site(site_id)?;
        with_timeout(self.timeout, "list_servers", client.list_servers()).await
    }

    pub async fn create_server(&self, site_id: &str, spec: &ServerSpec) -> CloudResult<ServerInfo> {
        let client = self.site(site_id)?;
        with_timeout(self.timeout, "create_server", client.create_server(spec)).await
    }

    pub async fn destroy_server(&self, site_id: &str, id_at_site: &str) -> CloudResult<bool> {
        let client = self.site(site_id)?;
        with_timeout(self.timeout, "destroy_server", client.destroy_server(id_at_site)).await
    }

    pub async fn reboot_server(&self, site_id: &str, id_at_site: &str) -> CloudResult<()> {
        let client = self.site(site_id)?;
        with_timeout(self.timeout, "reboot_server", client.reboot_server(id_at_site)).await
    }

    pub async fn list_images(&self, site_id: &str) -> CloudResult<Vec<ImageInfo>> {
        let client = self.site(site_id)?;
        with_timeout(self.timeout, "list_images", client.list_images()).await
    }

    // ── Monitoring ─────────────────────────────────────────────────

    pub async fn register_host(&self, uuid: &str, ip: &str) -> CloudResult<u64> {
        with_timeout(self.timeout, "register_host", self.monitoring.register_host(uuid, ip)).await
    }

    pub async fn unregister_host(&self, host_id: u64) -> CloudResult<()> {
        with_timeout(
            self.timeout,
            "unregister_host",
            self.monitoring.unregister_host(host_id),
        )
        .await
    }

    pub async fn fetch_metrics(&self, host_id: u64) -> CloudResult<Vec<MetricSample>> {
        with_timeout(self.timeout, "fetch_metrics", self.monitoring.fetch_metrics(host_id)).await
    }

    // ── DNAT ───────────────────────────────────────────────────────

    pub async fn add_dnat_for_vm(
        &self,
        site_id: &str,
        vm_ip: &str,
        targets: &[DnatTarget],
    ) -> CloudResult<Vec<DnatRule>> {
        let dnat = self.dnat(site_id)?;
        with_timeout(self.timeout, "add_dnat", dnat.add_dnat_for_vm(vm_ip, targets)).await
    }

    pub async fn remove_dnat_for_vm(&self, site_id: &str, vm_ip: &str) -> CloudResult<bool> {
        let dnat = self.dnat(site_id)?;
        with_timeout(self.timeout, "remove_dnat", dnat.remove_dnat_for_vm(vm_ip)).await
    }

    pub async fn remove_port_mapping(
        &self,
        site_id: &str,
        public_ip: &str,
        source_port: u16,
    ) -> CloudResult<bool> {
        let dnat = self.dnat(site_id)?;
        with_timeout(
            self.timeout,
            "remove_port_mapping",
            dnat.remove_port_mapping(public_ip, source_port),
        )
        .await
    }
}
