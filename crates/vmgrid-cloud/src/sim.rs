//! In-memory simulated drivers.
//!
//! Used as test doubles and by `vmgridd standalone`. Each driver keeps
//! its state behind a `std::sync::Mutex` that is never held across an
//! await point, and exposes switches to inject provider failures.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::adapter::*;
use crate::error::{CloudError, CloudResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Compute site ───────────────────────────────────────────────────

#[derive(Default)]
struct SiteState {
    servers: BTreeMap<String, ServerInfo>,
    images: BTreeMap<String, ImageInfo>,
    next_server: u64,
    unavailable: bool,
    refuse_destroy: bool,
    delay: Option<Duration>,
    created: u64,
    destroyed: Vec<String>,
    rebooted: Vec<String>,
}

/// A compute site that boots servers instantly with a private IP.
#[derive(Default)]
pub struct SimComputeSite {
    state: Mutex<SiteState>,
}

impl SimComputeSite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`CloudError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// Make `destroy_server` report `false`.
    pub fn set_refuse_destroy(&self, refuse: bool) {
        lock(&self.state).refuse_destroy = refuse;
    }

    /// Delay every call by `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = Some(delay);
    }

    pub fn add_image(&self, id_at_site: &str, name: &str, status: &str) {
        lock(&self.state).images.insert(
            id_at_site.to_string(),
            ImageInfo {
                id_at_site: id_at_site.to_string(),
                name: name.to_string(),
                status: status.to_string(),
            },
        );
    }

    pub fn remove_image(&self, id_at_site: &str) {
        lock(&self.state).images.remove(id_at_site);
    }

    /// Put a server the platform did not create.
    pub fn add_server(&self, server: ServerInfo) {
        lock(&self.state)
            .servers
            .insert(server.id_at_site.clone(), server);
    }

    /// Drop a server without going through `destroy_server`.
    pub fn vanish_server(&self, id_at_site: &str) {
        lock(&self.state).servers.remove(id_at_site);
    }

    pub fn set_server_ip(&self, id_at_site: &str, ip: Option<&str>) {
        if let Some(server) = lock(&self.state).servers.get_mut(id_at_site) {
            server.ip = ip.map(str::to_string);
        }
    }

    pub fn set_server_status(&self, id_at_site: &str, status: &str) {
        if let Some(server) = lock(&self.state).servers.get_mut(id_at_site) {
            server.status = status.to_string();
        }
    }

    pub fn servers(&self) -> Vec<ServerInfo> {
        lock(&self.state).servers.values().cloned().collect()
    }

    /// Number of successful `create_server` calls.
    pub fn created_count(&self) -> u64 {
        lock(&self.state).created
    }

    pub fn destroyed(&self) -> Vec<String> {
        lock(&self.state).destroyed.clone()
    }

    pub fn rebooted(&self) -> Vec<String> {
        lock(&self.state).rebooted.clone()
    }

    async fn pause(&self) {
        let delay = lock(&self.state).delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SiteState) -> CloudResult<T>) -> CloudResult<T> {
        let mut state = lock(&self.state);
        if state.unavailable {
            return Err(CloudError::Unavailable("simulated outage".to_string()));
        }
        f(&mut state)
    }
}

impl ComputeSiteClient for SimComputeSite {
    fn list_servers(&self) -> CloudFuture<'_, Vec<ServerInfo>> {
        Box::pin(async move {
            self.pause().await;
            self.with_state(|s| Ok(s.servers.values().cloned().collect()))
        })
    }

    fn create_server<'a>(&'a self, spec: &'a ServerSpec) -> CloudFuture<'a, ServerInfo> {
        Box::pin(async move {
            self.pause().await;
            self.with_state(|s| {
                s.next_server += 1;
                let n = s.next_server;
                let server = ServerInfo {
                    id_at_site: format!("srv-{n}"),
                    name: spec.name.clone(),
                    status: "ACTIVE".to_string(),
                    ip: Some(format!("10.0.{}.{}", n / 256, n % 256)),
                    flavor_id_at_site: Some(spec.flavor_id_at_site.clone()),
                    image_id_at_site: Some(spec.image_id_at_site.clone()),
                };
                s.servers.insert(server.id_at_site.clone(), server.clone());
                s.created += 1;
                debug!(server = %server.id_at_site, "simulated server created");
                Ok(server)
            })
        })
    }

    fn destroy_server<'a>(&'a self, id_at_site: &'a str) -> CloudFuture<'a, bool> {
        Box::pin(async move {
            self.pause().await;
            self.with_state(|s| {
                if s.refuse_destroy {
                    return Ok(false);
                }
                s.servers.remove(id_at_site);
                s.destroyed.push(id_at_site.to_string());
                Ok(true)
            })
        })
    }

    fn reboot_server<'a>(&'a self, id_at_site: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            self.pause().await;
            self.with_state(|s| {
                let server = s
                    .servers
                    .get_mut(id_at_site)
                    .ok_or_else(|| CloudError::NotFound(id_at_site.to_string()))?;
                server.status = "REBOOT".to_string();
                s.rebooted.push(id_at_site.to_string());
                Ok(())
            })
        })
    }

    fn list_images(&self) -> CloudFuture<'_, Vec<ImageInfo>> {
        Box::pin(async move {
            self.pause().await;
            self.with_state(|s| Ok(s.images.values().cloned().collect()))
        })
    }
}

// ── Monitoring ─────────────────────────────────────────────────────

#[derive(Default)]
struct MonitoringState {
    hosts: BTreeMap<u64, (String, String)>,
    next_host: u64,
    unavailable: bool,
}

/// Host registry that reports a constant load per host.
#[derive(Default)]
pub struct SimMonitoring {
    state: Mutex<MonitoringState>,
}

impl SimMonitoring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// Registered hosts as `(host id, uuid, ip)`.
    pub fn hosts(&self) -> Vec<(u64, String, String)> {
        lock(&self.state)
            .hosts
            .iter()
            .map(|(id, (uuid, ip))| (*id, uuid.clone(), ip.clone()))
            .collect()
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MonitoringState) -> CloudResult<T>,
    ) -> CloudResult<T> {
        let mut state = lock(&self.state);
        if state.unavailable {
            return Err(CloudError::Unavailable("monitoring offline".to_string()));
        }
        f(&mut state)
    }
}

impl MonitoringClient for SimMonitoring {
    fn register_host<'a>(&'a self, uuid: &'a str, ip: &'a str) -> CloudFuture<'a, u64> {
        Box::pin(async move {
            self.with_state(|s| {
                s.next_host += 1;
                s.hosts
                    .insert(s.next_host, (uuid.to_string(), ip.to_string()));
                Ok(s.next_host)
            })
        })
    }

    fn unregister_host(&self, host_id: u64) -> CloudFuture<'_, ()> {
        Box::pin(async move {
            self.with_state(|s| {
                s.hosts.remove(&host_id);
                Ok(())
            })
        })
    }

    fn fetch_metrics(&self, host_id: u64) -> CloudFuture<'_, Vec<MetricSample>> {
        Box::pin(async move {
            self.with_state(|s| {
                if !s.hosts.contains_key(&host_id) {
                    return Err(CloudError::NotFound(format!("host {host_id}")));
                }
                Ok(vec![MetricSample {
                    name: "cpu_load".to_string(),
                    value: 0.25,
                    timestamp: vmgrid_core::epoch_secs(),
                }])
            })
        })
    }
}

// ── DNAT ───────────────────────────────────────────────────────────

struct DnatState {
    rules: Vec<(String, DnatRule)>,
    next_port: u16,
    unavailable: bool,
}

/// Port forwarder with a single public address.
pub struct SimDnat {
    public_ip: String,
    state: Mutex<DnatState>,
}

impl SimDnat {
    pub fn new(public_ip: &str) -> Self {
        Self {
            public_ip: public_ip.to_string(),
            state: Mutex::new(DnatState {
                rules: Vec::new(),
                next_port: 10000,
                unavailable: false,
            }),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    pub fn rules_for(&self, vm_ip: &str) -> Vec<DnatRule> {
        lock(&self.state)
            .rules
            .iter()
            .filter(|(ip, _)| ip == vm_ip)
            .map(|(_, rule)| rule.clone())
            .collect()
    }

    pub fn rule_count(&self) -> usize {
        lock(&self.state).rules.len()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DnatState) -> CloudResult<T>) -> CloudResult<T> {
        let mut state = lock(&self.state);
        if state.unavailable {
            return Err(CloudError::Unavailable("dnat service offline".to_string()));
        }
        f(&mut state)
    }
}

impl DnatClient for SimDnat {
    fn add_dnat_for_vm<'a>(
        &'a self,
        vm_ip: &'a str,
        targets: &'a [DnatTarget],
    ) -> CloudFuture<'a, Vec<DnatRule>> {
        Box::pin(async move {
            self.with_state(|s| {
                let mut added = Vec::with_capacity(targets.len());
                for target in targets {
                    let rule = DnatRule {
                        template_id: target.template_id,
                        public_ip: self.public_ip.clone(),
                        source_port: s.next_port,
                    };
                    s.next_port = s.next_port.wrapping_add(1).max(10000);
                    s.rules.push((vm_ip.to_string(), rule.clone()));
                    added.push(rule);
                }
                Ok(added)
            })
        })
    }

    fn remove_dnat_for_vm<'a>(&'a self, vm_ip: &'a str) -> CloudFuture<'a, bool> {
        Box::pin(async move {
            self.with_state(|s| {
                s.rules.retain(|(ip, _)| ip != vm_ip);
                Ok(true)
            })
        })
    }

    fn remove_port_mapping<'a>(
        &'a self,
        public_ip: &'a str,
        source_port: u16,
    ) -> CloudFuture<'a, bool> {
        Box::pin(async move {
            self.with_state(|s| {
                let before = s.rules.len();
                s.rules
                    .retain(|(_, r)| !(r.public_ip == public_ip && r.source_port == source_port));
                Ok(s.rules.len() < before)
            })
        })
    }
}
