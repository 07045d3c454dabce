//! Domain types for the VMGrid state store.
//!
//! These types represent the persisted state of compute sites, appliances,
//! virtual machines, the deployments joining them, funds, and network
//! mappings. All types are serializable to/from JSON for storage in redb
//! tables. Lifecycle states are closed enums with explicit transition
//! functions.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub use vmgrid_core::{Amount, SiteType, Technology};

pub type SiteId = u64;
pub type ApplianceTypeId = u64;
pub type ConfigInstanceId = u64;
pub type ApplianceSetId = u64;
pub type ApplianceId = u64;
pub type VmId = u64;
pub type DeploymentId = u64;
pub type FundId = u64;
pub type FlavorId = u64;
pub type TemplateId = u64;
pub type DevModePropertySetId = u64;
pub type PortMappingTemplateId = u64;
pub type PortMappingId = u64;
pub type UserId = u64;

// ── Compute site ───────────────────────────────────────────────────

/// A cloud tenant the platform can start VMs on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputeSite {
    pub id: SiteId,
    /// External identifier, also the prefix of VM uuids.
    pub site_id: String,
    pub name: String,
    pub site_type: SiteType,
    pub technology: Technology,
}

// ── Appliance type ─────────────────────────────────────────────────

/// Template describing software to deploy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplianceType {
    pub id: ApplianceTypeId,
    pub name: String,
    pub shared: bool,
    pub scalable: bool,
    pub preferences: ResourcePreferences,
    /// OS family name used to look up flavor prices ("Linux", "Windows").
    pub os_family: String,
}

impl ApplianceType {
    /// Instances may co-reside on one VM only when both flags are set.
    pub fn is_shareable(&self) -> bool {
        self.shared && self.scalable
    }
}

/// Compute hints used when picking a flavor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourcePreferences {
    pub cpu: Option<u32>,
    pub memory_mb: Option<u64>,
    pub disk_gb: Option<u64>,
}

// ── Configuration instance ─────────────────────────────────────────

/// Concrete configuration payload bound to a configuration template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplianceConfigurationInstance {
    pub id: ConfigInstanceId,
    pub config_template_id: u64,
    pub payload: String,
}

impl ApplianceConfigurationInstance {
    /// Reuse identity: same template and same payload content.
    pub fn same_identity(&self, other: &ApplianceConfigurationInstance) -> bool {
        self.config_template_id == other.config_template_id && self.payload == other.payload
    }
}

// ── Appliance set ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplianceSetKind {
    Portal,
    Workflow,
    Development,
}

/// User-owned grouping of appliances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplianceSet {
    pub id: ApplianceSetId,
    pub user_id: UserId,
    pub name: String,
    pub kind: ApplianceSetKind,
}

impl ApplianceSet {
    /// Portal sets are production sets.
    pub fn is_production(&self) -> bool {
        self.kind == ApplianceSetKind::Portal
    }

    pub fn is_development(&self) -> bool {
        self.kind == ApplianceSetKind::Development
    }
}

// ── Appliance ──────────────────────────────────────────────────────

/// One logical running instance of an appliance type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appliance {
    pub id: ApplianceId,
    pub appliance_set_id: ApplianceSetId,
    pub appliance_type_id: ApplianceTypeId,
    pub config_instance_id: ConfigInstanceId,
    pub fund_id: FundId,
    pub name: Option<String>,
    pub state: ApplianceState,
    /// Present only for appliances in a development set.
    pub dev_mode_property_set_id: Option<DevModePropertySetId>,
    /// Everything ever charged for this appliance.
    pub amount_billed: Amount,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplianceState {
    New,
    Satisfied,
    Unsatisfied,
}

/// Events that move an appliance between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplianceEvent {
    /// A prepaid deployment now exists for the appliance.
    Placed,
    /// No template/flavor could host the appliance.
    PlacementFailed,
    /// The last prepaid deployment went away (expired or VM vanished).
    DeploymentsLost,
}

impl ApplianceState {
    pub fn on(self, event: ApplianceEvent) -> ApplianceState {
        match (self, event) {
            (_, ApplianceEvent::Placed) => ApplianceState::Satisfied,
            (_, ApplianceEvent::PlacementFailed) => ApplianceState::Unsatisfied,
            (ApplianceState::New, ApplianceEvent::DeploymentsLost) => ApplianceState::New,
            (ApplianceState::Satisfied | ApplianceState::Unsatisfied, ApplianceEvent::DeploymentsLost) => {
                ApplianceState::Unsatisfied
            }
        }
    }
}

// ── Dev mode ───────────────────────────────────────────────────────

/// Per-appliance overrides for development-mode appliances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DevModePropertySet {
    pub id: DevModePropertySetId,
    pub appliance_id: ApplianceId,
    pub name: String,
    pub preferences: ResourcePreferences,
}

// ── Virtual machine ────────────────────────────────────────────────

/// Provider-reported lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Active,
    Build,
    Deleted,
    Error,
    HardReboot,
    Password,
    Reboot,
    Rebuild,
    Rescue,
    Resize,
    RevertResize,
    Shutoff,
    Suspended,
    Unknown,
    VerifyResize,
    Saving,
}

impl VmState {
    /// Map a provider status string ("ACTIVE", "hard_reboot", ...) onto a state.
    pub fn from_provider(status: &str) -> VmState {
        match status.trim().to_ascii_lowercase().as_str() {
            "active" => VmState::Active,
            "build" => VmState::Build,
            "deleted" => VmState::Deleted,
            "error" => VmState::Error,
            "hard_reboot" => VmState::HardReboot,
            "password" => VmState::Password,
            "reboot" => VmState::Reboot,
            "rebuild" => VmState::Rebuild,
            "rescue" => VmState::Rescue,
            "resize" => VmState::Resize,
            "revert_resize" => VmState::RevertResize,
            "shutoff" => VmState::Shutoff,
            "suspended" => VmState::Suspended,
            "verify_resize" => VmState::VerifyResize,
            "saving" => VmState::Saving,
            _ => VmState::Unknown,
        }
    }

    /// Whether a VM in this state may receive new appliances.
    pub fn accepts_appliances(self) -> bool {
        !matches!(self, VmState::Deleted | VmState::Error)
    }
}

/// A provisioned compute resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualMachine {
    pub id: VmId,
    pub site_id: SiteId,
    /// Provider-native id. `None` while the create call is in flight.
    pub id_at_site: Option<String>,
    pub name: String,
    pub state: VmState,
    pub ip: Option<String>,
    pub flavor_id: Option<FlavorId>,
    pub template_id: Option<TemplateId>,
    pub managed: bool,
    pub monitoring_id: Option<u64>,
    /// Set while a provider destroy is in flight.
    pub release_pending: bool,
    pub created_at: u64,
}

impl VirtualMachine {
    pub fn is_pending(&self) -> bool {
        self.id_at_site.is_none()
    }

    /// Host name used for monitoring registration.
    pub fn uuid(&self, site: &ComputeSite) -> String {
        format!(
            "{}-vm-{}",
            site.site_id,
            self.id_at_site.as_deref().unwrap_or("pending")
        )
    }
}

// ── Deployment ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingState {
    Prepaid,
    Expired,
}

impl BillingState {
    /// Outcome of a charge attempt. Expired is terminal.
    pub fn after_charge(self, covered: bool) -> BillingState {
        match self {
            BillingState::Prepaid if covered => BillingState::Prepaid,
            BillingState::Prepaid => BillingState::Expired,
            BillingState::Expired => BillingState::Expired,
        }
    }
}

/// Join of one appliance and one VM; the unit of billing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub appliance_id: ApplianceId,
    pub vm_id: VmId,
    pub billing_state: BillingState,
    /// Unix timestamp up to which usage has been paid.
    pub prepaid_until: u64,
}

// ── Fund ───────────────────────────────────────────────────────────

/// Prepaid balance with an overdraft floor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fund {
    pub id: FundId,
    pub name: String,
    pub balance: Amount,
    /// Balance may drop to `-overdraft_limit` and no further.
    pub overdraft_limit: Amount,
    /// Compute sites this fund pays for.
    pub site_ids: BTreeSet<SiteId>,
}

impl Fund {
    pub fn is_bound_to(&self, site_id: SiteId) -> bool {
        self.site_ids.contains(&site_id)
    }

    /// Balance including the overdraft allowance.
    pub fn available(&self) -> Amount {
        self.balance.saturating_add(self.overdraft_limit)
    }

    /// Whether debiting `amount` keeps the balance at or above the floor.
    pub fn can_cover(&self, amount: Amount) -> bool {
        amount <= self.available()
    }
}

// ── Flavor ─────────────────────────────────────────────────────────

/// Compute shape with a per-OS-family hourly price.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmFlavor {
    pub id: FlavorId,
    pub site_id: SiteId,
    pub id_at_site: String,
    pub name: String,
    pub cpu: u32,
    pub memory_mb: u64,
    pub hdd_gb: u64,
    pub hourly_costs: BTreeMap<String, Amount>,
}

impl VmFlavor {
    pub fn hourly_cost(&self, os_family: &str) -> Option<Amount> {
        self.hourly_costs.get(os_family).copied()
    }

    pub fn satisfies(&self, prefs: &ResourcePreferences) -> bool {
        prefs.cpu.is_none_or(|cpu| self.cpu >= cpu)
            && prefs.memory_mb.is_none_or(|mem| self.memory_mb >= mem)
            && prefs.disk_gb.is_none_or(|disk| self.hdd_gb >= disk)
    }
}

// ── VM template ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateState {
    Active,
    Saving,
    Error,
    Deleted,
}

impl TemplateState {
    pub fn from_provider(status: &str) -> TemplateState {
        match status.trim().to_ascii_lowercase().as_str() {
            "active" => TemplateState::Active,
            "saving" | "queued" => TemplateState::Saving,
            "deleted" => TemplateState::Deleted,
            _ => TemplateState::Error,
        }
    }
}

/// Provider image that VMs of an appliance type are started from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmTemplate {
    pub id: TemplateId,
    pub site_id: SiteId,
    pub id_at_site: String,
    pub name: String,
    pub state: TemplateState,
    pub appliance_type_id: Option<ApplianceTypeId>,
    /// VM this template is being captured from.
    pub source_vm_id: Option<VmId>,
    pub created_at: u64,
}

// ── Port mapping template ──────────────────────────────────────────

/// Exactly one owner per template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum PmtOwner {
    ApplianceType(ApplianceTypeId),
    DevModePropertySet(DevModePropertySetId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationProtocol {
    Http,
    Https,
    HttpHttps,
    None,
}

/// Named service port to expose for an appliance type or dev-mode set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortMappingTemplate {
    pub id: PortMappingTemplateId,
    pub owner: PmtOwner,
    pub service_name: String,
    pub transport_protocol: TransportProtocol,
    pub application_protocol: ApplicationProtocol,
    pub target_port: u16,
}

impl PortMappingTemplate {
    /// Transport-level mapping, as opposed to a proxy-routed HTTP one.
    pub fn is_dnat(&self) -> bool {
        self.application_protocol == ApplicationProtocol::None
    }

    /// Check the template against its siblings (same owner).
    pub fn validate(&self, siblings: &[PortMappingTemplate]) -> Result<(), String> {
        if self.service_name.trim().is_empty() {
            return Err("service name must not be empty".to_string());
        }
        if self.transport_protocol == TransportProtocol::Udp && !self.is_dnat() {
            return Err("udp mappings must use application protocol none".to_string());
        }
        for other in siblings.iter().filter(|o| o.id != self.id && o.owner == self.owner) {
            if other.service_name == self.service_name {
                return Err(format!("service name {} already taken", self.service_name));
            }
            if other.target_port == self.target_port {
                return Err(format!("target port {} already taken", self.target_port));
            }
        }
        Ok(())
    }
}

// ── Port mapping ───────────────────────────────────────────────────

/// Concrete DNAT binding of a template on a VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortMapping {
    pub id: PortMappingId,
    pub template_id: PortMappingTemplateId,
    pub vm_id: VmId,
    pub public_ip: String,
    pub source_port: u16,
}

// ── Billing log ────────────────────────────────────────────────────

/// One debit of a fund.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BillingLog {
    pub id: u64,
    pub fund_id: FundId,
    pub appliance_id: ApplianceId,
    pub deployment_id: DeploymentId,
    pub amount: Amount,
    pub timestamp: u64,
    pub reason: String,
}
