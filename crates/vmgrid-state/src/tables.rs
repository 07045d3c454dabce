//! redb table definitions for the VMGrid state store.
//!
//! Each entity table uses `u64` keys (the record id) and `&[u8]` values
//! (JSON-serialized domain types). The `meta` table holds the id sequence.

use redb::TableDefinition;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::types::*;

pub const SITES: TableDefinition<u64, &[u8]> = TableDefinition::new("compute_sites");
pub const APPLIANCE_TYPES: TableDefinition<u64, &[u8]> = TableDefinition::new("appliance_types");
pub const CONFIG_INSTANCES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("appliance_configuration_instances");
pub const APPLIANCE_SETS: TableDefinition<u64, &[u8]> = TableDefinition::new("appliance_sets");
pub const APPLIANCES: TableDefinition<u64, &[u8]> = TableDefinition::new("appliances");
pub const DEV_MODE_PROPERTY_SETS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("dev_mode_property_sets");
pub const VMS: TableDefinition<u64, &[u8]> = TableDefinition::new("virtual_machines");
pub const DEPLOYMENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("deployments");
pub const FUNDS: TableDefinition<u64, &[u8]> = TableDefinition::new("funds");
pub const FLAVORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vm_flavors");
pub const TEMPLATES: TableDefinition<u64, &[u8]> = TableDefinition::new("vm_templates");
pub const PORT_MAPPING_TEMPLATES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("port_mapping_templates");
pub const PORT_MAPPINGS: TableDefinition<u64, &[u8]> = TableDefinition::new("port_mappings");
pub const BILLING_LOGS: TableDefinition<u64, &[u8]> = TableDefinition::new("billing_logs");

/// Counters keyed by name. `next_id` is the shared id sequence.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Every entity table, in creation order.
pub const ALL_TABLES: [TableDefinition<u64, &[u8]>; 14] = [
    SITES,
    APPLIANCE_TYPES,
    CONFIG_INSTANCES,
    APPLIANCE_SETS,
    APPLIANCES,
    DEV_MODE_PROPERTY_SETS,
    VMS,
    DEPLOYMENTS,
    FUNDS,
    FLAVORS,
    TEMPLATES,
    PORT_MAPPING_TEMPLATES,
    PORT_MAPPINGS,
    BILLING_LOGS,
];

/// A persisted entity with a numeric id.
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: TableDefinition<'static, u64, &'static [u8]>;
    /// Human-readable kind used in error messages and logs.
    const KIND: &'static str;

    fn id(&self) -> u64;
}

macro_rules! record {
    ($ty:ty, $table:ident, $kind:literal) => {
        impl Record for $ty {
            const TABLE: TableDefinition<'static, u64, &'static [u8]> = $table;
            const KIND: &'static str = $kind;

            fn id(&self) -> u64 {
                self.id
            }
        }
    };
}

record!(ComputeSite, SITES, "compute site");
record!(ApplianceType, APPLIANCE_TYPES, "appliance type");
record!(ApplianceConfigurationInstance, CONFIG_INSTANCES, "configuration instance");
record!(ApplianceSet, APPLIANCE_SETS, "appliance set");
record!(Appliance, APPLIANCES, "appliance");
record!(DevModePropertySet, DEV_MODE_PROPERTY_SETS, "dev mode property set");
record!(VirtualMachine, VMS, "virtual machine");
record!(Deployment, DEPLOYMENTS, "deployment");
record!(Fund, FUNDS, "fund");
record!(VmFlavor, FLAVORS, "flavor");
record!(VmTemplate, TEMPLATES, "template");
record!(PortMappingTemplate, PORT_MAPPING_TEMPLATES, "port mapping template");
record!(PortMapping, PORT_MAPPINGS, "port mapping");
record!(BillingLog, BILLING_LOGS, "billing log");
