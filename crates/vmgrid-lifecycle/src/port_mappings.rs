//! Port mapping template administration.

use tracing::{debug, info, warn};
use vmgrid_state::*;

use crate::error::{LifecycleError, LifecycleResult};
use crate::manager::ApplianceManager;

/// Request to declare a service port for an appliance type or a
/// development-mode property set.
#[derive(Debug, Clone)]
pub struct NewPortMappingTemplate {
    pub owner: PmtOwner,
    pub service_name: String,
    pub transport_protocol: TransportProtocol,
    pub application_protocol: ApplicationProtocol,
    pub target_port: u16,
}

impl ApplianceManager {
    /// Validate and store a template, then map it on the VMs it applies to.
    pub async fn create_port_mapping_template(
        &self,
        request: NewPortMappingTemplate,
    ) -> LifecycleResult<PortMappingTemplate> {
        let template = self.store.write(|txn| {
            ensure_owner_in(txn, request.owner)?;
            let candidate = PortMappingTemplate {
                id: 0,
                owner: request.owner,
                service_name: request.service_name.clone(),
                transport_protocol: request.transport_protocol,
                application_protocol: request.application_protocol,
                target_port: request.target_port,
            };
            candidate
                .validate(&txn.templates_for_owner(request.owner)?)
                .map_err(LifecycleError::Invalid)?;
            Ok::<_, LifecycleError>(txn.insert_with(|id| PortMappingTemplate { id, ..candidate })?)
        })?;

        match self.network.on_template_created(&template).await {
            Ok(added) => debug!(template = template.id, added, "template mapped"),
            Err(e) => warn!(template = template.id, error = %e, "template not mapped"),
        }
        info!(
            template = template.id,
            service = %template.service_name,
            port = template.target_port,
            "port mapping template created"
        );
        Ok(template)
    }

    /// Replace a template and reconcile its mappings. The owner of a
    /// template never changes.
    pub async fn update_port_mapping_template(
        &self,
        template: PortMappingTemplate,
    ) -> LifecycleResult<PortMappingTemplate> {
        let old = self.store.write(|txn| {
            let old = txn.require::<PortMappingTemplate>(template.id)?;
            if old.owner != template.owner {
                return Err(LifecycleError::Invalid(format!(
                    "owner of port mapping template {} cannot change",
                    template.id
                )));
            }
            template
                .validate(&txn.templates_for_owner(template.owner)?)
                .map_err(LifecycleError::Invalid)?;
            txn.put(&template)?;
            Ok(old)
        })?;

        if let Err(e) = self.network.on_template_updated(&old, &template).await {
            warn!(template = template.id, error = %e, "template mappings not reconciled");
        }
        info!(template = template.id, "port mapping template updated");
        Ok(template)
    }

    /// Delete a template and every mapping made from it.
    pub async fn destroy_port_mapping_template(
        &self,
        template_id: PortMappingTemplateId,
    ) -> LifecycleResult<()> {
        self.store.write(|txn| {
            txn.require::<PortMappingTemplate>(template_id)?;
            txn.delete::<PortMappingTemplate>(template_id)
        })?;
        let removed = self.network.remove_template_mappings(template_id).await?;
        info!(template = template_id, mappings = removed, "port mapping template destroyed");
        Ok(())
    }
}

fn ensure_owner_in(txn: &WriteTxn, owner: PmtOwner) -> StateResult<()> {
    match owner {
        PmtOwner::ApplianceType(id) => txn.require::<ApplianceType>(id).map(|_| ()),
        PmtOwner::DevModePropertySet(id) => txn.require::<DevModePropertySet>(id).map(|_| ()),
    }
}
