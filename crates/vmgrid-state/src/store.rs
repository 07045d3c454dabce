//! StateStore — redb-backed state persistence for VMGrid.
//!
//! Provides typed access to every [`Record`] through closures that run
//! inside a single redb transaction. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const NEXT_ID: &str = "next_id";

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in ALL_TABLES {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` against a consistent read snapshot.
    pub fn read<T, E>(&self, f: impl FnOnce(&ReadTxn) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        f(&ReadTxn { txn })
    }

    /// Run `f` inside a write transaction. Commits when `f` returns `Ok`,
    /// aborts otherwise. Only one write transaction runs at a time.
    pub fn write<T, E>(&self, f: impl FnOnce(&WriteTxn) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let wtxn = WriteTxn { txn };
        match f(&wtxn) {
            Ok(value) => {
                wtxn.txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                wtxn.txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    // ── Single-record shortcuts ────────────────────────────────────

    pub fn get<R: Record>(&self, id: u64) -> StateResult<Option<R>> {
        self.read(|txn| txn.get(id))
    }

    pub fn require<R: Record>(&self, id: u64) -> StateResult<R> {
        self.read(|txn| txn.require(id))
    }

    pub fn list<R: Record>(&self) -> StateResult<Vec<R>> {
        self.read(|txn| txn.list())
    }

    /// Insert or update a record.
    pub fn put<R: Record>(&self, record: &R) -> StateResult<()> {
        self.write(|txn| txn.put(record))
    }

    /// Allocate an id and store the record built from it.
    pub fn insert_with<R: Record>(&self, build: impl FnOnce(u64) -> R) -> StateResult<R> {
        self.write(|txn| txn.insert_with(build))
    }

    /// Delete a record by id. Returns true if it existed.
    pub fn delete<R: Record>(&self, id: u64) -> StateResult<bool> {
        self.write(|txn| txn.delete::<R>(id))
    }
}

/// Read-only transaction handle.
pub struct ReadTxn {
    txn: ReadTransaction,
}

/// Read-write transaction handle. Changes become visible on commit.
pub struct WriteTxn {
    txn: WriteTransaction,
}

impl WriteTxn {
    /// Draw the next id from the shared sequence.
    pub fn next_id(&self) -> StateResult<u64> {
        let mut meta = self.txn.open_table(META).map_err(map_err!(Table))?;
        let next = meta
            .get(NEXT_ID)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(1);
        meta.insert(NEXT_ID, next + 1).map_err(map_err!(Write))?;
        Ok(next)
    }

    /// Insert or update a record.
    pub fn put<R: Record>(&self, record: &R) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        table
            .insert(record.id(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    pub fn insert_with<R: Record>(&self, build: impl FnOnce(u64) -> R) -> StateResult<R> {
        let id = self.next_id()?;
        let record = build(id);
        self.put(&record)?;
        debug!(kind = R::KIND, id, "record inserted");
        Ok(record)
    }

    /// Delete a record by id. Returns true if it existed.
    pub fn delete<R: Record>(&self, id: u64) -> StateResult<bool> {
        let mut table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }
}

fn get_from<R: Record>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> StateResult<Option<R>> {
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => {
            let record: R = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn scan<R: Record>(table: &impl ReadableTable<u64, &'static [u8]>) -> StateResult<Vec<R>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let record: R = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.push(record);
    }
    Ok(results)
}

/// Query surface shared by read and write transactions.
pub trait Snapshot {
    fn get<R: Record>(&self, id: u64) -> StateResult<Option<R>>;

    /// All records of a kind, in id order.
    fn list<R: Record>(&self) -> StateResult<Vec<R>>;

    fn require<R: Record>(&self, id: u64) -> StateResult<R> {
        self.get(id)?
            .ok_or_else(|| StateError::NotFound(format!("{} {id}", R::KIND)))
    }

    fn list_where<R: Record>(&self, pred: impl Fn(&R) -> bool) -> StateResult<Vec<R>> {
        Ok(self.list::<R>()?.into_iter().filter(|r| pred(r)).collect())
    }

    fn deployments_on_vm(&self, vm_id: VmId) -> StateResult<Vec<Deployment>> {
        self.list_where(|d: &Deployment| d.vm_id == vm_id)
    }

    fn deployments_of_appliance(&self, appliance_id: ApplianceId) -> StateResult<Vec<Deployment>> {
        self.list_where(|d: &Deployment| d.appliance_id == appliance_id)
    }

    fn appliances_on_vm(&self, vm_id: VmId) -> StateResult<Vec<Appliance>> {
        let mut appliances = Vec::new();
        for deployment in self.deployments_on_vm(vm_id)? {
            if let Some(appliance) = self.get::<Appliance>(deployment.appliance_id)? {
                appliances.push(appliance);
            }
        }
        Ok(appliances)
    }

    fn port_mappings_of_vm(&self, vm_id: VmId) -> StateResult<Vec<PortMapping>> {
        self.list_where(|m: &PortMapping| m.vm_id == vm_id)
    }

    fn port_mappings_of_template(
        &self,
        template_id: PortMappingTemplateId,
    ) -> StateResult<Vec<PortMapping>> {
        self.list_where(|m: &PortMapping| m.template_id == template_id)
    }

    fn templates_for_owner(&self, owner: PmtOwner) -> StateResult<Vec<PortMappingTemplate>> {
        self.list_where(|t: &PortMappingTemplate| t.owner == owner)
    }

    /// Port mapping templates in force for an appliance. A dev-mode
    /// property set's templates replace those of the appliance type.
    fn port_mapping_templates_for(
        &self,
        appliance: &Appliance,
    ) -> StateResult<Vec<PortMappingTemplate>> {
        let owner = match appliance.dev_mode_property_set_id {
            Some(dev) => PmtOwner::DevModePropertySet(dev),
            None => PmtOwner::ApplianceType(appliance.appliance_type_id),
        };
        self.templates_for_owner(owner)
    }

    fn vms_on_site(&self, site_id: SiteId) -> StateResult<Vec<VirtualMachine>> {
        self.list_where(|vm: &VirtualMachine| vm.site_id == site_id)
    }

    fn find_vm_by_id_at_site(
        &self,
        site_id: SiteId,
        id_at_site: &str,
    ) -> StateResult<Option<VirtualMachine>> {
        Ok(self.vms_on_site(site_id)?.into_iter().find(|vm| {
            vm.id_at_site.as_deref() == Some(id_at_site)
        }))
    }

    /// Look up a compute site by its external identifier.
    fn find_site(&self, site_id: &str) -> StateResult<Option<ComputeSite>> {
        Ok(self
            .list::<ComputeSite>()?
            .into_iter()
            .find(|site| site.site_id == site_id))
    }

    fn billing_logs_of_fund(&self, fund_id: FundId) -> StateResult<Vec<BillingLog>> {
        self.list_where(|log: &BillingLog| log.fund_id == fund_id)
    }

    /// Whether a template is currently being captured from this VM.
    fn is_saving(&self, vm_id: VmId) -> StateResult<bool> {
        Ok(self
            .list::<VmTemplate>()?
            .iter()
            .any(|t| t.source_vm_id == Some(vm_id) && t.state == TemplateState::Saving))
    }
}

impl Snapshot for ReadTxn {
    fn get<R: Record>(&self, id: u64) -> StateResult<Option<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        get_from(&table, id)
    }

    fn list<R: Record>(&self) -> StateResult<Vec<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        scan(&table)
    }
}

impl Snapshot for WriteTxn {
    fn get<R: Record>(&self, id: u64) -> StateResult<Option<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        get_from(&table, id)
    }

    fn list<R: Record>(&self) -> StateResult<Vec<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        scan(&table)
    }
}
