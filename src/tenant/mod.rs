pub mod workspace;

pub use workspace::{ensure_workspace, TenantWorkspace, WorkspaceError};

use crate::shared::TenantId;
use crate::store::{Store, StoreError, TenantRecord};

/// A bounded trust domain: one chat, one workspace tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub chat_target: String,
    pub is_privileged: bool,
}

impl Tenant {
    pub fn owns_chat(&self, chat: &str) -> bool {
        self.chat_target == chat
    }
}

/// Tenant lookups backed by the store. The privileged flag is derived from
/// the configured main tenant id rather than persisted, so at most one
/// tenant can ever carry it.
#[derive(Debug, Clone)]
pub struct TenantRegistry {
    store: Store,
    main_id: TenantId,
}

impl TenantRegistry {
    pub fn new(store: Store, main_id: TenantId) -> Self {
        Self { store, main_id }
    }

    pub fn main_id(&self) -> &TenantId {
        &self.main_id
    }

    pub fn register(
        &self,
        id: &TenantId,
        name: &str,
        chat_target: &str,
        now: i64,
    ) -> Result<Tenant, StoreError> {
        if chat_target.trim().is_empty() {
            return Err(StoreError::Conflict(format!(
                "tenant `{id}` requires a non-empty chat"
            )));
        }
        let record = TenantRecord {
            id: id.clone(),
            name: name.trim().to_string(),
            chat_target: chat_target.trim().to_string(),
            added_at: now,
        };
        self.store.insert_tenant(&record)?;
        Ok(self.from_record(record))
    }

    pub fn get(&self, id: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self.store.get_tenant(id)?.map(|record| self.from_record(record)))
    }

    pub fn by_chat(&self, chat: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self
            .store
            .find_tenant_by_chat(chat)?
            .map(|record| self.from_record(record)))
    }

    pub fn list(&self) -> Result<Vec<Tenant>, StoreError> {
        Ok(self
            .store
            .list_tenants()?
            .into_iter()
            .map(|record| self.from_record(record))
            .collect())
    }

    fn from_record(&self, record: TenantRecord) -> Tenant {
        Tenant {
            is_privileged: record.id == self.main_id,
            id: record.id,
            name: record.name,
            chat_target: record.chat_target,
        }
    }
}
