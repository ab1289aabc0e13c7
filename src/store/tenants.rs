use super::{invalid_column, sql_err, Store, StoreError};
use crate::shared::TenantId;
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantRecord {
    pub id: TenantId,
    pub name: String,
    pub chat_target: String,
    pub added_at: i64,
}

type RawTenant = (String, String, String, i64);

fn into_record((id, name, chat_target, added_at): RawTenant) -> Result<TenantRecord, StoreError> {
    Ok(TenantRecord {
        id: TenantId::parse(&id).map_err(|err| invalid_column("id", &id, err))?,
        name,
        chat_target,
        added_at,
    })
}

impl Store {
    /// Inserts a tenant. Re-registering the same id with the same chat is a
    /// no-op; any other collision on id or chat is a conflict.
    pub fn insert_tenant(&self, record: &TenantRecord) -> Result<bool, StoreError> {
        if let Some(existing) = self.get_tenant(record.id.as_str())? {
            if existing.chat_target == record.chat_target {
                return Ok(false);
            }
            return Err(StoreError::Conflict(format!(
                "tenant `{}` is already bound to chat `{}`",
                record.id, existing.chat_target
            )));
        }
        if let Some(owner) = self.find_tenant_by_chat(&record.chat_target)? {
            return Err(StoreError::Conflict(format!(
                "chat `{}` is already bound to tenant `{}`",
                record.chat_target, owner.id
            )));
        }

        let connection = self.connect()?;
        connection
            .execute(
                "INSERT INTO tenants (id, name, chat_target, added_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.id.as_str(),
                    record.name,
                    record.chat_target,
                    record.added_at
                ],
            )
            .map_err(sql_err)?;
        Ok(true)
    }

    pub fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantRecord>, StoreError> {
        let connection = self.connect()?;
        let raw = connection
            .query_row(
                "SELECT id, name, chat_target, added_at FROM tenants WHERE id = ?1",
                params![tenant_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(sql_err)?;
        raw.map(into_record).transpose()
    }

    pub fn find_tenant_by_chat(&self, chat: &str) -> Result<Option<TenantRecord>, StoreError> {
        let connection = self.connect()?;
        let raw = connection
            .query_row(
                "SELECT id, name, chat_target, added_at FROM tenants WHERE chat_target = ?1",
                params![chat],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(sql_err)?;
        raw.map(into_record).transpose()
    }

    pub fn list_tenants(&self) -> Result<Vec<TenantRecord>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare("SELECT id, name, chat_target, added_at FROM tenants ORDER BY id")
            .map_err(sql_err)?;
        let rows = statement
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(sql_err)?;
        let mut tenants = Vec::new();
        for row in rows {
            tenants.push(into_record(row.map_err(sql_err)?)?);
        }
        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(id: &str, chat: &str) -> TenantRecord {
        TenantRecord {
            id: TenantId::parse(id).expect("tenant id"),
            name: id.to_string(),
            chat_target: chat.to_string(),
            added_at: 1,
        }
    }

    #[test]
    fn one_chat_maps_to_one_tenant() {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("host.db")).expect("open");

        assert!(store.insert_tenant(&record("main", "c-main")).expect("insert"));
        assert!(!store.insert_tenant(&record("main", "c-main")).expect("repeat"));
        store
            .insert_tenant(&record("main", "c-other"))
            .expect_err("id rebinding");
        store
            .insert_tenant(&record("family", "c-main"))
            .expect_err("chat already owned");

        let owner = store.find_tenant_by_chat("c-main").expect("find").expect("owner");
        assert_eq!(owner.id.as_str(), "main");
        assert_eq!(store.list_tenants().expect("list").len(), 1);
    }
}
