use super::{sql_err, Store, StoreError};
use crate::shared::TenantId;
use rusqlite::{params, OptionalExtension};

impl Store {
    pub fn get_session(&self, tenant_id: &TenantId) -> Result<Option<String>, StoreError> {
        let connection = self.connect()?;
        connection
            .query_row(
                "SELECT session_id FROM sessions WHERE tenant_id = ?1",
                params![tenant_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)
    }

    pub fn set_session(
        &self,
        tenant_id: &TenantId,
        session_id: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute(
                "INSERT INTO sessions (tenant_id, session_id, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(tenant_id) DO UPDATE SET
                    session_id = excluded.session_id,
                    updated_at = excluded.updated_at",
                params![tenant_id.as_str(), session_id, now],
            )
            .map_err(sql_err)?;
        Ok(())
    }
}
