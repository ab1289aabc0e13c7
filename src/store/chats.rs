use super::{invalid_column, sql_err, Store, StoreError};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

const GROUP_SYNC_KEY: &str = "last_group_sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub chat_id: String,
    pub name: String,
    pub last_activity: i64,
}

impl Store {
    /// Records chat metadata. A blank name never overwrites a known one and
    /// `last_activity` only moves forward.
    pub fn upsert_chat(&self, chat: &ChatRecord) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute(
                "INSERT INTO chats (chat_id, name, last_activity) VALUES (?1, ?2, ?3)
                 ON CONFLICT(chat_id) DO UPDATE SET
                    name = CASE WHEN excluded.name = '' THEN chats.name ELSE excluded.name END,
                    last_activity = MAX(chats.last_activity, excluded.last_activity)",
                params![chat.chat_id, chat.name.trim(), chat.last_activity],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn list_chats(&self) -> Result<Vec<ChatRecord>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "SELECT chat_id, name, last_activity FROM chats
                 ORDER BY last_activity DESC, chat_id",
            )
            .map_err(sql_err)?;
        let rows = statement
            .query_map([], |row| {
                Ok(ChatRecord {
                    chat_id: row.get(0)?,
                    name: row.get(1)?,
                    last_activity: row.get(2)?,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    pub fn record_group_sync(&self, now: i64) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute(
                "INSERT INTO host_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![GROUP_SYNC_KEY, now.to_string()],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn last_group_sync(&self) -> Result<Option<i64>, StoreError> {
        let connection = self.connect()?;
        let raw: Option<String> = connection
            .query_row(
                "SELECT value FROM host_meta WHERE key = ?1",
                params![GROUP_SYNC_KEY],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        match raw {
            Some(value) => value
                .parse::<i64>()
                .map(Some)
                .map_err(|err| invalid_column("value", &value, err.to_string())),
            None => Ok(None),
        }
    }
}
