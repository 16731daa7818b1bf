//! Single-value settings, chiefly the persisted local peer id.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use carelink_shared::constants::SETTING_LOCAL_PEER_ID;
use carelink_shared::types::PeerId;

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Store `value` under `key` unless the key already exists. Returns
    /// `true` if the value was written.
    pub fn insert_setting_once(&self, key: &str, value: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO settings (key, value, created_at) VALUES (?1, ?2, ?3)",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    /// The peer id used on the last successful connection, if any.
    pub fn load_local_peer_id(&self) -> Result<Option<PeerId>> {
        Ok(self.get_setting(SETTING_LOCAL_PEER_ID)?.map(PeerId))
    }

    /// Persist the local peer id. An id that is already stored is never
    /// replaced; returns `false` in that case.
    pub fn save_local_peer_id(&self, id: &PeerId) -> Result<bool> {
        let written = self.insert_setting_once(SETTING_LOCAL_PEER_ID, id.as_str())?;
        if written {
            tracing::info!(peer = %id, "persisted local peer id");
        }
        Ok(written)
    }

    /// Forget the local peer id (explicit logout).
    pub fn clear_local_peer_id(&self) -> Result<bool> {
        self.delete_setting(SETTING_LOCAL_PEER_ID)
    }
}
