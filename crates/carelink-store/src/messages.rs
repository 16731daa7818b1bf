use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use carelink_shared::types::PeerId;

use crate::database::Database;
use crate::error::Result;
use crate::models::{StoredAttachment, StoredMessage};

impl Database {
    /// Append a message to its conversation. Returns `false` when a message
    /// with the same id is already stored.
    pub fn append_message(&self, message: &StoredMessage) -> Result<bool> {
        let attachment = message.attachment.as_ref();
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO messages
                 (id, peer, sender, text, timestamp, attachment_name, attachment_type, attachment_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id.to_string(),
                message.peer.as_str(),
                message.sender.as_str(),
                message.text,
                message.timestamp.to_rfc3339(),
                attachment.map(|a| a.name.as_str()),
                attachment.map(|a| a.mime_type.as_str()),
                attachment.map(|a| a.size as i64),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Every stored message exchanged with `peer`, oldest first.
    pub fn messages_with(&self, peer: &PeerId) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, peer, sender, text, timestamp, attachment_name, attachment_type, attachment_size
             FROM messages
             WHERE peer = ?1
             ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map(params![peer.as_str()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id_str: String = row.get(0)?;
    let peer: String = row.get(1)?;
    let sender: String = row.get(2)?;
    let text: String = row.get(3)?;
    let ts_str: String = row.get(4)?;
    let attachment_name: Option<String> = row.get(5)?;
    let attachment_type: Option<String> = row.get(6)?;
    let attachment_size: Option<i64> = row.get(7)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let attachment = attachment_name.map(|name| StoredAttachment {
        name,
        mime_type: attachment_type.unwrap_or_default(),
        size: attachment_size.unwrap_or(0).max(0) as u64,
    });

    Ok(StoredMessage {
        id,
        peer: PeerId(peer),
        sender: PeerId(sender),
        text,
        timestamp,
        attachment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(peer: &str, sender: &str, text: &str) -> StoredMessage {
        StoredMessage {
            id: Uuid::new_v4(),
            peer: PeerId::new(peer),
            sender: PeerId::new(sender),
            text: text.to_string(),
            timestamp: Utc::now(),
            attachment: None,
        }
    }

    #[test]
    fn history_keeps_append_order_per_peer() {
        let db = Database::open_in_memory().unwrap();
        db.append_message(&message("bob", "me", "first")).unwrap();
        db.append_message(&message("carol", "carol", "elsewhere")).unwrap();
        db.append_message(&message("bob", "bob", "second")).unwrap();

        let texts: Vec<String> = db
            .messages_with(&PeerId::new("bob"))
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn duplicate_ids_are_ignored() {
        let db = Database::open_in_memory().unwrap();
        let msg = message("bob", "bob", "once");
        assert!(db.append_message(&msg).unwrap());
        assert!(!db.append_message(&msg).unwrap());
        assert_eq!(db.messages_with(&PeerId::new("bob")).unwrap().len(), 1);
    }

    #[test]
    fn attachment_metadata_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let mut msg = message("bob", "me", "scan");
        msg.attachment = Some(StoredAttachment {
            name: "ct.pdf".into(),
            mime_type: "application/pdf".into(),
            size: 4096,
        });
        db.append_message(&msg).unwrap();
        let stored = db.messages_with(&PeerId::new("bob")).unwrap();
        assert_eq!(stored[0].attachment, msg.attachment);
        assert_eq!(stored[0].id, msg.id);
    }
}
