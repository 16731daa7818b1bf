use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::types::PeerId;

/// A single message on a data link: either a JSON control envelope or a
/// raw binary chunk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

/// Control envelopes exchanged over a data link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// Plain chat text
    Text {
        #[serde(default = "Uuid::new_v4")]
        id: Uuid,
        text: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// Announces a file transfer; chunks follow
    FileMeta { message: FileMessageMeta },

    /// Announces the binary chunk that immediately follows
    #[serde(rename_all = "camelCase")]
    FileChunkMeta {
        message_id: Uuid,
        chunk_index: u32,
        total_chunks: u32,
    },

    /// The sender gave up on a transfer; discard partial state
    #[serde(rename_all = "camelCase")]
    FileAbort { message_id: Uuid },
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Text { .. } => "text",
            Envelope::FileMeta { .. } => "file-meta",
            Envelope::FileChunkMeta { .. } => "file-chunk-meta",
            Envelope::FileAbort { .. } => "file-abort",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_payload(&self) -> Result<Payload, ProtocolError> {
        self.to_json().map(Payload::Text)
    }
}

/// The chat message that carries a file, sent ahead of its chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMessageMeta {
    pub id: Uuid,
    pub sender: PeerId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub attachment: AttachmentMeta,
}

/// Attachment description without its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
    /// BLAKE3 digest of the whole file, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl AttachmentMeta {
    pub fn describe(name: impl Into<String>, mime_type: impl Into<String>, data: &[u8]) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size: data.len() as u64,
            digest: Some(digest_hex(data)),
        }
    }

    /// Check reassembled bytes against the declared size and digest.
    pub fn verify(&self, data: &[u8]) -> Result<(), ProtocolError> {
        if data.len() as u64 != self.size {
            return Err(ProtocolError::SizeMismatch {
                expected: self.size,
                got: data.len() as u64,
            });
        }
        match &self.digest {
            Some(expected) if !expected.eq_ignore_ascii_case(&digest_hex(data)) => {
                Err(ProtocolError::DigestMismatch)
            }
            _ => Ok(()),
        }
    }
}

pub fn digest_hex(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_envelope_wire_shape() {
        let env = Envelope::Text {
            id: Uuid::nil(),
            text: "hello".into(),
            timestamp: Utc::now(),
        };
        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hello");
    }

    #[test]
    fn minimal_text_envelope_is_accepted() {
        let env = Envelope::from_json(r#"{"type":"text","text":"hi"}"#).unwrap();
        assert!(matches!(env, Envelope::Text { ref text, .. } if text == "hi"));
    }

    #[test]
    fn chunk_meta_uses_camel_case() {
        let env = Envelope::FileChunkMeta {
            message_id: Uuid::nil(),
            chunk_index: 3,
            total_chunks: 7,
        };
        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "file-chunk-meta");
        assert_eq!(json["chunkIndex"], 3);
        assert_eq!(json["totalChunks"], 7);
        assert!(json.get("messageId").is_some());
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Envelope::from_json(r#"{"type":"video","text":"x"}"#).is_err());
        assert!(Envelope::from_json("not json").is_err());
    }

    #[test]
    fn attachment_verification() {
        let data = b"some attachment bytes";
        let meta = AttachmentMeta::describe("a.txt", "text/plain", data);
        assert!(meta.verify(data).is_ok());
        assert!(matches!(
            meta.verify(b"some attachment byteZ"),
            Err(ProtocolError::DigestMismatch)
        ));
        assert!(matches!(
            meta.verify(b"short"),
            Err(ProtocolError::SizeMismatch { .. })
        ));
    }
}
