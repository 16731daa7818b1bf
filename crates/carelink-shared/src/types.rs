use serde::{Deserialize, Serialize};

/// Identifier of a peer as assigned by the transport and listed by the
/// presence directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport-assigned identifier of one media call object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CallId(pub u64);

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Transport-assigned identifier of one data link object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_truncates_on_char_boundary() {
        assert_eq!(PeerId::new("abcdefghijkl").short(), "abcdefgh");
        assert_eq!(PeerId::new("abc").short(), "abc");
        assert_eq!(PeerId::new("ééééééééé").short(), "éééééééé");
    }

    #[test]
    fn peer_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&PeerId::new("peer-1")).unwrap();
        assert_eq!(json, "\"peer-1\"");
        let ids: Vec<PeerId> = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(ids, vec![PeerId::new("a"), PeerId::new("b")]);
    }
}
