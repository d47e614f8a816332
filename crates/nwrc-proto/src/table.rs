//! Protocol table exchanged by the Handshake.
//!
//! The server owns the authoritative `name -> id` assignment. During the
//! handshake it sends the whole table back through Reply as a CBOR array, and
//! the client reorders its own protocol list to match.

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// One negotiated protocol: its name and the id frames use to address it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolEntry {
    /// Protocol name, unique within a connection
    pub name: String,
    /// Id assigned by the server
    pub id: u32,
}

/// Ordered `name -> id` assignment for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolTable {
    entries: Vec<ProtocolEntry>,
}

impl ProtocolTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table assigning ids by position.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = names
            .into_iter()
            .enumerate()
            .map(|(id, name)| ProtocolEntry { name: name.into(), id: id as u32 })
            .collect();
        Self { entries }
    }

    /// Append an entry.
    pub fn push(&mut self, name: impl Into<String>, id: u32) {
        self.entries.push(ProtocolEntry { name: name.into(), id });
    }

    /// All entries in the order the server reported them.
    pub fn entries(&self) -> &[ProtocolEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Id assigned to `name`, if present.
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.entries.iter().find(|entry| entry.name == name).map(|entry| entry.id)
    }

    /// Serialize to the CBOR wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from the CBOR wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

impl FromIterator<ProtocolEntry> for ProtocolTable {
    fn from_iter<T: IntoIterator<Item = ProtocolEntry>>(iter: T) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}
