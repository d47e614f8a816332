//! Protocol handlers and the per-endpoint protocol list.
//!
//! A [`Protocol`] is one logical service multiplexed over a connection. Each
//! endpoint owns its own instances in a [`ProtocolList`] whose positions are
//! the wire ids: the frame header's protocol id is an index into the list.
//!
//! Positions 0 and 1 are fixed on both sides (Reply and the handshake), so
//! they are addressable before negotiation. The client reorders everything
//! else to match the server's table once the handshake answers.

use std::collections::HashSet;

use async_trait::async_trait;
use nwrc_proto::{HANDSHAKE_PROTOCOL_ID, ProtocolTable, REPLY_PROTOCOL_ID, REPLY_PROTOCOL_NAME};

use crate::{
    error::{NegotiationError, Result},
    framing::Request,
    reply::Reply,
};

/// `expected_length` value for protocols that parse their own payload.
pub const SELF_DELIMITING: usize = 0;

/// Handler for one logical protocol.
#[async_trait]
pub trait Protocol: Send + 'static {
    /// Name used during negotiation, unique within a connection.
    fn name(&self) -> &str;

    /// Payload size of every frame, or [`SELF_DELIMITING`].
    ///
    /// Fixed-length payloads are staged before the handler runs, so a handler
    /// that misreads its payload cannot desynchronize the stream.
    fn expected_length(&self) -> usize {
        SELF_DELIMITING
    }

    /// Process one inbound frame.
    async fn handle(&mut self, request: &mut Request<'_>) -> Result<()>;
}

/// Placeholder that occupies a name and id and ignores inbound frames.
///
/// Used for the side of a protocol pair that never receives anything, such as
/// the client half of the handshake.
#[derive(Debug, Clone)]
pub struct StubProtocol {
    name: String,
}

impl StubProtocol {
    /// Create a stub reporting `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Protocol for StubProtocol {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&mut self, _request: &mut Request<'_>) -> Result<()> {
        Ok(())
    }
}

/// Ordered protocol instances of one endpoint; index is the wire id.
pub struct ProtocolList {
    protocols: Vec<Box<dyn Protocol>>,
}

impl ProtocolList {
    /// Wrap instances already in wire order.
    pub fn new(protocols: Vec<Box<dyn Protocol>>) -> Self {
        Self { protocols }
    }

    /// Reply at 0, `handshake` at 1, then `rest` in order.
    pub fn bootstrap(
        handshake: Box<dyn Protocol>,
        rest: impl IntoIterator<Item = Box<dyn Protocol>>,
    ) -> Self {
        let mut protocols: Vec<Box<dyn Protocol>> = vec![Box::new(Reply), handshake];
        protocols.extend(rest);
        Self { protocols }
    }

    /// Number of bound protocols.
    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    /// Whether no protocol is bound.
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// Handler bound to `id`.
    pub fn get_mut(&mut self, id: u32) -> Option<&mut (dyn Protocol + 'static)> {
        self.protocols.get_mut(id as usize).map(|protocol| &mut **protocol)
    }

    /// Names in wire order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.protocols.iter().map(|protocol| protocol.name())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.protocols.iter().position(|protocol| protocol.name() == name)
    }

    /// Table assigning ids by current position.
    pub fn table(&self) -> ProtocolTable {
        ProtocolTable::from_names(self.names())
    }

    /// Reject lists whose names repeat.
    pub fn check_unique(&self) -> std::result::Result<(), NegotiationError> {
        let mut seen = HashSet::new();
        for name in self.names() {
            if !seen.insert(name) {
                return Err(NegotiationError::DuplicateProtocol(name.to_owned()));
            }
        }
        Ok(())
    }

    /// Verify Reply and `handshake_name` sit at their fixed ids in `table`.
    pub fn check_bootstrap(
        table: &ProtocolTable,
        handshake_name: &str,
    ) -> std::result::Result<(), NegotiationError> {
        for (name, expected) in
            [(REPLY_PROTOCOL_NAME, REPLY_PROTOCOL_ID), (handshake_name, HANDSHAKE_PROTOCOL_ID)]
        {
            let found = table.id_of(name);
            if found != Some(expected) {
                return Err(NegotiationError::BootstrapMismatch {
                    name: name.to_owned(),
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Reorder so each protocol sits at the id `table` assigns its name.
    ///
    /// The table must be a bijection onto the local names. On error the list
    /// is left untouched. Applying the same table twice is a no-op the second
    /// time.
    pub fn reorder(&mut self, table: &ProtocolTable) -> std::result::Result<(), NegotiationError> {
        self.check_unique()?;

        let count = self.protocols.len();
        // order[id] = current position of the protocol that belongs at id
        let mut order: Vec<Option<usize>> = vec![None; count];
        let mut claimed = vec![false; count];

        for entry in table.entries() {
            let index = self
                .position(&entry.name)
                .ok_or_else(|| NegotiationError::UnknownRemoteProtocol(entry.name.clone()))?;
            let slot = order.get_mut(entry.id as usize).ok_or_else(|| {
                NegotiationError::IdOutOfRange { name: entry.name.clone(), id: entry.id, count }
            })?;
            if slot.is_some() || claimed[index] {
                return Err(NegotiationError::DuplicateProtocol(entry.name.clone()));
            }
            *slot = Some(index);
            claimed[index] = true;
        }

        if let Some(missing) = claimed.iter().position(|claimed| !claimed) {
            let name = self.protocols[missing].name().to_owned();
            return Err(NegotiationError::MissingRemoteProtocol(name));
        }

        let mut current: Vec<Option<Box<dyn Protocol>>> =
            self.protocols.drain(..).map(Some).collect();
        self.protocols = order
            .into_iter()
            .flatten()
            .filter_map(|index| current.get_mut(index).and_then(Option::take))
            .collect();
        Ok(())
    }
}

impl std::fmt::Debug for ProtocolList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use nwrc_proto::HANDSHAKE_PROTOCOL_NAME;
    use proptest::prelude::*;

    use super::*;

    fn list(names: &[&str]) -> ProtocolList {
        ProtocolList::bootstrap(
            Box::new(StubProtocol::new(HANDSHAKE_PROTOCOL_NAME)),
            names.iter().map(|name| Box::new(StubProtocol::new(*name)) as Box<dyn Protocol>),
        )
    }

    fn names(list: &ProtocolList) -> Vec<String> {
        list.names().map(str::to_owned).collect()
    }

    #[test]
    fn bootstrap_fixes_first_two_ids() {
        let list = list(&["Echo"]);
        assert_eq!(names(&list), vec!["Reply", "Handshake", "Echo"]);
    }

    #[test]
    fn reorder_follows_server_table() {
        let mut client = list(&["B", "A", "C"]);
        let server = list(&["A", "B", "C"]).table();

        client.reorder(&server).unwrap();
        assert_eq!(names(&client), vec!["Reply", "Handshake", "A", "B", "C"]);
    }

    #[test]
    fn reorder_is_idempotent() {
        let mut client = list(&["B", "A"]);
        let server = list(&["A", "B"]).table();

        client.reorder(&server).unwrap();
        let first = names(&client);
        client.reorder(&server).unwrap();
        assert_eq!(names(&client), first);
    }

    #[test]
    fn server_only_protocol_is_unknown() {
        let mut client = list(&["A"]);
        let server = list(&["A", "B"]).table();

        let result = client.reorder(&server);
        assert_eq!(result, Err(NegotiationError::UnknownRemoteProtocol("B".into())));
        assert_eq!(names(&client), vec!["Reply", "Handshake", "A"]);
    }

    #[test]
    fn client_only_protocol_is_missing() {
        let mut client = list(&["A", "B"]);
        let server = list(&["A"]).table();

        let result = client.reorder(&server);
        assert_eq!(result, Err(NegotiationError::MissingRemoteProtocol("B".into())));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut client = list(&["A"]);
        let mut table = ProtocolTable::new();
        table.push("Reply", 0);
        table.push("Handshake", 1);
        table.push("A", 1);

        assert_eq!(client.reorder(&table), Err(NegotiationError::DuplicateProtocol("A".into())));
    }

    #[test]
    fn out_of_range_id_is_rejected() {
        let mut client = list(&[]);
        let mut table = ProtocolTable::new();
        table.push("Reply", 0);
        table.push("Handshake", 5);

        assert!(matches!(client.reorder(&table), Err(NegotiationError::IdOutOfRange { .. })));
    }

    #[test]
    fn bootstrap_check_catches_moved_reply() {
        let table = ProtocolTable::from_names(["Handshake", "Reply"]);
        let result = ProtocolList::check_bootstrap(&table, HANDSHAKE_PROTOCOL_NAME);
        assert!(matches!(result, Err(NegotiationError::BootstrapMismatch { expected: 0, .. })));
    }

    #[test]
    fn duplicate_local_names_are_rejected() {
        let list = list(&["A", "A"]);
        assert_eq!(list.check_unique(), Err(NegotiationError::DuplicateProtocol("A".into())));
    }

    proptest! {
        #[test]
        fn any_permutation_is_applied(seed in prop::collection::vec(any::<u8>(), 1..8)) {
            let labels: Vec<String> = (0..seed.len()).map(|i| format!("P{i}")).collect();
            let mut shuffled: Vec<(u8, String)> = seed.iter().copied().zip(labels.clone()).collect();
            shuffled.sort();

            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            let shuffled_refs: Vec<&str> = shuffled.iter().map(|(_, n)| n.as_str()).collect();

            let mut client = list(&refs);
            let server = list(&shuffled_refs);
            client.reorder(&server.table()).unwrap();
            prop_assert_eq!(names(&client), names(&server));
        }
    }
}
