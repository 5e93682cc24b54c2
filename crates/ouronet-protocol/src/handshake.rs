//! Handshake mini-protocol: version negotiation.
//!
//! ```text
//! MsgProposeVersions  [0, {version: params}]
//! MsgAcceptVersion    [1, version, params]
//! MsgRefuse           [2, reason]
//! MsgQueryReply       [3, {version: params}]
//!
//! reason: [0, [version*]]         version mismatch
//!         [1, version, text]      decode error
//!         [2, version, text]      refused
//! ```
//!
//! The client proposes a version table; the server picks the highest
//! version both sides support, provided the network magic matches. A
//! proposal's parameters stay encoded until a version is chosen, so
//! parameters of versions the server does not know never fail the
//! handshake. The outcome is published on a [`watch`] channel so the
//! session can wait for it without polling.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ouronet_core::cbor::{as_array, as_bool, as_text, as_u64, expect_fields, split_message, uint};
use ouronet_core::{CborValue, CodecError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::agent::{
    Agency, Agent, ListenerId, Listeners, Message, Notifications, Protocol, Role,
};
use crate::error::AgentError;
use crate::mux::ProtocolId;

/// Bit set on node-to-client version numbers.
pub const NODE_TO_CLIENT_FLAG: u64 = 0x8000;

/// First node-to-node version with peer sharing and query fields.
const N2N_EXTENDED_PARAMS: u64 = 11;

/// First node-to-client version with the query field.
const N2C_EXTENDED_PARAMS: u64 = NODE_TO_CLIENT_FLAG | 15;

/// Parameters attached to one protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionData {
    pub network_magic: u64,
    pub initiator_only: bool,
    pub peer_sharing: u8,
    pub query: bool,
}

impl VersionData {
    pub fn new(network_magic: u64) -> Self {
        Self {
            network_magic,
            initiator_only: false,
            peer_sharing: 0,
            query: false,
        }
    }

    /// Wire form of the parameters for `version`.
    pub fn to_cbor(&self, version: u64) -> CborValue {
        let magic = uint(self.network_magic);
        if version & NODE_TO_CLIENT_FLAG != 0 {
            if version >= N2C_EXTENDED_PARAMS {
                CborValue::Array(vec![magic, CborValue::Bool(self.query)])
            } else {
                magic
            }
        } else if version >= N2N_EXTENDED_PARAMS {
            CborValue::Array(vec![
                magic,
                CborValue::Bool(self.initiator_only),
                uint(self.peer_sharing as u64),
                CborValue::Bool(self.query),
            ])
        } else {
            CborValue::Array(vec![magic, CborValue::Bool(self.initiator_only)])
        }
    }

    pub fn from_cbor(version: u64, value: CborValue) -> Result<Self, CodecError> {
        if let CborValue::Integer(_) = value {
            return Ok(Self::new(as_u64(&value, "version params")?));
        }

        let items = as_array(value, "version params")?;
        let magic = match items.first() {
            Some(v) => as_u64(v, "network magic")?,
            None => return Err(CodecError::structure("version params", "empty")),
        };
        let mut data = Self::new(magic);

        match (version & NODE_TO_CLIENT_FLAG != 0, items.len()) {
            (_, 1) => {}
            (true, 2) => data.query = as_bool(&items[1], "query")?,
            (false, 2) => data.initiator_only = as_bool(&items[1], "initiator only")?,
            (false, 4) => {
                data.initiator_only = as_bool(&items[1], "initiator only")?;
                data.peer_sharing = u8::try_from(as_u64(&items[2], "peer sharing")?)
                    .map_err(|_| CodecError::structure("peer sharing", "out of range"))?;
                data.query = as_bool(&items[3], "query")?;
            }
            (_, n) => {
                return Err(CodecError::structure(
                    "version params",
                    format!("unexpected {} fields for version {}", n, version),
                ))
            }
        }
        Ok(data)
    }
}

/// Versions a side supports, with their parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionTable(BTreeMap<u64, VersionData>);

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node-to-node versions 7 through 14.
    pub fn node_to_node(network_magic: u64) -> Self {
        let mut table = Self::new();
        for version in 7..=14 {
            table.insert(version, VersionData::new(network_magic));
        }
        table
    }

    /// Node-to-client versions 16 through 21.
    pub fn node_to_client(network_magic: u64) -> Self {
        let mut table = Self::new();
        for version in 16..=21 {
            table.insert(NODE_TO_CLIENT_FLAG | version, VersionData::new(network_magic));
        }
        table
    }

    pub fn insert(&mut self, version: u64, data: VersionData) {
        self.0.insert(version, data);
    }

    pub fn get(&self, version: u64) -> Option<&VersionData> {
        self.0.get(&version)
    }

    pub fn versions(&self) -> Vec<u64> {
        self.0.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Mark every entry as a query-only proposal.
    pub fn into_query(mut self) -> Self {
        for data in self.0.values_mut() {
            data.query = true;
        }
        self
    }

    /// Pick the version to accept for a peer's proposal.
    ///
    /// `self` is the local (server) table. Only the chosen version's
    /// parameters are decoded.
    pub fn negotiate(
        &self,
        proposed: &ProposedVersions,
    ) -> Result<(u64, VersionData), RefuseReason> {
        let common = self
            .0
            .iter()
            .rev()
            .find(|(v, _)| proposed.contains(**v))
            .map(|(v, local)| (*v, local));

        let Some((version, local)) = common else {
            if let Some(version) = proposed.unreadable() {
                return Err(RefuseReason::DecodeError {
                    version,
                    message: "no proposed version has readable parameters".into(),
                });
            }
            return Err(RefuseReason::VersionMismatch(self.versions()));
        };

        let remote = match proposed.params(version) {
            Some(Ok(remote)) => remote,
            Some(Err(e)) => {
                return Err(RefuseReason::DecodeError {
                    version,
                    message: e.to_string(),
                })
            }
            None => return Err(RefuseReason::VersionMismatch(self.versions())),
        };

        if local.network_magic != remote.network_magic {
            return Err(RefuseReason::Refused {
                version,
                message: format!(
                    "network magic mismatch: local {} remote {}",
                    local.network_magic, remote.network_magic
                ),
            });
        }

        Ok((
            version,
            VersionData {
                network_magic: local.network_magic,
                initiator_only: local.initiator_only || remote.initiator_only,
                peer_sharing: local.peer_sharing.min(remote.peer_sharing),
                query: remote.query,
            },
        ))
    }

    fn to_cbor(&self) -> CborValue {
        CborValue::Map(
            self.0
                .iter()
                .map(|(v, data)| (uint(*v), data.to_cbor(*v)))
                .collect(),
        )
    }

    fn from_cbor(value: CborValue) -> Result<Self, CodecError> {
        let CborValue::Map(entries) = value else {
            return Err(CodecError::structure("version table", "expected map"));
        };
        let mut table = Self::new();
        for (key, params) in entries {
            let version = as_u64(&key, "version number")?;
            table.insert(version, VersionData::from_cbor(version, params)?);
        }
        Ok(table)
    }
}

/// A peer's version proposal with parameters still in wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedVersions(BTreeMap<u64, CborValue>);

impl ProposedVersions {
    pub fn versions(&self) -> Vec<u64> {
        self.0.keys().copied().collect()
    }

    pub fn contains(&self, version: u64) -> bool {
        self.0.contains_key(&version)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode the parameters proposed for `version`.
    pub fn params(&self, version: u64) -> Option<Result<VersionData, CodecError>> {
        self.0
            .get(&version)
            .map(|raw| VersionData::from_cbor(version, raw.clone()))
    }

    /// Highest version, when the proposal is non-empty and no entry decodes.
    fn unreadable(&self) -> Option<u64> {
        let all_bad = self
            .0
            .iter()
            .all(|(v, raw)| VersionData::from_cbor(*v, raw.clone()).is_err());
        if all_bad {
            self.0.keys().next_back().copied()
        } else {
            None
        }
    }

    fn from_cbor(value: CborValue) -> Result<Self, CodecError> {
        let CborValue::Map(entries) = value else {
            return Err(CodecError::structure("version table", "expected map"));
        };
        entries
            .into_iter()
            .map(|(key, params)| -> Result<(u64, CborValue), CodecError> {
                Ok((as_u64(&key, "version number")?, params))
            })
            .collect::<Result<_, _>>()
            .map(ProposedVersions)
    }

    fn to_cbor(&self) -> CborValue {
        CborValue::Map(
            self.0
                .iter()
                .map(|(v, params)| (uint(*v), params.clone()))
                .collect(),
        )
    }
}

impl From<&VersionTable> for ProposedVersions {
    fn from(table: &VersionTable) -> Self {
        ProposedVersions(
            table
                .0
                .iter()
                .map(|(v, data)| (*v, data.to_cbor(*v)))
                .collect(),
        )
    }
}

/// Why a handshake failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefuseReason {
    /// No common version; carries the refusing side's versions.
    VersionMismatch(Vec<u64>),
    /// The proposal's parameters could not be decoded.
    DecodeError { version: u64, message: String },
    /// A common version exists but its parameters were rejected.
    Refused { version: u64, message: String },
}

impl fmt::Display for RefuseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefuseReason::VersionMismatch(versions) => {
                write!(f, "version mismatch, peer supports {:?}", versions)
            }
            RefuseReason::DecodeError { version, message } => {
                write!(f, "decode error for version {}: {}", version, message)
            }
            RefuseReason::Refused { version, message } => {
                write!(f, "refused version {}: {}", version, message)
            }
        }
    }
}

impl RefuseReason {
    fn to_cbor(&self) -> CborValue {
        match self {
            RefuseReason::VersionMismatch(versions) => CborValue::Array(vec![
                uint(0),
                CborValue::Array(versions.iter().map(|v| uint(*v)).collect()),
            ]),
            RefuseReason::DecodeError { version, message } => CborValue::Array(vec![
                uint(1),
                uint(*version),
                CborValue::Text(message.clone()),
            ]),
            RefuseReason::Refused { version, message } => CborValue::Array(vec![
                uint(2),
                uint(*version),
                CborValue::Text(message.clone()),
            ]),
        }
    }

    fn from_cbor(value: CborValue) -> Result<Self, CodecError> {
        let (tag, mut fields) = split_message(value, "refuse reason")?;
        match tag {
            0 => {
                expect_fields(&fields, 1, "version mismatch")?;
                let versions = as_array(fields.remove(0), "version mismatch")?
                    .iter()
                    .map(|v| as_u64(v, "version number"))
                    .collect::<Result<_, _>>()?;
                Ok(RefuseReason::VersionMismatch(versions))
            }
            1 | 2 => {
                expect_fields(&fields, 2, "refuse reason")?;
                let version = as_u64(&fields[0], "version number")?;
                let message = as_text(fields.remove(1), "refuse message")?;
                Ok(if tag == 1 {
                    RefuseReason::DecodeError { version, message }
                } else {
                    RefuseReason::Refused { version, message }
                })
            }
            tag => Err(CodecError::UnknownTag {
                protocol: "refuse reason",
                tag,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeMessage {
    ProposeVersions(ProposedVersions),
    AcceptVersion(u64, VersionData),
    Refuse(RefuseReason),
    QueryReply(VersionTable),
}

impl Message for HandshakeMessage {
    fn name(&self) -> &'static str {
        match self {
            HandshakeMessage::ProposeVersions(_) => "ProposeVersions",
            HandshakeMessage::AcceptVersion(..) => "AcceptVersion",
            HandshakeMessage::Refuse(_) => "Refuse",
            HandshakeMessage::QueryReply(_) => "QueryReply",
        }
    }

    fn to_cbor(&self) -> CborValue {
        match self {
            HandshakeMessage::ProposeVersions(table) => {
                CborValue::Array(vec![uint(0), table.to_cbor()])
            }
            HandshakeMessage::AcceptVersion(version, data) => {
                CborValue::Array(vec![uint(1), uint(*version), data.to_cbor(*version)])
            }
            HandshakeMessage::Refuse(reason) => CborValue::Array(vec![uint(2), reason.to_cbor()]),
            HandshakeMessage::QueryReply(table) => {
                CborValue::Array(vec![uint(3), table.to_cbor()])
            }
        }
    }

    fn from_cbor(value: CborValue) -> Result<Self, CodecError> {
        let (tag, mut fields) = split_message(value, Handshake::NAME)?;
        match tag {
            0 => {
                expect_fields(&fields, 1, "MsgProposeVersions")?;
                Ok(HandshakeMessage::ProposeVersions(ProposedVersions::from_cbor(
                    fields.remove(0),
                )?))
            }
            1 => {
                expect_fields(&fields, 2, "MsgAcceptVersion")?;
                let version = as_u64(&fields[0], "version number")?;
                let data = VersionData::from_cbor(version, fields.remove(1))?;
                Ok(HandshakeMessage::AcceptVersion(version, data))
            }
            2 => {
                expect_fields(&fields, 1, "MsgRefuse")?;
                Ok(HandshakeMessage::Refuse(RefuseReason::from_cbor(
                    fields.remove(0),
                )?))
            }
            3 => {
                expect_fields(&fields, 1, "MsgQueryReply")?;
                Ok(HandshakeMessage::QueryReply(VersionTable::from_cbor(
                    fields.remove(0),
                )?))
            }
            tag => Err(CodecError::UnknownTag {
                protocol: Handshake::NAME,
                tag,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Propose,
    Confirm,
    Done,
}

pub struct Handshake;

impl Protocol for Handshake {
    type State = HandshakeState;
    type Message = HandshakeMessage;

    const NAME: &'static str = "handshake";
    const INITIAL: HandshakeState = HandshakeState::Propose;

    fn agency(state: HandshakeState) -> Agency {
        match state {
            HandshakeState::Propose => Agency::Client,
            HandshakeState::Confirm => Agency::Server,
            HandshakeState::Done => Agency::Nobody,
        }
    }

    fn transition(state: HandshakeState, message: &HandshakeMessage) -> Option<HandshakeState> {
        match (state, message) {
            (HandshakeState::Propose, HandshakeMessage::ProposeVersions(_)) => {
                Some(HandshakeState::Confirm)
            }
            (
                HandshakeState::Confirm,
                HandshakeMessage::AcceptVersion(..)
                | HandshakeMessage::Refuse(_)
                | HandshakeMessage::QueryReply(_),
            ) => Some(HandshakeState::Done),
            _ => None,
        }
    }
}

/// How a handshake ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Accepted { version: u64, data: VersionData },
    Refused(RefuseReason),
    /// The client asked for the server's table instead of a session.
    Queried(VersionTable),
}

/// Observer of handshake results.
pub trait HandshakeListener: Send + Sync {
    fn handshake_ok(&self, _version: u64, _data: &VersionData) {}

    fn handshake_error(&self, _reason: &RefuseReason) {}
}

/// Either side of the handshake.
pub struct HandshakeAgent {
    role: Role,
    versions: VersionTable,
    state: HandshakeState,
    reply: Option<HandshakeMessage>,
    outcome: watch::Sender<Option<HandshakeOutcome>>,
    listeners: Listeners<dyn HandshakeListener>,
}

impl HandshakeAgent {
    /// Client that proposes `versions`.
    pub fn client(versions: VersionTable) -> Self {
        Self::with_role(Role::Client, versions)
    }

    /// Server that accepts from `versions`.
    pub fn server(versions: VersionTable) -> Self {
        Self::with_role(Role::Server, versions)
    }

    fn with_role(role: Role, versions: VersionTable) -> Self {
        Self {
            role,
            versions,
            state: Handshake::INITIAL,
            reply: None,
            outcome: watch::Sender::new(None),
            listeners: Listeners::new(),
        }
    }

    pub fn versions(&self) -> &VersionTable {
        &self.versions
    }

    /// Watch for the outcome; `None` until the handshake ends.
    pub fn subscribe(&self) -> watch::Receiver<Option<HandshakeOutcome>> {
        self.outcome.subscribe()
    }

    pub fn outcome(&self) -> Option<HandshakeOutcome> {
        self.outcome.borrow().clone()
    }

    /// The accepted version and its parameters.
    pub fn negotiated(&self) -> Option<(u64, VersionData)> {
        match &*self.outcome.borrow() {
            Some(HandshakeOutcome::Accepted { version, data }) => Some((*version, *data)),
            _ => None,
        }
    }

    pub fn add_listener(
        &mut self,
        listener: Arc<dyn HandshakeListener>,
    ) -> Result<ListenerId, AgentError> {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    fn finish(&mut self, outcome: HandshakeOutcome) {
        match &outcome {
            HandshakeOutcome::Accepted { version, data } => {
                let (version, data) = (*version, *data);
                tracing::debug!(
                    role = ?self.role,
                    version,
                    magic = data.network_magic,
                    "handshake accepted"
                );
                self.listeners.notify(move |l| l.handshake_ok(version, &data));
            }
            HandshakeOutcome::Refused(reason) => {
                tracing::warn!(role = ?self.role, "handshake refused: {}", reason);
                let reason = reason.clone();
                self.listeners.notify(move |l| l.handshake_error(&reason));
            }
            HandshakeOutcome::Queried(table) => {
                tracing::debug!(versions = ?table.versions(), "handshake query answered");
            }
        }
        self.outcome.send_replace(Some(outcome));
    }
}

impl Agent for HandshakeAgent {
    type Protocol = Handshake;

    fn protocol_id(&self) -> ProtocolId {
        ProtocolId::HANDSHAKE
    }

    fn role(&self) -> Role {
        self.role
    }

    fn state(&self) -> HandshakeState {
        self.state
    }

    fn set_state(&mut self, state: HandshakeState) {
        self.state = state;
    }

    fn produce_next(&self) -> Option<HandshakeMessage> {
        match self.role {
            Role::Client => Some(HandshakeMessage::ProposeVersions(ProposedVersions::from(
                &self.versions,
            ))),
            Role::Server => self.reply.clone(),
        }
    }

    fn on_sent(&mut self, message: &HandshakeMessage) {
        if self.role == Role::Client {
            return;
        }
        self.reply = None;
        match message {
            HandshakeMessage::AcceptVersion(version, data) => {
                self.finish(HandshakeOutcome::Accepted {
                    version: *version,
                    data: *data,
                })
            }
            HandshakeMessage::Refuse(reason) => {
                self.finish(HandshakeOutcome::Refused(reason.clone()))
            }
            HandshakeMessage::QueryReply(table) => {
                self.finish(HandshakeOutcome::Queried(table.clone()))
            }
            HandshakeMessage::ProposeVersions(_) => {}
        }
    }

    fn on_message(&mut self, message: HandshakeMessage) {
        match message {
            HandshakeMessage::ProposeVersions(proposed) => {
                self.reply = Some(match self.versions.negotiate(&proposed) {
                    Ok((version, data)) if data.query => {
                        tracing::debug!(version, "peer sent a version query");
                        HandshakeMessage::QueryReply(self.versions.clone())
                    }
                    Ok((version, data)) => HandshakeMessage::AcceptVersion(version, data),
                    Err(reason) => HandshakeMessage::Refuse(reason),
                });
            }
            HandshakeMessage::AcceptVersion(version, data) => {
                if self.versions.get(version).is_none() {
                    self.finish(HandshakeOutcome::Refused(RefuseReason::Refused {
                        version,
                        message: "peer accepted a version that was not proposed".into(),
                    }));
                } else {
                    self.finish(HandshakeOutcome::Accepted { version, data });
                }
            }
            HandshakeMessage::Refuse(reason) => self.finish(HandshakeOutcome::Refused(reason)),
            HandshakeMessage::QueryReply(table) => self.finish(HandshakeOutcome::Queried(table)),
        }
    }

    fn reset(&mut self) {
        self.state = Handshake::INITIAL;
        self.reply = None;
        self.outcome.send_replace(None);
    }

    fn seal_listeners(&mut self) {
        self.listeners.seal();
    }

    fn take_notifications(&mut self) -> Notifications {
        self.listeners.take_pending()
    }
}

/// Wait until `outcome` is published. `None` if the agent went away.
pub(crate) async fn wait_outcome(
    outcome: &mut watch::Receiver<Option<HandshakeOutcome>>,
) -> Option<HandshakeOutcome> {
    outcome
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|o| o.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        ok: Mutex<Vec<u64>>,
        errors: Mutex<Vec<RefuseReason>>,
    }

    impl HandshakeListener for Recorder {
        fn handshake_ok(&self, version: u64, _data: &VersionData) {
            self.ok.lock().unwrap().push(version);
        }

        fn handshake_error(&self, reason: &RefuseReason) {
            self.errors.lock().unwrap().push(reason.clone());
        }
    }

    /// Run a client proposal through a server and back.
    fn exchange(client: &mut HandshakeAgent, server: &mut HandshakeAgent) {
        let propose = client.take_next().unwrap();
        server.consume(propose).unwrap();

        let reply = server.take_next().unwrap();
        client.consume(reply).unwrap();
        client.take_notifications().run();
        server.take_notifications().run();
    }

    fn propose(entries: Vec<(u64, CborValue)>) -> HandshakeMessage {
        HandshakeMessage::ProposeVersions(ProposedVersions(entries.into_iter().collect()))
    }

    #[test]
    fn test_picks_highest_common_version() {
        let mut client = HandshakeAgent::client(VersionTable::node_to_node(2));
        let mut local = VersionTable::new();
        for v in 7..=11 {
            local.insert(v, VersionData::new(2));
        }
        let mut server = HandshakeAgent::server(local);

        exchange(&mut client, &mut server);

        assert_eq!(client.negotiated().unwrap().0, 11);
        assert_eq!(server.negotiated().unwrap().0, 11);
        assert!(client.is_done());
        assert!(server.is_done());
    }

    #[test]
    fn test_magic_mismatch_refused() {
        let recorder = Arc::new(Recorder::default());
        let mut client = HandshakeAgent::client(VersionTable::node_to_node(764824073));
        client.add_listener(recorder.clone()).unwrap();
        let mut server = HandshakeAgent::server(VersionTable::node_to_node(1));

        exchange(&mut client, &mut server);

        assert!(matches!(
            client.outcome(),
            Some(HandshakeOutcome::Refused(RefuseReason::Refused { version: 14, .. }))
        ));
        assert_eq!(recorder.errors.lock().unwrap().len(), 1);
        assert!(recorder.ok.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_common_version() {
        let mut client = HandshakeAgent::client(VersionTable::node_to_client(2));
        let mut server = HandshakeAgent::server(VersionTable::node_to_node(2));

        exchange(&mut client, &mut server);

        assert_eq!(
            client.outcome(),
            Some(HandshakeOutcome::Refused(RefuseReason::VersionMismatch(
                (7..=14).collect()
            )))
        );
    }

    #[test]
    fn test_query_gets_table() {
        let mut client = HandshakeAgent::client(VersionTable::node_to_node(2).into_query());
        let mut server = HandshakeAgent::server(VersionTable::node_to_node(2));

        exchange(&mut client, &mut server);

        assert_eq!(
            client.outcome(),
            Some(HandshakeOutcome::Queried(VersionTable::node_to_node(2)))
        );
    }

    #[test]
    fn test_version_params_by_version() {
        let data = VersionData {
            network_magic: 42,
            initiator_only: true,
            peer_sharing: 1,
            query: false,
        };

        let v10 = cbor_hex(&data.to_cbor(10));
        assert_eq!(v10, "82182af5");

        let v13 = cbor_hex(&data.to_cbor(13));
        assert_eq!(v13, "84182af501f4");

        let n2c_old = cbor_hex(&data.to_cbor(NODE_TO_CLIENT_FLAG | 9));
        assert_eq!(n2c_old, "182a");

        assert_eq!(
            VersionData::from_cbor(13, data.to_cbor(13)).unwrap(),
            data
        );
    }

    fn cbor_hex(value: &CborValue) -> String {
        hex::encode(ouronet_core::cbor::encode(value).unwrap())
    }

    #[test]
    fn test_refuse_wire_format() {
        let msg = HandshakeMessage::Refuse(RefuseReason::VersionMismatch(vec![7, 8]));
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes, vec![0x82, 0x02, 0x82, 0x00, 0x82, 0x07, 0x08]);
        assert_eq!(HandshakeMessage::decode(&bytes).unwrap(), msg);

        let msg = HandshakeMessage::Refuse(RefuseReason::DecodeError {
            version: 9,
            message: "bad".into(),
        });
        assert_eq!(HandshakeMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_propose_encodes_sorted_map() {
        let msg = HandshakeMessage::ProposeVersions(ProposedVersions::from(
            &VersionTable::node_to_node(1),
        ));
        let bytes = msg.encode().unwrap();
        // [0, {7: [1, false], ...}] with 8 entries
        assert_eq!(&bytes[..5], &[0x82, 0x00, 0xa8, 0x07, 0x82]);
        assert_eq!(HandshakeMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_reset_clears_outcome() {
        let mut client = HandshakeAgent::client(VersionTable::node_to_node(2));
        let mut server = HandshakeAgent::server(VersionTable::node_to_node(2));
        let watcher = client.subscribe();

        exchange(&mut client, &mut server);
        assert!(watcher.borrow().is_some());

        client.reset();
        assert!(watcher.borrow().is_none());
        assert_eq!(client.state(), HandshakeState::Propose);
        client.reset();
        assert_eq!(client.state(), HandshakeState::Propose);
        assert!(client.outcome().is_none());
    }

    #[test]
    fn test_propose_while_confirming_is_violation() {
        let mut server = HandshakeAgent::server(VersionTable::node_to_node(2));
        let table = VersionTable::node_to_node(2);
        let propose = HandshakeMessage::ProposeVersions(ProposedVersions::from(&table));
        server.consume(propose.clone()).unwrap();
        assert!(server.consume(propose).is_err());
        assert_eq!(server.state(), HandshakeState::Confirm);
    }

    #[test]
    fn test_unknown_version_params_are_ignored() {
        let mut server = HandshakeAgent::server(VersionTable::node_to_node(2));
        let good = VersionData::new(2).to_cbor(14);
        // Version 99 uses a parameter shape this side cannot read.
        let future = CborValue::Array(vec![uint(2), CborValue::Text("new".into())]);
        server.consume(propose(vec![(14, good), (99, future)])).unwrap();

        let reply = server.take_next().unwrap();
        assert!(matches!(reply, HandshakeMessage::AcceptVersion(14, _)));
        assert_eq!(server.negotiated().map(|(v, _)| v), Some(14));
    }

    #[test]
    fn test_unreadable_chosen_params_refused_as_decode_error() {
        let recorder = Arc::new(Recorder::default());
        let mut server = HandshakeAgent::server(VersionTable::node_to_node(2));
        server.add_listener(recorder.clone()).unwrap();
        let good = VersionData::new(2).to_cbor(13);
        let bad = CborValue::Text("magic".into());
        server.consume(propose(vec![(13, good), (14, bad)])).unwrap();

        match server.take_next() {
            Some(HandshakeMessage::Refuse(RefuseReason::DecodeError { version, .. })) => {
                assert_eq!(version, 14)
            }
            other => panic!("expected decode error, got {:?}", other),
        }
        server.take_notifications().run();
        assert_eq!(recorder.errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_all_unreadable_params_refused_as_decode_error() {
        let mut server = HandshakeAgent::server(VersionTable::node_to_node(2));
        let bad = CborValue::Text("?".into());
        server
            .consume(propose(vec![(40, bad.clone()), (41, bad)]))
            .unwrap();

        assert!(matches!(
            server.take_next(),
            Some(HandshakeMessage::Refuse(RefuseReason::DecodeError { version: 41, .. }))
        ));
    }

    #[test]
    fn test_outcome_waits_for_send() {
        let mut server = HandshakeAgent::server(VersionTable::node_to_node(2));
        server
            .consume(HandshakeMessage::ProposeVersions(ProposedVersions::from(
                &VersionTable::node_to_node(2),
            )))
            .unwrap();

        // A reply that has not gone out is not an outcome yet.
        assert!(server.produce_next().is_some());
        assert_eq!(server.outcome(), None);

        server.take_next().unwrap();
        assert!(server.negotiated().is_some());
        assert!(server.produce_next().is_none());
    }
}
