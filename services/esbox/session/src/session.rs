//! Per-connection protocol engine.
//!
//! A [`Session`] ties together negotiation, the outbound queue and the
//! telemetry codec for one link. It performs no I/O: the transport feeds
//! inbound wrapper bytes to [`Session::receive`] and sends whatever
//! [`Session::next_outbound`] produces. The exchange alternates one wrapper
//! each way until both sides have sent a NoFurtherMessages-only wrapper.

use crate::collaborators::{Collaborators, OperationResult};
use crate::config::{EngineConfig, Role};
use crate::error::{ProtocolError, SessionError};
use crate::negotiation::{NegotiationState, Negotiator};
use crate::queue::OutboundQueue;
use bytes::Bytes;
use esbox_storage::{Filesystem, StorageError};
use esbox_wire::{
    CellDecoder, CellEncoder, CodecError, DataRequest, DataResponse, DataSource, DeltaFlags, DirEntry,
    DirListing, Direction, Field, FileTransfer, FilesystemOperation, Message, MessageBody, Opaque,
    OperationOutcome, ProtocolVersion, QueueMode, TelemetryCell, ValidationError, VersionRegistry,
    Wrapper, WrapperCodec,
};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

const UNSUPPORTED: i32 = 38;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent CloseConnection
    PeerClosed,
    /// Peer sent NotAuthenticated
    NotAuthenticated,
    /// Closed by this side
    Local(String),
    /// Transport went away
    Disconnected,
}

/// Something the caller should know about after an inbound wrapper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Negotiation completed
    Established(ProtocolVersion),
    /// A message for the application
    Message(Message),
    /// Decoded telemetry from a SendData, or why decoding failed
    Telemetry {
        /// FIFO the cells came from
        fifo: u8,
        /// Cells in sequence order
        cells: Result<Vec<TelemetryCell>, CodecError>,
    },
    /// A device-side request that was neither served nor answered: it has no
    /// handler in this role, or its reply does not exist in the session version
    Unhandled(Message),
    /// The peer's wrapper carried nothing but NoFurtherMessages
    PeerFinished,
    /// The session closed
    Closed(CloseReason),
}

/// Statistics for a session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Wrappers accepted
    pub wrappers_in: u64,
    /// Wrappers produced
    pub wrappers_out: u64,
    /// Messages in accepted wrappers
    pub messages_in: u64,
    /// Messages in produced wrappers
    pub messages_out: u64,
    /// Inbound wrappers dropped as malformed
    pub wrappers_dropped: u64,
    /// Pending `Single` entries replaced by a newer message
    pub queue_replacements: u64,
    /// Telemetry cells encoded into SendData
    pub cells_sent: u64,
    /// Telemetry cells decoded from SendData
    pub cells_received: u64,
}

/// One side of one ESBox API link
pub struct Session {
    id: Uuid,
    config: EngineConfig,
    codec: WrapperCodec,
    negotiator: Negotiator,
    queue: OutboundQueue,
    /// Device role: state of the current telemetry exchange
    encoder: CellEncoder,
    /// Server role: flags of the last GetData sent
    data_flags: DeltaFlags,
    collaborators: Collaborators,
    stats: SessionStats,
    peer_done: bool,
    local_done: bool,
}

impl Session {
    /// Create a session. Versions the registry does not know are ignored.
    pub fn new(config: EngineConfig, registry: Arc<VersionRegistry>, collaborators: Collaborators) -> Self {
        let mut supported: Vec<ProtocolVersion> = if config.supported_versions.is_empty() {
            registry.supported()
        } else {
            config
                .supported_versions
                .iter()
                .copied()
                .filter(|v| registry.supports(*v))
                .collect()
        };
        if supported.is_empty() {
            supported = registry.supported();
        }

        let mut default_version = config.default_version;
        if !registry.supports(default_version) {
            warn!(
                "Default version v{} is not registered, using v{}",
                default_version,
                ProtocolVersion::BASELINE
            );
            default_version = ProtocolVersion::BASELINE;
        }

        let id = Uuid::new_v4();
        debug!("Session {} created as {:?}, supports {:?}", id, config.role, supported);

        Self {
            id,
            negotiator: Negotiator::new(supported, default_version),
            codec: WrapperCodec::new(registry),
            queue: OutboundQueue::new(),
            encoder: CellEncoder::default(),
            data_flags: DeltaFlags::all(),
            collaborators,
            stats: SessionStats::default(),
            peer_done: false,
            local_done: false,
            config,
        }
    }

    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// This end of the link
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// Negotiation state
    pub fn state(&self) -> NegotiationState {
        self.negotiator.state()
    }

    /// Established version
    pub fn version(&self) -> Option<ProtocolVersion> {
        self.negotiator.established()
    }

    /// Counters
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Pending outbound messages
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether the session is closed
    pub fn is_closed(&self) -> bool {
        self.negotiator.state() == NegotiationState::Closed
    }

    /// Both sides' last wrappers carried only NoFurtherMessages
    pub fn is_exchange_complete(&self) -> bool {
        self.peer_done && self.local_done
    }

    fn ensure_open(&self) -> Result<(), ProtocolError> {
        if self.is_closed() {
            Err(ProtocolError::Closed)
        } else {
            Ok(())
        }
    }

    fn inbound_direction(&self) -> Direction {
        match self.config.role {
            Role::Device => Direction::ToDevice,
            Role::Server => Direction::FromDevice,
        }
    }

    fn outbound_direction(&self) -> Direction {
        match self.config.role {
            Role::Device => Direction::FromDevice,
            Role::Server => Direction::ToDevice,
        }
    }

    /// Initiate the session.
    ///
    /// A server probes with its newest version when that version can be
    /// probed, otherwise it assumes it. A device frames its wrappers with its
    /// configured default until the server's first wrapper fixes the version.
    pub fn open(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        match self.config.role {
            Role::Server => {
                let newest = self
                    .negotiator
                    .supported()
                    .last()
                    .copied()
                    .unwrap_or_else(|| self.negotiator.default_version());
                let probe = self
                    .codec
                    .registry()
                    .schema(newest)
                    .map(|s| s.capabilities().supported_versions_probe)
                    .unwrap_or(false);
                if probe {
                    let version = self.negotiator.begin_probe()?;
                    info!("Session {} probing peer with v{}", self.id, version);
                    self.send(MessageBody::GetSupportedVersions)?;
                } else {
                    let version = self.negotiator.assume(newest)?;
                    info!("Session {} assumed v{}", self.id, version);
                }
            }
            Role::Device => {
                let version = self
                    .negotiator
                    .assume_provisionally(self.negotiator.default_version())?;
                info!("Session {} assumed v{} pending the server's version", self.id, version);
            }
        }
        Ok(())
    }

    /// Queue a message body for the current version with its default
    /// cluster and queue mode. Returns `true` if a pending entry was replaced.
    pub fn send(&mut self, body: MessageBody) -> Result<bool, SessionError> {
        self.ensure_open()?;
        let version = self.negotiator.version_for_encode()?;
        let message = Message::for_version(version, body)?;
        Ok(self.admit(message, None))
    }

    /// Queue a prepared message with an explicit mode and identity key
    pub fn enqueue(&mut self, message: Message, mode: QueueMode, key: &str) -> Result<bool, SessionError> {
        self.ensure_open()?;
        let version = self.negotiator.version_for_encode()?;
        if !message.id.versions().contains(version) {
            return Err(ValidationError::MessageNotInVersion {
                operation: message.operation(),
                version,
            }
            .into());
        }
        Ok(self.admit(message, Some((mode, key))))
    }

    fn admit(&mut self, message: Message, policy: Option<(QueueMode, &str)>) -> bool {
        let replaced = match policy {
            Some((mode, key)) => self.queue.enqueue(message, mode, key),
            None => self.queue.push(message),
        };
        if replaced {
            self.stats.queue_replacements += 1;
        }
        self.local_done = false;
        replaced
    }

    /// Ask the device for the configured number of cells from a FIFO
    pub fn request_telemetry(&mut self, fifo: u8) -> Result<bool, SessionError> {
        self.send(MessageBody::GetData(DataRequest {
            max_cells: self.config.default_cell_count,
            fifo,
            ..DataRequest::default()
        }))
    }

    /// Build the next outbound wrapper.
    ///
    /// The server sends at most one message, the device everything queued
    /// (up to the configured cap). An empty queue yields NoFurtherMessages.
    pub fn next_outbound(&mut self) -> Result<Bytes, SessionError> {
        self.ensure_open()?;
        let version = self.negotiator.version_for_encode()?;

        let limit = match self.config.role {
            Role::Server => Some(1),
            Role::Device => self.config.max_messages_per_wrapper,
        };
        let mut popped = Vec::new();
        while limit.map_or(true, |l| popped.len() < l) {
            let Some(mut entry) = self.queue.pop_next() else {
                break;
            };
            match retarget(entry.message, version) {
                Ok(message) => {
                    entry.message = message;
                    popped.push(entry);
                }
                Err(e) => {
                    warn!("Session {} discarded a message with no v{} form: {}", self.id, version, e);
                    self.queue.restore(popped);
                    return Err(e.into());
                }
            }
        }
        let mut messages: Vec<Message> = popped.into_iter().map(|entry| entry.message).collect();
        if let Some(request) = messages.iter().rev().find_map(|m| match &m.body {
            MessageBody::GetData(request) => Some(request),
            _ => None,
        }) {
            self.data_flags = request.flags;
        }
        if messages.is_empty() {
            messages.push(Message::for_version(version, MessageBody::NoFurtherMessages)?);
        }
        let done = messages
            .iter()
            .all(|m| m.body == MessageBody::NoFurtherMessages);

        let mut wrapper = Wrapper::new(version, messages);
        if self.config.role == Role::Device {
            wrapper.device_version = self.config.device_version.clone();
            if let Some(identity) = &self.config.identity {
                wrapper.identity = Some(identity.clone());
                wrapper.timestamp = Some(unix_now());
            }
        }

        let bytes = self.codec.encode_outbound(&wrapper, self.outbound_direction())?;
        self.stats.wrappers_out += 1;
        self.stats.messages_out += wrapper.messages.len() as u64;
        self.local_done = done;
        debug!(
            "Session {} sent v{} wrapper with {} messages ({} still queued)",
            self.id,
            version,
            wrapper.messages.len(),
            self.queue.len()
        );
        Ok(bytes)
    }

    /// Process an inbound wrapper.
    ///
    /// A malformed wrapper is counted, logged and returned as
    /// [`SessionError::Parse`]; the session stays usable.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<Vec<SessionEvent>, SessionError> {
        self.ensure_open()?;
        let wrapper = match self.codec.decode_inbound(bytes, self.inbound_direction()) {
            Ok(wrapper) => wrapper,
            Err(e) => {
                self.stats.wrappers_dropped += 1;
                warn!("Session {} dropped inbound wrapper: {}", self.id, e);
                return Err(e.into());
            }
        };
        self.stats.wrappers_in += 1;
        self.stats.messages_in += wrapper.messages.len() as u64;

        let mut events = Vec::new();
        let was_established = self.negotiator.established().is_some();
        let probe_reply = wrapper.messages.iter().find_map(|m| match &m.body {
            MessageBody::SendSupportedVersions { versions } => Some(versions.as_slice()),
            _ => None,
        });
        let version = match (self.config.role, self.negotiator.state(), probe_reply) {
            (Role::Server, NegotiationState::Negotiating { .. }, Some(versions)) => {
                self.negotiator.on_probe_reply(versions)?
            }
            _ => self.negotiator.on_peer_version(wrapper.protocol_version)?,
        };
        if !was_established {
            info!("Session {} established protocol v{}", self.id, version);
            events.push(SessionEvent::Established(version));
        }

        self.peer_done = wrapper
            .messages
            .iter()
            .all(|m| m.body == MessageBody::NoFurtherMessages);

        for message in wrapper.messages {
            self.dispatch(version, message, &mut events);
            if self.is_closed() {
                return Ok(events);
            }
        }
        if self.peer_done {
            events.push(SessionEvent::PeerFinished);
        }
        Ok(events)
    }

    fn dispatch(&mut self, version: ProtocolVersion, message: Message, events: &mut Vec<SessionEvent>) {
        match message.body {
            MessageBody::NoFurtherMessages => {}
            MessageBody::CloseConnection => {
                self.close(CloseReason::PeerClosed);
                events.push(SessionEvent::Closed(CloseReason::PeerClosed));
            }
            MessageBody::NotAuthenticated => {
                self.close(CloseReason::NotAuthenticated);
                events.push(SessionEvent::Closed(CloseReason::NotAuthenticated));
            }
            _ => match self.config.role {
                Role::Device => self.handle_request(version, message, events),
                Role::Server => self.handle_report(message, events),
            },
        }
    }

    fn handle_report(&mut self, message: Message, events: &mut Vec<SessionEvent>) {
        match message.body {
            MessageBody::SendSupportedVersions { versions } => {
                debug!("Session {} peer supports {:?}", self.id, versions);
            }
            MessageBody::SendData(DataResponse::Sdb { fifo, cells }) => {
                let mut decoder = CellDecoder::new(self.data_flags);
                let decoded = cells
                    .iter()
                    .map(|cell| decoder.decode(cell))
                    .collect::<Result<Vec<_>, _>>();
                match &decoded {
                    Ok(cells) => self.stats.cells_received += cells.len() as u64,
                    Err(e) => warn!("Session {} aborted telemetry exchange: {}", self.id, e),
                }
                events.push(SessionEvent::Telemetry { fifo, cells: decoded });
            }
            body => events.push(SessionEvent::Message(Message { body, ..message })),
        }
    }

    fn handle_request(&mut self, version: ProtocolVersion, message: Message, events: &mut Vec<SessionEvent>) {
        let files = self.collaborators.files.clone();
        let response = match &message.body {
            MessageBody::GetSupportedVersions => Some(MessageBody::SendSupportedVersions {
                versions: self.negotiator.supported().to_vec(),
            }),
            MessageBody::GetData(request) => match self.telemetry_response(request) {
                Ok(body) => Some(body),
                Err(e) => {
                    warn!("Session {} could not serve GetData, answering empty: {}", self.id, e);
                    Some(empty_telemetry(request))
                }
            },
            MessageBody::GetLatestReadings => {
                let latest = match &self.collaborators.streams {
                    Some(streams) => streams.latest_readings().unwrap_or_else(|e| {
                        warn!("Session {} could not read latest readings: {}", self.id, e);
                        Value::Array(Vec::new())
                    }),
                    None => Value::Array(Vec::new()),
                };
                let mut report = Opaque::new();
                if let Ok(key) = self.codec.registry().schema(version).and_then(|s| s.key(Field::Data)) {
                    report.insert(key.to_string(), latest);
                }
                Some(MessageBody::SendLatestReadings(report))
            }
            MessageBody::GetDir { path } => Some(MessageBody::SendDir(list_dir(files.as_deref(), path))),
            MessageBody::GetFile { path } => Some(MessageBody::SendFile(read_file(files.as_deref(), path))),
            MessageBody::ExecuteFilesystemOperation(op) => Some(MessageBody::SendFilesystemOperationResult(
                apply_filesystem_operation(files.as_deref(), op),
            )),
            MessageBody::ExecuteDeviceManagementOperation(op) => {
                let outcome = match self.collaborators.devices.apply_device_operation(&message.body) {
                    OperationResult::Completed(outcome) => outcome,
                    OperationResult::Accepted | OperationResult::Report(_) => OperationOutcome {
                        result: i64::from(UNSUPPORTED),
                        operation: Some(op.kind.code()),
                        details: None,
                        error: Some(format!("{:?} was not carried out", op.kind)),
                    },
                };
                Some(MessageBody::SendDeviceManagementResult(outcome))
            }
            body => match report_for(body) {
                Some(respond) => {
                    let result = self.collaborators.devices.apply_device_operation(body);
                    Some(respond(into_report(result)))
                }
                None if is_device_request(body) => {
                    self.collaborators.devices.apply_device_operation(body);
                    None
                }
                None => {
                    warn!("Session {} got unexpected {} as device", self.id, message.id.as_str());
                    events.push(SessionEvent::Unhandled(message.clone()));
                    None
                }
            },
        };

        if let Some(body) = response {
            match Message::for_version(version, body) {
                Ok(reply) => {
                    self.admit(reply, None);
                }
                Err(e) => {
                    warn!("Session {} cannot answer {}: {}", self.id, message.id.as_str(), e);
                    events.push(SessionEvent::Unhandled(message));
                }
            }
        }
    }

    /// Run one telemetry exchange with a fresh codec state
    fn telemetry_response(&mut self, request: &DataRequest) -> Result<MessageBody, StorageError> {
        let Some(streams) = self.collaborators.streams.clone() else {
            return Ok(empty_telemetry(request));
        };
        if request.source == DataSource::LatestReadings {
            return Ok(MessageBody::SendData(DataResponse::LatestReadings(
                streams.latest_readings()?,
            )));
        }

        let batch = streams.get_telemetry_batch(request.fifo, request.max_cells as usize)?;
        self.encoder = CellEncoder::new(request.flags);
        let cells: Vec<_> = batch.iter().map(|cell| self.encoder.encode(cell)).collect();
        self.stats.cells_sent += cells.len() as u64;
        debug!(
            "Session {} encoded {} cells from fifo {}",
            self.id,
            cells.len(),
            request.fifo
        );
        Ok(MessageBody::SendData(DataResponse::Sdb {
            fifo: request.fifo,
            cells,
        }))
    }

    /// Close the session, discarding queued messages and codec state
    pub fn close(&mut self, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        info!(
            "Session {} closed ({:?}), discarding {} queued messages",
            self.id,
            reason,
            self.queue.len()
        );
        self.negotiator.close();
        self.queue.clear();
        self.encoder.reset();
    }

    /// The transport went away
    pub fn disconnected(&mut self) {
        self.close(CloseReason::Disconnected);
    }
}

/// Reply to a GetData the stream database could not serve
fn empty_telemetry(request: &DataRequest) -> MessageBody {
    match request.source {
        DataSource::Sdb => MessageBody::SendData(DataResponse::Sdb {
            fifo: request.fifo,
            cells: Vec::new(),
        }),
        DataSource::LatestReadings => MessageBody::SendData(DataResponse::LatestReadings(Value::Array(Vec::new()))),
    }
}

/// Re-select the id of a message queued before negotiation finished
fn retarget(message: Message, version: ProtocolVersion) -> Result<Message, ValidationError> {
    if message.id.versions().contains(version) {
        return Ok(message);
    }
    let cluster = message.cluster;
    Ok(Message::for_version(version, message.body)?.with_cluster(cluster))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Report message answering a request, for requests answered with a report
fn report_for(request: &MessageBody) -> Option<fn(Opaque) -> MessageBody> {
    match request {
        MessageBody::GetStatus => Some(MessageBody::SendStatus),
        MessageBody::GetErrors => Some(MessageBody::SendErrors),
        MessageBody::GetOptions | MessageBody::SetOptions { .. } => Some(MessageBody::SendOptions),
        MessageBody::GetUpdateStatus(_) => Some(MessageBody::SendUpdateStatus),
        MessageBody::GetTerminalOutput { .. } => Some(MessageBody::SendTerminalOutput),
        MessageBody::GetDeviceList { .. } => Some(MessageBody::SendDeviceList),
        _ => None,
    }
}

/// Server requests handled by the device manager without a reply
fn is_device_request(request: &MessageBody) -> bool {
    matches!(
        request,
        MessageBody::Restart
            | MessageBody::SendUpdateToken { .. }
            | MessageBody::ExecuteTerminalCommand { .. }
            | MessageBody::RequestDeviceToLeave { .. }
            | MessageBody::LocateDevice { .. }
            | MessageBody::PermitJoining { .. }
            | MessageBody::GetAvailableData
            | MessageBody::GetWaveform(_)
            | MessageBody::BroadcastDispatch { .. }
            | MessageBody::SwitchState { .. }
            | MessageBody::ReadAttributes { .. }
            | MessageBody::WriteAttributes { .. }
    )
}

fn into_report(result: OperationResult) -> Opaque {
    match result {
        OperationResult::Report(report) => report,
        OperationResult::Accepted | OperationResult::Completed(_) => Opaque::new(),
    }
}

/// ENOSYS, for requests this device has no backend for
fn unsupported() -> StorageError {
    StorageError::Io(std::io::Error::from_raw_os_error(UNSUPPORTED))
}

fn list_dir(files: Option<&dyn Filesystem>, path: &str) -> DirListing {
    match files.ok_or_else(unsupported).and_then(|fs| fs.list_dir(path)) {
        Ok(entries) => DirListing {
            path: path.to_string(),
            entries,
            ..DirListing::default()
        },
        Err(e) => DirListing {
            path: path.to_string(),
            entries: Vec::new(),
            error: Some(e.to_string()),
            code: Some(e.code()),
        },
    }
}

fn read_file(files: Option<&dyn Filesystem>, path: &str) -> FileTransfer {
    match files.ok_or_else(unsupported).and_then(|fs| fs.read_file(path)) {
        Ok(contents) => FileTransfer {
            path: path.to_string(),
            details: Some(DirEntry {
                name: Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size: Some(contents.len() as u64),
                is_directory: false,
            }),
            contents: Some(contents),
            ..FileTransfer::default()
        },
        Err(e) => FileTransfer {
            path: path.to_string(),
            error: Some(e.to_string()),
            code: Some(e.code()),
            ..FileTransfer::default()
        },
    }
}

fn apply_filesystem_operation(files: Option<&dyn Filesystem>, op: &FilesystemOperation) -> OperationOutcome {
    let result = files.ok_or_else(unsupported).and_then(|fs| match op {
        FilesystemOperation::MakeDir { path, make_parents } => fs.make_dir(path, *make_parents),
        FilesystemOperation::Remove {
            path,
            recursive,
            force,
        } => fs.remove(path, *recursive, *force),
        FilesystemOperation::MakeFile {
            path,
            overwrite,
            make_parents,
        } => fs.make_file(path, *overwrite, *make_parents),
        FilesystemOperation::WriteFile { path, append, data } => fs.write_file(path, data, *append),
        FilesystemOperation::WriteFileFromRemote => Err(unsupported()),
    });
    match result {
        Ok(()) => OperationOutcome {
            result: 0,
            operation: Some(op.code()),
            details: Some("Ok".to_string()),
            error: None,
        },
        Err(e) => OperationOutcome {
            result: e.code(),
            operation: Some(op.code()),
            details: None,
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::DeviceManager;
    use esbox_storage::{LocalFilesystem, MemoryStreamDb, StreamDatabase};
    use esbox_wire::{
        AttributeData, AttributeValue, Cluster, DeviceOperation, DeviceOperationKind, DeviceOperationParams,
        EncodedCell, Identity,
    };
    use std::sync::Mutex;

    fn registry() -> Arc<VersionRegistry> {
        Arc::new(VersionRegistry::standard())
    }

    fn identity() -> Identity {
        Identity {
            address: "001BC502B0000000".to_string(),
            link_key: "5A6967426565416C6C69616E63653039".to_string(),
        }
    }

    fn cell(time: i64, value: u64) -> TelemetryCell {
        TelemetryCell {
            device: "001BC502B0100314".to_string(),
            endpoint: 10,
            cluster: Cluster::new(0, 1794),
            time,
            attributes: vec![AttributeValue {
                attribute_id: 0,
                value: AttributeData::Uint(value),
            }],
        }
    }

    fn server() -> Session {
        Session::new(EngineConfig::server(), registry(), Collaborators::none())
    }

    fn device(collaborators: Collaborators) -> Session {
        Session::new(EngineConfig::device(identity()), registry(), collaborators)
    }

    /// Deliver one wrapper from `from` to `to`
    fn deliver(from: &mut Session, to: &mut Session) -> Vec<SessionEvent> {
        let bytes = from.next_outbound().unwrap();
        to.receive(&bytes).unwrap()
    }

    fn negotiated_pair(collaborators: Collaborators) -> (Session, Session) {
        let mut server = server();
        let mut device = device(collaborators);
        server.open().unwrap();
        deliver(&mut server, &mut device);
        deliver(&mut device, &mut server);
        (server, device)
    }

    #[derive(Default)]
    struct RecordingDevices {
        requests: Mutex<Vec<MessageBody>>,
    }

    impl DeviceManager for RecordingDevices {
        fn apply_device_operation(&self, request: &MessageBody) -> OperationResult {
            self.requests.lock().unwrap().push(request.clone());
            match request {
                MessageBody::GetStatus => {
                    let mut report = Opaque::new();
                    report.insert("Status_1_1".to_string(), Value::from(0));
                    OperationResult::Report(report)
                }
                MessageBody::ExecuteDeviceManagementOperation(op) => OperationResult::Completed(OperationOutcome {
                    result: 5,
                    operation: Some(op.kind.code()),
                    details: Some("busy".to_string()),
                    error: Some("Error".to_string()),
                }),
                _ => OperationResult::Accepted,
            }
        }
    }

    struct AcceptingDevices;

    impl DeviceManager for AcceptingDevices {
        fn apply_device_operation(&self, _request: &MessageBody) -> OperationResult {
            OperationResult::Accepted
        }
    }

    struct OfflineStreams;

    impl StreamDatabase for OfflineStreams {
        fn get_telemetry_batch(&self, _fifo: u8, _max_cells: usize) -> Result<Vec<TelemetryCell>, StorageError> {
            Err(StorageError::Invalid("stream database offline".to_string()))
        }

        fn latest_readings(&self) -> Result<Value, StorageError> {
            Err(StorageError::Invalid("stream database offline".to_string()))
        }
    }

    #[test]
    fn test_probe_establishes_newest_version() {
        let mut server = server();
        let mut device = device(Collaborators::none());
        server.open().unwrap();
        assert_eq!(
            server.state(),
            NegotiationState::Negotiating {
                assumed: ProtocolVersion::V1_1
            }
        );

        let events = deliver(&mut server, &mut device);
        assert_eq!(events, vec![SessionEvent::Established(ProtocolVersion::V1_1)]);
        assert_eq!(device.pending(), 1);

        let events = deliver(&mut device, &mut server);
        assert_eq!(events, vec![SessionEvent::Established(ProtocolVersion::V1_1)]);
        assert_eq!(server.version(), Some(ProtocolVersion::V1_1));
    }

    #[test]
    fn test_unsupported_peer_version_uses_default() {
        let mut device = device(Collaborators::none());
        let bytes = br#"{"ProtocolVersion_1_1": "2.0", "Messages_1_1": [
            {"MsgID_1_1": "NoFurtherMessages_1_1"}
        ]}"#;
        let events = device.receive(bytes).unwrap();
        assert_eq!(
            events,
            vec![
                SessionEvent::Established(ProtocolVersion::V1_0),
                SessionEvent::PeerFinished
            ]
        );

        let reply: Value = serde_json::from_slice(&device.next_outbound().unwrap()).unwrap();
        assert_eq!(reply["ProtocolVersion"], "1.0");
        assert_eq!(reply["Messages"][0]["MsgID"], "NoFurtherMessages");
    }

    #[test]
    fn test_encode_before_negotiation_fails() {
        let mut device = device(Collaborators::none());
        assert!(matches!(
            device.next_outbound(),
            Err(SessionError::Protocol(ProtocolError::NotNegotiated))
        ));
        assert!(matches!(
            device.send(MessageBody::GetErrors),
            Err(SessionError::Protocol(ProtocolError::NotNegotiated))
        ));
    }

    #[test]
    fn test_telemetry_exchange() {
        let streams = Arc::new(MemoryStreamDb::default());
        let cells = vec![cell(100, 1), cell(100, 2), cell(105, 3)];
        streams.extend(cells.clone());

        let (mut server, mut device) = negotiated_pair(Collaborators::none().with_streams(streams.clone()));
        server.request_telemetry(0).unwrap();
        deliver(&mut server, &mut device);
        let events = deliver(&mut device, &mut server);

        assert_eq!(
            events,
            vec![SessionEvent::Telemetry {
                fifo: 0,
                cells: Ok(cells)
            }]
        );
        assert_eq!(device.stats().cells_sent, 3);
        assert_eq!(server.stats().cells_received, 3);
        assert_eq!(streams.pending(0).unwrap(), 0);
    }

    #[test]
    fn test_telemetry_without_suppression() {
        let streams = Arc::new(MemoryStreamDb::default());
        let cells = vec![cell(100, 1), cell(160, 2)];
        streams.extend(cells.clone());

        let (mut server, mut device) = negotiated_pair(Collaborators::none().with_streams(streams));
        server
            .send(MessageBody::GetData(DataRequest {
                fifo: 1,
                flags: DeltaFlags::empty(),
                ..DataRequest::default()
            }))
            .unwrap();
        deliver(&mut server, &mut device);
        let events = deliver(&mut device, &mut server);
        assert_eq!(
            events,
            vec![SessionEvent::Telemetry {
                fifo: 1,
                cells: Ok(cells)
            }]
        );
    }

    #[test]
    fn test_codec_error_does_not_end_session() {
        let (mut server, mut device) = negotiated_pair(Collaborators::none());
        let broken = EncodedCell {
            endpoint: Some(10),
            ..EncodedCell::default()
        };
        device
            .send(MessageBody::SendData(DataResponse::Sdb {
                fifo: 0,
                cells: vec![broken],
            }))
            .unwrap();
        let events = deliver(&mut device, &mut server);
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::Telemetry { cells: Err(CodecError::MissingBaseline(_)), .. }]
        ));
        assert!(!server.is_closed());
        assert!(server.next_outbound().is_ok());
    }

    #[test]
    fn test_server_sends_one_message_per_wrapper() {
        let (mut server, mut device) = negotiated_pair(Collaborators::none());
        server.send(MessageBody::GetErrors).unwrap();
        server.send(MessageBody::GetStatus).unwrap();
        assert_eq!(server.pending(), 2);

        deliver(&mut server, &mut device);
        assert_eq!(server.pending(), 1);
        deliver(&mut server, &mut device);
        assert_eq!(server.pending(), 0);
        assert_eq!(device.pending(), 2);

        let bytes = device.next_outbound().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["Messages_1_1"].as_array().unwrap().len(), 2);
        assert_eq!(value["Auth"][0], "001BC502B0000000");
        assert!(value["Time_1_1"].is_i64());
    }

    #[test]
    fn test_device_message_cap() {
        let mut config = EngineConfig::device(identity());
        config.max_messages_per_wrapper = Some(1);
        let mut device = Session::new(config, registry(), Collaborators::none());
        device.open().unwrap();
        device.send(MessageBody::DispatchReport { device: "A".into() }).unwrap();
        device.send(MessageBody::DispatchReport { device: "B".into() }).unwrap();

        device.next_outbound().unwrap();
        assert_eq!(device.pending(), 1);
    }

    #[test]
    fn test_exchange_completion() {
        let (mut server, mut device) = negotiated_pair(Collaborators::none());
        assert!(!server.is_exchange_complete());

        let events = deliver(&mut server, &mut device);
        assert_eq!(events, vec![SessionEvent::PeerFinished]);
        let events = deliver(&mut device, &mut server);
        assert_eq!(events, vec![SessionEvent::PeerFinished]);
        assert!(server.is_exchange_complete());
        assert!(device.is_exchange_complete());
    }

    #[test]
    fn test_close_connection_closes_device() {
        let (mut server, mut device) = negotiated_pair(Collaborators::none());
        device.send(MessageBody::SendErrors(Opaque::new())).unwrap();

        server.send(MessageBody::CloseConnection).unwrap();
        let events = deliver(&mut server, &mut device);
        assert_eq!(events, vec![SessionEvent::Closed(CloseReason::PeerClosed)]);
        assert!(device.is_closed());
        assert_eq!(device.pending(), 0);
        assert!(matches!(
            device.next_outbound(),
            Err(SessionError::Protocol(ProtocolError::Closed))
        ));
        assert!(matches!(
            device.receive(b"{}"),
            Err(SessionError::Protocol(ProtocolError::Closed))
        ));
    }

    #[test]
    fn test_malformed_wrapper_is_dropped() {
        let (mut server, _device) = negotiated_pair(Collaborators::none());
        assert!(matches!(server.receive(b"not json"), Err(SessionError::Parse(_))));
        assert!(matches!(
            server.receive(br#"{"Messages": []}"#),
            Err(SessionError::Parse(_))
        ));
        assert_eq!(server.stats().wrappers_dropped, 2);
        assert!(!server.is_closed());
        assert!(server.next_outbound().is_ok());
    }

    #[test]
    fn test_device_answers_single_requests_once() {
        let (_server, mut device) = negotiated_pair(Collaborators::none());
        let bytes = br#"{"ProtocolVersion_1_1": "1.1", "Messages_1_1": [
            {"MsgID_1_1": "GetSupportedVersions_1_1"}
        ]}"#;
        device.receive(bytes).unwrap();
        device.receive(bytes).unwrap();
        assert_eq!(device.pending(), 1);
        assert_eq!(device.stats().queue_replacements, 1);
    }

    #[test]
    fn test_filesystem_requests() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(LocalFilesystem::new(dir.path()).unwrap());
        let (mut server, mut device) = negotiated_pair(Collaborators::none().with_files(files));

        server
            .send(MessageBody::ExecuteFilesystemOperation(FilesystemOperation::WriteFile {
                path: "/logs/today.txt".into(),
                append: false,
                data: b"hello".to_vec(),
            }))
            .unwrap();
        deliver(&mut server, &mut device);
        let events = deliver(&mut device, &mut server);
        match &events[..] {
            [SessionEvent::Message(Message {
                body: MessageBody::SendFilesystemOperationResult(outcome),
                ..
            })] => {
                assert_eq!(outcome.result, 2);
                assert!(outcome.error.is_some());
            }
            other => panic!("unexpected events {:?}", other),
        }

        server
            .send(MessageBody::ExecuteFilesystemOperation(FilesystemOperation::MakeFile {
                path: "/logs/today.txt".into(),
                overwrite: false,
                make_parents: true,
            }))
            .unwrap();
        deliver(&mut server, &mut device);
        deliver(&mut device, &mut server);

        server
            .send(MessageBody::GetDir {
                path: "/logs".into(),
            })
            .unwrap();
        deliver(&mut server, &mut device);
        let events = deliver(&mut device, &mut server);
        match &events[..] {
            [SessionEvent::Message(Message {
                body: MessageBody::SendDir(listing),
                ..
            })] => {
                assert_eq!(listing.entries.len(), 1);
                assert_eq!(listing.entries[0].name, "today.txt");
                assert_eq!(listing.error, None);
            }
            other => panic!("unexpected events {:?}", other),
        }

        server
            .send(MessageBody::GetFile {
                path: "/missing".into(),
            })
            .unwrap();
        deliver(&mut server, &mut device);
        let events = deliver(&mut device, &mut server);
        match &events[..] {
            [SessionEvent::Message(Message {
                body: MessageBody::SendFile(file),
                ..
            })] => {
                assert_eq!(file.code, Some(2));
                assert_eq!(file.contents, None);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_filesystem_request_without_backend() {
        let (mut server, mut device) = negotiated_pair(Collaborators::none());
        server.send(MessageBody::GetDir { path: "/".into() }).unwrap();
        deliver(&mut server, &mut device);
        let events = deliver(&mut device, &mut server);
        match &events[..] {
            [SessionEvent::Message(Message {
                body: MessageBody::SendDir(listing),
                ..
            })] => {
                assert_eq!(listing.code, Some(38));
                assert!(listing.entries.is_empty());
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_device_operations_reach_manager() {
        let devices = Arc::new(RecordingDevices::default());
        let (mut server, mut device) = negotiated_pair(Collaborators::none().with_devices(devices.clone()));

        server
            .send(MessageBody::ExecuteDeviceManagementOperation(DeviceOperation {
                kind: DeviceOperationKind::ScanDeviceList,
                params: DeviceOperationParams::default(),
            }))
            .unwrap();
        deliver(&mut server, &mut device);
        let events = deliver(&mut device, &mut server);
        match &events[..] {
            [SessionEvent::Message(Message {
                body: MessageBody::SendDeviceManagementResult(outcome),
                ..
            })] => assert_eq!(outcome.result, 5),
            other => panic!("unexpected events {:?}", other),
        }

        server.send(MessageBody::GetStatus).unwrap();
        deliver(&mut server, &mut device);
        let events = deliver(&mut device, &mut server);
        match &events[..] {
            [SessionEvent::Message(Message {
                body: MessageBody::SendStatus(report),
                ..
            })] => assert_eq!(report["Status_1_1"], 0),
            other => panic!("unexpected events {:?}", other),
        }

        server
            .send(MessageBody::SwitchState {
                device: "001BC502B0000000".into(),
                endpoint: 10,
                action: Value::from(1),
            })
            .unwrap();
        deliver(&mut server, &mut device);
        assert_eq!(device.pending(), 0);
        assert_eq!(devices.requests.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_opened_device_adopts_server_version() {
        let mut server = server();
        let mut device = device(Collaborators::none());
        device.open().unwrap();
        assert_eq!(
            device.state(),
            NegotiationState::Negotiating {
                assumed: ProtocolVersion::V1_0
            }
        );

        server.open().unwrap();
        let events = deliver(&mut server, &mut device);
        assert_eq!(events, vec![SessionEvent::Established(ProtocolVersion::V1_1)]);
        assert_eq!(device.version(), Some(ProtocolVersion::V1_1));
        assert_eq!(device.pending(), 1);

        let bytes = device.next_outbound().unwrap();
        let reply: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply["ProtocolVersion_1_1"], "1.1");
        assert_eq!(reply["Messages_1_1"][0]["MsgID_1_1"], "SendSupportedVersions_1_1");

        let events = server.receive(&bytes).unwrap();
        assert_eq!(events, vec![SessionEvent::Established(ProtocolVersion::V1_1)]);
    }

    #[test]
    fn test_opened_device_frames_with_default_first() {
        let mut server = server();
        let mut device = device(Collaborators::none());
        device.open().unwrap();
        device.send(MessageBody::DispatchReport { device: "A".into() }).unwrap();

        let events = deliver(&mut device, &mut server);
        assert_eq!(events[0], SessionEvent::Established(ProtocolVersion::V1_0));
        assert_eq!(server.version(), Some(ProtocolVersion::V1_0));
    }

    #[test]
    fn test_baseline_device_drops_newer_requests() {
        let streams = Arc::new(MemoryStreamDb::default());
        let cells = vec![cell(100, 1), cell(105, 2)];
        streams.extend(cells.clone());
        let mut config = EngineConfig::device(identity());
        config.supported_versions = vec![ProtocolVersion::V1_0];
        let mut device = Session::new(config, registry(), Collaborators::none().with_streams(streams));

        let mut server = server();
        server.open().unwrap();
        server.send(MessageBody::GetStatus).unwrap();
        server.request_telemetry(0).unwrap();

        let events = deliver(&mut server, &mut device);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], SessionEvent::Established(ProtocolVersion::V1_0));
        assert!(matches!(
            &events[1],
            SessionEvent::Unhandled(Message {
                body: MessageBody::GetSupportedVersions,
                ..
            })
        ));
        assert_eq!(device.pending(), 0);

        let events = deliver(&mut device, &mut server);
        assert_eq!(
            events,
            vec![
                SessionEvent::Established(ProtocolVersion::V1_0),
                SessionEvent::PeerFinished
            ]
        );
        assert_eq!(server.pending(), 2);

        assert!(matches!(
            server.next_outbound(),
            Err(SessionError::Validation(ValidationError::MessageNotInVersion { .. }))
        ));
        assert_eq!(server.pending(), 1);

        let bytes = server.next_outbound().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["ProtocolVersion"], "1.0");
        assert_eq!(value["Messages"][0]["MsgID"], "GetData");

        device.receive(&bytes).unwrap();
        let events = deliver(&mut device, &mut server);
        assert_eq!(
            events,
            vec![SessionEvent::Telemetry {
                fifo: 0,
                cells: Ok(cells)
            }]
        );
    }

    #[test]
    fn test_unencodable_message_keeps_rest_of_queue() {
        let mut config = EngineConfig::device(identity());
        config.default_version = ProtocolVersion::V1_1;
        let mut device = Session::new(config, registry(), Collaborators::none());
        device.open().unwrap();
        device.send(MessageBody::DispatchReport { device: "A".into() }).unwrap();
        device.send(MessageBody::SendStatus(Opaque::new())).unwrap();
        assert_eq!(device.pending(), 2);

        let events = device
            .receive(br#"{"ProtocolVersion": "1.0", "Messages": [{"MsgID": "NoFurtherMessages"}]}"#)
            .unwrap();
        assert_eq!(events[0], SessionEvent::Established(ProtocolVersion::V1_0));

        assert!(matches!(
            device.next_outbound(),
            Err(SessionError::Validation(ValidationError::MessageNotInVersion { .. }))
        ));
        assert_eq!(device.pending(), 1);

        let value: Value = serde_json::from_slice(&device.next_outbound().unwrap()).unwrap();
        assert_eq!(value["Messages"].as_array().unwrap().len(), 1);
        assert_eq!(value["Messages"][0]["MsgID"], "DispatchReport");
        assert_eq!(device.pending(), 0);
    }

    #[test]
    fn test_unperformed_device_operation_reports_unsupported() {
        let (mut server, mut device) = negotiated_pair(Collaborators::none().with_devices(Arc::new(AcceptingDevices)));
        server
            .send(MessageBody::ExecuteDeviceManagementOperation(DeviceOperation {
                kind: DeviceOperationKind::ScanDeviceList,
                params: DeviceOperationParams::default(),
            }))
            .unwrap();
        deliver(&mut server, &mut device);
        let events = deliver(&mut device, &mut server);
        match &events[..] {
            [SessionEvent::Message(Message {
                body: MessageBody::SendDeviceManagementResult(outcome),
                ..
            })] => {
                assert_eq!(outcome.result, 38);
                assert_eq!(outcome.operation, Some(DeviceOperationKind::ScanDeviceList.code()));
                assert!(outcome.error.is_some());
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_failed_telemetry_read_answers_empty() {
        let (mut server, mut device) = negotiated_pair(Collaborators::none().with_streams(Arc::new(OfflineStreams)));
        server.request_telemetry(2).unwrap();
        deliver(&mut server, &mut device);
        assert_eq!(device.pending(), 1);

        let events = deliver(&mut device, &mut server);
        assert_eq!(
            events,
            vec![SessionEvent::Telemetry {
                fifo: 2,
                cells: Ok(Vec::new())
            }]
        );
        assert_eq!(device.stats().cells_sent, 0);
    }

    #[test]
    fn test_unexpected_request_is_reported() {
        let (_server, mut device) = negotiated_pair(Collaborators::none());
        let bytes = br#"{"ProtocolVersion_1_1": "1.1", "Messages_1_1": [
            {"MsgID_1_1": "DispatchReport", "HAN_1_1": "001BC502B0100314"}
        ]}"#;
        let events = device.receive(bytes).unwrap();
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::Unhandled(Message {
                body: MessageBody::DispatchReport { .. },
                ..
            })]
        ));
        assert_eq!(device.pending(), 0);
    }
}
