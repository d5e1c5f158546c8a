//! A simulated positioning drive
//!
//! The drive runs as a tokio task attached to a [`SimBus`]. It implements just enough of a
//! CANopen node to exercise the master: an expedited SDO server over a flat object dictionary,
//! the PDO communication and mapping records (with the same restrictions on remapping a real
//! node enforces), SYNC gated and event driven PDOs, NMT, heartbeats and a tiny CiA 402 state
//! machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use canmotion_common::{
    constants::{object_ids, values},
    messages::{CanOpenMessage, EmergencyMessage, FunctionCode, Heartbeat, NmtCommandSpecifier},
    nmt::NmtState,
    pdo::{mapped_bits, PdoMapping, MAX_MAPPED_BITS, MAX_MAPPED_ENTRIES, PDO_CHANNELS},
    sdo::{AbortCode, SdoRequest, SdoResponse},
    traits::AsyncCanReceiver,
    CanMessage, ObjectSize, ObjectValue,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::sim_bus::{SimBus, SimBusReceiver, SimBusSender};

pub const CONTROLWORD: u16 = 0x6040;
pub const STATUSWORD: u16 = 0x6041;
pub const MODES_OF_OPERATION: u16 = 0x6060;
pub const POSITION_ACTUAL: u16 = 0x6064;
pub const VELOCITY_ACTUAL: u16 = 0x606C;
pub const TARGET_POSITION: u16 = 0x607A;
pub const PROFILE_VELOCITY: u16 = 0x6081;
pub const PROFILE_ACCELERATION: u16 = 0x6083;
pub const PROFILE_DECELERATION: u16 = 0x6084;
pub const TARGET_VELOCITY: u16 = 0x60FF;

const STATUS_SWITCH_ON_DISABLED: u16 = 0x0240;
const STATUS_READY_TO_SWITCH_ON: u16 = 0x0221;
const STATUS_SWITCHED_ON: u16 = 0x0233;
const STATUS_OPERATION_ENABLED: u16 = 0x0237;
const STATUS_TARGET_REACHED: u16 = 1 << 10;

/// Something the drive received or did, in order
#[derive(Clone, Debug, PartialEq)]
pub enum SimEvent {
    /// An SDO request arrived
    SdoRequest { index: u16, sub: u8 },
    /// An SDO response was sent
    SdoResponse { index: u16, sub: u8 },
    /// The client aborted an SDO transfer
    SdoAbort { index: u16, sub: u8, abort_code: u32 },
    /// A SYNC arrived
    Sync,
    /// A received PDO was written to the object dictionary
    RpdoApplied { channel: u8 },
}

#[derive(Clone, Copy, Debug)]
struct Object {
    value: ObjectValue,
    writable: bool,
}

struct Outgoing {
    msg: CanMessage,
    delay: Duration,
    event: Option<SimEvent>,
}

impl Outgoing {
    fn now(msg: CanMessage) -> Self {
        Self {
            msg,
            delay: Duration::ZERO,
            event: None,
        }
    }
}

struct DriveState {
    node_id: u8,
    nmt: NmtState,
    od: HashMap<(u16, u8), Object>,
    pending_sync: Vec<(u8, Vec<u8>)>,
    events: Vec<SimEvent>,
    silent: bool,
    sdo_delay: Duration,
    next_heartbeat: Option<Instant>,
}

fn rpdo_comm(channel: u8) -> u16 {
    object_ids::RPDO_COMM_BASE + (channel - 1) as u16
}

fn rpdo_map(channel: u8) -> u16 {
    object_ids::RPDO_MAP_BASE + (channel - 1) as u16
}

fn tpdo_comm(channel: u8) -> u16 {
    object_ids::TPDO_COMM_BASE + (channel - 1) as u16
}

fn tpdo_map(channel: u8) -> u16 {
    object_ids::TPDO_MAP_BASE + (channel - 1) as u16
}

fn is_sync_type(transmission_type: u8) -> bool {
    transmission_type <= 240
}

impl DriveState {
    fn new(node_id: u8) -> Self {
        let mut state = Self {
            node_id,
            nmt: NmtState::PreOperational,
            od: HashMap::new(),
            pending_sync: Vec::new(),
            events: Vec::new(),
            silent: false,
            sdo_delay: Duration::ZERO,
            next_heartbeat: None,
        };
        state.load_defaults();
        state
    }

    fn insert(&mut self, index: u16, sub: u8, value: ObjectValue, writable: bool) {
        self.od.insert((index, sub), Object { value, writable });
    }

    fn load_defaults(&mut self) {
        self.od.clear();
        self.insert(object_ids::ERROR_REGISTER, 0, 0u8.into(), false);
        self.insert(object_ids::HEARTBEAT_CONSUMER_TIME, 0, 1u8.into(), false);
        self.insert(object_ids::HEARTBEAT_CONSUMER_TIME, 1, 0u32.into(), true);
        self.insert(object_ids::HEARTBEAT_PRODUCER_TIME, 0, 0u16.into(), true);

        self.insert(CONTROLWORD, 0, 0u16.into(), true);
        self.insert(STATUSWORD, 0, STATUS_SWITCH_ON_DISABLED.into(), false);
        self.insert(MODES_OF_OPERATION, 0, 1i8.into(), true);
        self.insert(POSITION_ACTUAL, 0, 0i32.into(), false);
        self.insert(VELOCITY_ACTUAL, 0, 0i32.into(), false);
        self.insert(TARGET_POSITION, 0, 0i32.into(), true);
        self.insert(PROFILE_VELOCITY, 0, 1000u32.into(), true);
        self.insert(PROFILE_ACCELERATION, 0, 10000u32.into(), true);
        self.insert(PROFILE_DECELERATION, 0, 10000u32.into(), true);
        self.insert(TARGET_VELOCITY, 0, 0i32.into(), true);

        self.reset_communication();
    }

    fn reset_communication(&mut self) {
        self.pending_sync.clear();
        for ch in 1..=PDO_CHANNELS {
            let rx_cob = FunctionCode::Rpdo(ch).cob_id(self.node_id).raw();
            let tx_cob = FunctionCode::Tpdo(ch).cob_id(self.node_id).raw();
            self.insert(rpdo_comm(ch), 0, 2u8.into(), false);
            self.insert(rpdo_comm(ch), 1, (rx_cob | values::PDO_COB_ID_INVALID).into(), true);
            self.insert(rpdo_comm(ch), 2, 255u8.into(), true);
            self.insert(tpdo_comm(ch), 0, 3u8.into(), false);
            self.insert(tpdo_comm(ch), 1, (tx_cob | values::PDO_COB_ID_INVALID).into(), true);
            self.insert(tpdo_comm(ch), 2, 255u8.into(), true);
            self.insert(tpdo_comm(ch), 3, 0u16.into(), true);
            for map in [rpdo_map(ch), tpdo_map(ch)] {
                self.insert(map, 0, 0u8.into(), true);
                for sub in 1..=MAX_MAPPED_ENTRIES as u8 {
                    self.insert(map, sub, 0u32.into(), true);
                }
            }
        }
    }

    fn value(&self, index: u16, sub: u8) -> ObjectValue {
        self.od
            .get(&(index, sub))
            .map(|o| o.value)
            .unwrap_or(ObjectValue::from(0u8))
    }

    fn cob_valid(&self, comm: u16) -> bool {
        self.value(comm, 1).as_u32() & values::PDO_COB_ID_INVALID == 0
    }

    fn mapping(&self, map: u16) -> Vec<PdoMapping> {
        let count = self.value(map, 0).as_u8();
        (1..=count)
            .map(|sub| PdoMapping::from_object_value(self.value(map, sub).as_u32()))
            .collect()
    }

    fn check_mapping(&self, mappings: &[PdoMapping]) -> Result<(), AbortCode> {
        for m in mappings {
            let obj = self
                .od
                .get(&(m.index, m.sub))
                .ok_or(AbortCode::UnmappablePdo)?;
            if Some(obj.value.size()) != m.object_size() {
                return Err(AbortCode::UnmappablePdo);
            }
        }
        if mapped_bits(mappings) > MAX_MAPPED_BITS {
            return Err(AbortCode::PdoTooLong);
        }
        Ok(())
    }

    /// Enforce the CiA 301 rules for changing PDO parameters
    fn check_pdo_write(&self, index: u16, sub: u8, value: ObjectValue) -> Result<(), AbortCode> {
        let map_channel = match index {
            0x1600..=0x1603 => Some((index, rpdo_comm((index - 0x1600) as u8 + 1))),
            0x1A00..=0x1A03 => Some((index, tpdo_comm((index - 0x1A00) as u8 + 1))),
            _ => None,
        };
        if let Some((map, comm)) = map_channel {
            if sub == 0 {
                let count = value.as_u8();
                if count as usize > MAX_MAPPED_ENTRIES {
                    return Err(AbortCode::ValueTooHigh);
                }
                let mappings: Vec<PdoMapping> = (1..=count)
                    .map(|s| PdoMapping::from_object_value(self.value(map, s).as_u32()))
                    .collect();
                self.check_mapping(&mappings)?;
            } else if self.value(map, 0).as_u8() != 0 || self.cob_valid(comm) {
                return Err(AbortCode::IncompatibleParameter);
            }
        }
        if (0x1800..=0x1803).contains(&index)
            && sub == object_ids::PDO_COMM_INHIBIT_TIME_SUB
            && self.cob_valid(index)
        {
            return Err(AbortCode::IncompatibleParameter);
        }
        Ok(())
    }

    fn download(&mut self, index: u16, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        let Some(obj) = self.od.get(&(index, sub)).copied() else {
            if self.od.keys().any(|(i, _)| *i == index) {
                return Err(AbortCode::NoSuchSubIndex);
            }
            return Err(AbortCode::NoSuchObject);
        };
        if !obj.writable {
            return Err(AbortCode::ReadOnly);
        }
        let value = ObjectValue::from_le_bytes(data).map_err(|_| AbortCode::DataTypeMismatch)?;
        if value.size() != obj.value.size() {
            return Err(AbortCode::DataTypeMismatch);
        }
        self.check_pdo_write(index, sub, value)?;
        self.write_object(index, sub, value);
        Ok(())
    }

    /// Store a value and run the side effects of writing it
    fn write_object(&mut self, index: u16, sub: u8, value: ObjectValue) {
        self.set_object(index, sub, value);
        self.on_written(index, sub, value);
    }

    fn on_written(&mut self, index: u16, sub: u8, value: ObjectValue) {
        if (index, sub) == (CONTROLWORD, 0) {
            self.apply_controlword(value.as_u16());
        }
        if (index, sub) == (object_ids::HEARTBEAT_PRODUCER_TIME, 0) {
            self.next_heartbeat = match value.as_u16() {
                0 => None,
                ms => Some(Instant::now() + Duration::from_millis(ms as u64)),
            };
        }
    }

    fn apply_controlword(&mut self, cw: u16) {
        let status = self.value(STATUSWORD, 0).as_u16();
        let enabled = status & 0x6F == STATUS_OPERATION_ENABLED & 0x6F;
        let mut next = match cw & 0x8F {
            x if x & 0x80 != 0 => STATUS_SWITCH_ON_DISABLED,
            0x06 => STATUS_READY_TO_SWITCH_ON,
            0x07 => STATUS_SWITCHED_ON,
            0x0F => STATUS_OPERATION_ENABLED,
            _ => STATUS_SWITCH_ON_DISABLED,
        };
        // Profile position mode: a new set-point completes the move immediately
        if enabled && next == STATUS_OPERATION_ENABLED {
            next |= status & STATUS_TARGET_REACHED;
            if cw & 0x10 != 0 && self.value(MODES_OF_OPERATION, 0).as_i8() == 1 {
                let target = self.value(TARGET_POSITION, 0);
                self.set_object(POSITION_ACTUAL, 0, target);
                next |= STATUS_TARGET_REACHED;
            }
        }
        self.set_object(STATUSWORD, 0, next.into());
    }

    fn set_object(&mut self, index: u16, sub: u8, value: ObjectValue) {
        if let Some(obj) = self.od.get_mut(&(index, sub)) {
            obj.value = value;
        }
    }

    fn pdo_payload(&self, mappings: &[PdoMapping]) -> Vec<u8> {
        let mut payload = Vec::new();
        for m in mappings {
            let (bytes, len) = self.value(m.index, m.sub).to_le_bytes();
            payload.extend_from_slice(&bytes[..len]);
        }
        payload
    }

    fn apply_rpdo(&mut self, channel: u8, data: &[u8]) {
        let mappings = self.mapping(rpdo_map(channel));
        // The mapping may have grown since a SYNC-gated frame was buffered
        if data.len() < (mapped_bits(&mappings) / 8) as usize {
            log::warn!(
                "Node {}: dropping {} byte RxPDO{channel}, mapping needs more",
                self.node_id,
                data.len()
            );
            return;
        }
        let mut offset = 0;
        let mut written = Vec::new();
        for m in mappings {
            let len = m.object_size().map(|s| s.bytes()).unwrap_or(0);
            let Some(bytes) = data.get(offset..offset + len) else {
                break;
            };
            if let Ok(value) = ObjectValue::from_le_bytes(bytes) {
                self.set_object(m.index, m.sub, value);
                written.push((m.index, m.sub, value));
            }
            offset += len;
        }
        // All mapped objects are updated before any of them is acted on
        for (index, sub, value) in written {
            self.on_written(index, sub, value);
        }
        self.events.push(SimEvent::RpdoApplied { channel });
    }

    fn handle_rpdo(&mut self, channel: u8, data: &[u8]) {
        if self.nmt != NmtState::Operational || !self.cob_valid(rpdo_comm(channel)) {
            return;
        }
        let mappings = self.mapping(rpdo_map(channel));
        if mappings.is_empty() || data.len() < (mapped_bits(&mappings) / 8) as usize {
            return;
        }
        if is_sync_type(self.value(rpdo_comm(channel), 2).as_u8()) {
            self.pending_sync.push((channel, data.to_vec()));
        } else {
            self.apply_rpdo(channel, data);
        }
    }

    fn handle_sync(&mut self) -> Vec<Outgoing> {
        self.events.push(SimEvent::Sync);
        if self.nmt != NmtState::Operational {
            return Vec::new();
        }
        for (channel, data) in std::mem::take(&mut self.pending_sync) {
            self.apply_rpdo(channel, &data);
        }
        (1..=PDO_CHANNELS)
            .filter(|ch| {
                self.cob_valid(tpdo_comm(*ch))
                    && is_sync_type(self.value(tpdo_comm(*ch), 2).as_u8())
            })
            .filter_map(|ch| self.tpdo_frame(ch))
            .map(Outgoing::now)
            .collect()
    }

    fn tpdo_frame(&self, channel: u8) -> Option<CanMessage> {
        let mappings = self.mapping(tpdo_map(channel));
        if mappings.is_empty() {
            return None;
        }
        Some(CanMessage::new(
            FunctionCode::Tpdo(channel).cob_id(self.node_id),
            &self.pdo_payload(&mappings),
        ))
    }

    /// Frames of asynchronous TxPDOs which map the given object
    fn event_tpdos(&self, index: u16, sub: u8) -> Vec<CanMessage> {
        if self.nmt != NmtState::Operational {
            return Vec::new();
        }
        (1..=PDO_CHANNELS)
            .filter(|ch| {
                self.cob_valid(tpdo_comm(*ch))
                    && !is_sync_type(self.value(tpdo_comm(*ch), 2).as_u8())
                    && self
                        .mapping(tpdo_map(*ch))
                        .iter()
                        .any(|m| m.index == index && m.sub == sub)
            })
            .filter_map(|ch| self.tpdo_frame(ch))
            .collect()
    }

    fn heartbeat(&self) -> CanMessage {
        Heartbeat {
            node: self.node_id,
            toggle: false,
            state: self.nmt,
        }
        .into()
    }

    fn boot_up(&self) -> CanMessage {
        Heartbeat {
            node: self.node_id,
            toggle: false,
            state: NmtState::Initialisation,
        }
        .into()
    }

    fn handle_nmt(&mut self, cs: NmtCommandSpecifier) -> Vec<Outgoing> {
        match cs {
            NmtCommandSpecifier::ResetApp | NmtCommandSpecifier::ResetComm => {
                if cs == NmtCommandSpecifier::ResetApp {
                    self.load_defaults();
                } else {
                    self.reset_communication();
                }
                self.nmt = NmtState::PreOperational;
                vec![Outgoing::now(self.boot_up())]
            }
            other => {
                let next = other.resulting_state();
                if !self.nmt.can_transition_to(next) {
                    return Vec::new();
                }
                self.nmt = next;
                if next != NmtState::Operational {
                    self.pending_sync.clear();
                }
                vec![Outgoing::now(self.heartbeat())]
            }
        }
    }

    fn handle_sdo(&mut self, req: SdoRequest) -> Vec<Outgoing> {
        let (index, sub) = req.object();
        if let SdoRequest::Abort { abort_code, .. } = req {
            self.events.push(SimEvent::SdoAbort {
                index,
                sub,
                abort_code,
            });
            return Vec::new();
        }
        self.events.push(SimEvent::SdoRequest { index, sub });
        let resp = match req {
            SdoRequest::ExpeditedDownload {
                index,
                sub,
                data,
                len,
            } => match self.download(index, sub, &data[..len as usize]) {
                Ok(()) => SdoResponse::download_acknowledge(index, sub),
                Err(code) => SdoResponse::abort(index, sub, code),
            },
            SdoRequest::InitiateUpload { index, sub } => match self.od.get(&(index, sub)) {
                Some(obj) => {
                    let (bytes, len) = obj.value.to_le_bytes();
                    SdoResponse::expedited_upload(index, sub, &bytes[..len])
                }
                None => SdoResponse::abort(index, sub, AbortCode::NoSuchObject),
            },
            SdoRequest::InitiateDownload { index, sub, .. } => {
                SdoResponse::abort(index, sub, AbortCode::UnsupportedAccess)
            }
            SdoRequest::Abort { .. } => return Vec::new(),
        };

        let mut out = vec![Outgoing {
            msg: CanMessage::new(
                FunctionCode::SdoResponse.cob_id(self.node_id),
                &resp.to_bytes(),
            ),
            delay: self.sdo_delay,
            event: Some(SimEvent::SdoResponse { index, sub }),
        }];
        if let SdoResponse::ConfirmDownload { .. } = resp {
            out.extend(self.event_tpdos(index, sub).into_iter().map(Outgoing::now));
        }
        out
    }

    fn handle_frame(&mut self, msg: CanMessage) -> Vec<Outgoing> {
        if self.silent {
            return Vec::new();
        }
        let Ok(parsed) = CanOpenMessage::try_from(msg) else {
            return Vec::new();
        };
        match parsed {
            CanOpenMessage::NmtCommand(cmd) if cmd.node == 0 || cmd.node == self.node_id => {
                self.handle_nmt(cmd.cs)
            }
            CanOpenMessage::Sync => self.handle_sync(),
            CanOpenMessage::SdoRequest { node, req } if node == self.node_id => self.handle_sdo(req),
            CanOpenMessage::Rpdo { node, channel, msg } if node == self.node_id => {
                self.handle_rpdo(channel, msg.data());
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn produce_heartbeat(&mut self) -> Vec<Outgoing> {
        let period = self.value(object_ids::HEARTBEAT_PRODUCER_TIME, 0).as_u16();
        self.next_heartbeat = match period {
            0 => None,
            ms => Some(Instant::now() + Duration::from_millis(ms as u64)),
        };
        if self.silent {
            Vec::new()
        } else {
            vec![Outgoing::now(self.heartbeat())]
        }
    }
}

fn lock(state: &Mutex<DriveState>) -> MutexGuard<'_, DriveState> {
    state.lock().unwrap()
}

fn send_all(state: &Arc<Mutex<DriveState>>, tx: &SimBusSender, out: Vec<Outgoing>) {
    for item in out {
        if item.delay.is_zero() {
            if let Some(event) = item.event {
                lock(state).events.push(event);
            }
            tx.send_now(item.msg);
        } else {
            let state = state.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(item.delay).await;
                if let Some(event) = item.event {
                    lock(&state).events.push(event);
                }
                tx.send_now(item.msg);
            });
        }
    }
}

async fn run(state: Arc<Mutex<DriveState>>, mut rx: SimBusReceiver, tx: SimBusSender) {
    loop {
        let next_heartbeat = lock(&state).next_heartbeat;
        let heartbeat_due = async move {
            match next_heartbeat {
                Some(t) => tokio::time::sleep_until(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            msg = rx.recv() => {
                let Ok(msg) = msg else {
                    return;
                };
                let out = lock(&state).handle_frame(msg);
                send_all(&state, &tx, out);
            }
            _ = heartbeat_due => {
                let out = lock(&state).produce_heartbeat();
                send_all(&state, &tx, out);
            }
        }
    }
}

/// Handle to a simulated drive running on a [`SimBus`]
///
/// The drive sends its boot-up message when spawned, and enters Pre-Operational. The task is
/// stopped when the handle is dropped.
pub struct SimDrive {
    node_id: u8,
    state: Arc<Mutex<DriveState>>,
    sender: SimBusSender,
    task: JoinHandle<()>,
}

impl SimDrive {
    pub fn spawn(bus: &SimBus, node_id: u8) -> Self {
        let (sender, receiver) = bus.connect();
        let state = Arc::new(Mutex::new(DriveState::new(node_id)));
        sender.send_now(lock(&state).boot_up());
        let task = tokio::spawn(run(state.clone(), receiver, sender.clone()));
        Self {
            node_id,
            state,
            sender,
            task,
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn nmt_state(&self) -> NmtState {
        lock(&self.state).nmt
    }

    /// Read an object directly from the drive's dictionary
    pub fn get(&self, index: u16, sub: u8) -> Option<ObjectValue> {
        lock(&self.state).od.get(&(index, sub)).map(|o| o.value)
    }

    /// Change an object as the drive's application would, e.g. a new position reading
    ///
    /// Asynchronous TxPDOs which map the object are sent.
    pub fn set(&self, index: u16, sub: u8, value: ObjectValue) {
        let out = {
            let mut state = lock(&self.state);
            state.set_object(index, sub, value);
            state.event_tpdos(index, sub)
        };
        for msg in out {
            self.sender.send_now(msg);
        }
    }

    /// Add an object to the dictionary
    pub fn insert(&self, index: u16, sub: u8, value: ObjectValue, writable: bool) {
        lock(&self.state).insert(index, sub, value, writable);
    }

    /// Stop responding to anything, including NMT commands
    pub fn set_silent(&self, silent: bool) {
        lock(&self.state).silent = silent;
    }

    /// Delay every SDO response by `delay`
    pub fn set_sdo_delay(&self, delay: Duration) {
        lock(&self.state).sdo_delay = delay;
    }

    /// Everything the drive has logged so far
    pub fn events(&self) -> Vec<SimEvent> {
        lock(&self.state).events.clone()
    }

    pub fn clear_events(&self) {
        lock(&self.state).events.clear();
    }

    /// Number of received synchronous PDOs waiting for the next SYNC
    pub fn pending_sync(&self) -> usize {
        lock(&self.state).pending_sync.len()
    }

    /// The objects currently mapped on a TxPDO channel
    pub fn tpdo_mapping(&self, channel: u8) -> Vec<PdoMapping> {
        let state = lock(&self.state);
        state.mapping(tpdo_map(channel))
    }

    /// The objects currently mapped on an RxPDO channel
    pub fn rpdo_mapping(&self, channel: u8) -> Vec<PdoMapping> {
        let state = lock(&self.state);
        state.mapping(rpdo_map(channel))
    }

    /// Send a heartbeat now, with the current state
    pub fn send_heartbeat(&self) {
        let msg = lock(&self.state).heartbeat();
        self.sender.send_now(msg);
    }

    /// Send a TxPDO now, regardless of its transmission type
    pub fn send_tpdo(&self, channel: u8) {
        let msg = lock(&self.state).tpdo_frame(channel);
        if let Some(msg) = msg {
            self.sender.send_now(msg);
        }
    }

    /// Report an error through an emergency message. An error code of zero clears the error.
    pub fn send_emergency(&self, error_code: u16, error_register: u8) {
        lock(&self.state).set_object(object_ids::ERROR_REGISTER, 0, error_register.into());
        let msg: CanMessage = EmergencyMessage {
            node: self.node_id,
            error_code,
            error_register,
            vendor: [0; 5],
        }
        .into();
        self.sender.send_now(msg);
    }

    /// Power cycle the drive: defaults are restored and a boot-up message is sent
    pub fn power_cycle(&self) {
        let msg = {
            let mut state = lock(&self.state);
            state.load_defaults();
            state.nmt = NmtState::PreOperational;
            state.next_heartbeat = None;
            state.boot_up()
        };
        self.sender.send_now(msg);
    }
}

impl Drop for SimDrive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Width of the standard drive objects, for building PDO mappings in tests
pub fn object_size(index: u16) -> ObjectSize {
    match index {
        CONTROLWORD | STATUSWORD => ObjectSize::Bits16,
        MODES_OF_OPERATION => ObjectSize::Bits8,
        _ => ObjectSize::Bits32,
    }
}
