//! Implements the core Device object
//!

use std::collections::VecDeque;

use log::{debug, info, warn};

use dyncan_common::{
    constants::{index_regions, object_ids},
    messages::{
        CanId, CanMessage, EmcyRecord, NmtCommand, NmtCommandSpecifier, NmtState, LSS_RESP_ID,
        SDO_REQ_BASE, SDO_RESP_BASE,
    },
    lss::LssRequest,
    objects::ObjectId,
    types::TimeOfDay,
    NodeId,
};

use crate::{
    emcy::EmcyEngine,
    error::ConfigError,
    lss_slave::{LssConfig, LssEvent, LssSlave},
    nmt::{HeartbeatConsumer, NmtEngine},
    object_dict::ObjectDictionary,
    pdo::{PdoEngine, PdoMap},
    sdo_server::SdoServerChannel,
    sync::SyncEngine,
    time::TimeEngine,
};

/// Events produced by a [`Device`] for the application
///
/// Events are queued during [`Device::process`] in the order they occur and
/// drained with [`Device::take_events`].
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceEvent {
    /// The NMT state machine changed state
    NmtChangeState {
        /// The state entered
        new: NmtState,
        /// The state left
        old: NmtState,
    },
    /// A supervised heartbeat producer went silent
    NmtTimeout {
        /// The producer's node ID
        node: u8,
        /// Its last reported NMT state
        last_state: Option<NmtState>,
        /// The configured supervision interval
        interval_ms: u16,
    },
    /// An NMT reset-node command was applied locally
    NmtResetNode,
    /// An NMT reset-communication command was applied locally
    NmtResetCommunication,
    /// A SYNC was produced or consumed
    Sync {
        /// The SYNC counter, when the producer is configured with one
        counter: Option<u8>,
    },
    /// A TIME frame was consumed
    Time {
        /// The received network time
        time: TimeOfDay,
    },
    /// An emergency was consumed
    Emergency {
        /// The COB-ID the emergency arrived on
        cob_id: u16,
        /// The parsed payload
        record: EmcyRecord,
    },
    /// An RPDO updated one or more dictionary entries
    Pdo {
        /// The COB-ID of the matched RPDO
        cob_id: u16,
        /// The entries whose value changed
        entries: Vec<ObjectId>,
    },
    /// The LSS master assigned a new node ID
    LssChangeDeviceId {
        /// The assigned node ID
        node_id: u8,
    },
}

/// A CANopen device
///
/// A Device owns an [`ObjectDictionary`] and one instance of each protocol
/// engine. It is run by feeding received frames in with
/// [`Device::handle_frame`] and polling [`Device::process`]; all timing
/// derives from the `now_us` argument, so a test can drive virtual time.
///
/// Engines read their configuration from the dictionary when the device is
/// created and re-read it whenever the backing entries change, including via
/// SDO writes from the bus.
#[allow(missing_debug_implementations)]
pub struct Device {
    node_id: NodeId,
    od: ObjectDictionary,
    nmt: NmtEngine,
    sync: SyncEngine,
    time: TimeEngine,
    emcy: EmcyEngine,
    pdo: PdoEngine,
    sdo_servers: Vec<SdoServerChannel>,
    lss: LssSlave,
    rx_queue: VecDeque<CanMessage>,
    events: Vec<DeviceEvent>,
    started: bool,
}

impl Device {
    /// Create a new device from a dictionary
    ///
    /// All engines parse their configuration entries; inconsistent SDO server
    /// parameters fail here.
    pub fn new(node_id: NodeId, od: ObjectDictionary) -> Result<Self, ConfigError> {
        let identity = od.identity().ok_or(ConfigError::MissingRequiredEntry {
            index: object_ids::IDENTITY,
        })?;

        let mut nmt = NmtEngine::new();
        nmt.configure(&od);
        let mut sync = SyncEngine::new();
        sync.configure(&od);
        let mut time = TimeEngine::new();
        time.configure(&od);
        let mut emcy = EmcyEngine::new();
        emcy.configure(&od);
        let mut pdo = PdoEngine::new();
        pdo.configure(&od, node_id.raw());

        let sdo_servers = build_sdo_servers(&od, node_id)?;

        let lss = LssSlave::new(LssConfig {
            identity,
            node_id,
            store_supported: false,
        });

        Ok(Self {
            node_id,
            od,
            nmt,
            sync,
            time,
            emcy,
            pdo,
            sdo_servers,
            lss,
            rx_queue: VecDeque::new(),
            events: Vec::new(),
            started: false,
        })
    }

    /// Get the current node ID
    pub fn node_id(&self) -> u8 {
        self.node_id.raw()
    }

    /// Get the current NMT state
    pub fn nmt_state(&self) -> NmtState {
        self.nmt.state()
    }

    /// Access the object dictionary
    pub fn od(&self) -> &ObjectDictionary {
        &self.od
    }

    /// Mutably access the object dictionary
    ///
    /// Writes take effect on the next [`Device::process`] call, which drains
    /// the dictionary's update journal.
    pub fn od_mut(&mut self) -> &mut ObjectDictionary {
        &mut self.od
    }

    /// The parsed TPDO maps (for inspection)
    pub fn tpdos(&self) -> &[PdoMap] {
        self.pdo.tpdos()
    }

    /// The parsed RPDO maps (for inspection)
    pub fn rpdos(&self) -> &[PdoMap] {
        self.pdo.rpdos()
    }

    /// The heartbeat consumers parsed from 0x1016
    pub fn heartbeat_consumers(&self) -> &[HeartbeatConsumer] {
        self.nmt.consumers()
    }

    /// Assign a new node ID
    ///
    /// The device re-enters the Initializing state and re-derives its
    /// communication parameters on the next process call.
    pub fn set_node_id(&mut self, node_id: NodeId) {
        if node_id != self.node_id {
            info!("Node ID changed to {}", node_id.raw());
            self.node_id = node_id;
            self.lss.set_node_id(node_id);
            self.nmt.set_state(NmtState::Initializing, &mut self.events);
        }
    }

    /// Queue a received frame for the next process call
    pub fn handle_frame(&mut self, msg: CanMessage) {
        self.rx_queue.push_back(msg);
    }

    /// Drain the events produced since the last call
    pub fn take_events(&mut self) -> Vec<DeviceEvent> {
        std::mem::take(&mut self.events)
    }

    /// Arm the periodic producers (heartbeat, SYNC, PDO)
    ///
    /// Producers which are disabled by their configuration entries are left
    /// off; a SYNC producer that is enabled with a zero cycle period is an
    /// error.
    pub fn start(&mut self, now_us: u64) -> Result<(), ConfigError> {
        if self.nmt.heartbeat_enabled() {
            self.nmt.start_heartbeat(now_us)?;
        }
        if self.sync.enabled() {
            self.sync.start(now_us)?;
        }
        self.pdo.start(now_us)?;
        self.started = true;
        Ok(())
    }

    /// Explicitly start the SYNC producer
    ///
    /// Fails when the generate bit of 0x1005 is clear or the cycle period is
    /// zero.
    pub fn start_sync(&mut self, now_us: u64) -> Result<(), ConfigError> {
        self.sync.start(now_us)
    }

    /// Cancel all periodic work and transmission
    pub fn stop(&mut self) {
        self.nmt.stop();
        self.sync.stop();
        self.pdo.stop();
        self.started = false;
    }

    /// Queue an emergency for transmission
    ///
    /// Emergencies are sent FIFO, spaced by the inhibit time (0x1015), on the
    /// next process calls.
    pub fn emcy_write(&mut self, code: u16, info: &[u8]) -> Result<(), ConfigError> {
        self.emcy
            .write(&self.od, self.node_id.raw(), code, info)
    }

    /// Send a TIME frame
    pub fn write_time(
        &mut self,
        time: TimeOfDay,
        send: &mut dyn FnMut(CanMessage),
    ) -> Result<(), ConfigError> {
        self.time.write(time, send)
    }

    /// Manually transmit a TPDO by COB-ID
    ///
    /// With `update_only`, transmission is skipped when no mapped value has
    /// changed since the last send.
    pub fn pdo_write(
        &mut self,
        cob_id: u16,
        update_only: bool,
        send: &mut dyn FnMut(CanMessage),
    ) -> bool {
        self.pdo.write(cob_id, update_only, &self.od, send)
    }

    /// Send an NMT command, applying it locally when it addresses this node
    /// (or is a broadcast)
    pub fn nmt_command(
        &mut self,
        cs: NmtCommandSpecifier,
        target: u8,
        send: &mut dyn FnMut(CanMessage),
    ) {
        send(NmtCommand { cs, node: target }.into());
        if target == 0 || target == self.node_id.raw() {
            self.apply_nmt_command(cs);
        }
    }

    /// Command a node (or all nodes) to enter Operational
    pub fn start_node(&mut self, target: u8, send: &mut dyn FnMut(CanMessage)) {
        self.nmt_command(NmtCommandSpecifier::Start, target, send);
    }

    /// Command a node (or all nodes) to enter Stopped
    pub fn stop_node(&mut self, target: u8, send: &mut dyn FnMut(CanMessage)) {
        self.nmt_command(NmtCommandSpecifier::Stop, target, send);
    }

    /// Command a node (or all nodes) to enter PreOperational
    pub fn enter_pre_operational(&mut self, target: u8, send: &mut dyn FnMut(CanMessage)) {
        self.nmt_command(NmtCommandSpecifier::EnterPreOp, target, send);
    }

    /// Command a node (or all nodes) to perform an application reset
    pub fn reset_node(&mut self, target: u8, send: &mut dyn FnMut(CanMessage)) {
        self.nmt_command(NmtCommandSpecifier::ResetNode, target, send);
    }

    /// Command a node (or all nodes) to perform a communication reset
    pub fn reset_communication(&mut self, target: u8, send: &mut dyn FnMut(CanMessage)) {
        self.nmt_command(NmtCommandSpecifier::ResetComm, target, send);
    }

    /// Run the device
    ///
    /// Consumes queued frames, advances every engine's timers to `now_us`, and
    /// sends outbound frames through `send`. Events produced along the way are
    /// queued for [`Device::take_events`].
    pub fn process(&mut self, now_us: u64, send: &mut dyn FnMut(CanMessage)) {
        if self.nmt.state() == NmtState::Initializing {
            self.boot(now_us, send);
        }

        self.apply_od_updates(now_us);

        while let Some(msg) = self.rx_queue.pop_front() {
            self.dispatch_frame(msg, now_us, send);
            if self.nmt.state() == NmtState::Initializing {
                self.boot(now_us, send);
            }
        }

        let node = self.node_id.raw();
        self.nmt.poll(now_us, node, send, &mut self.events);

        if let Some(sync) = self.sync.poll(now_us, send) {
            self.events.push(DeviceEvent::Sync { counter: sync.count });
            self.pdo.on_sync(sync.count, &self.od, send);
        }

        self.emcy.poll(now_us, &self.od, node, send);
        self.pdo.poll(now_us, &self.od, send);

        for server in &mut self.sdo_servers {
            if let Some(resp) = server.poll(now_us) {
                send(resp.to_can_message(CanId::Std(server.cob_tx)));
            }
        }
    }

    /// Transition out of Initializing: re-derive communication parameters,
    /// send the boot-up heartbeat, and re-arm producers if started
    fn boot(&mut self, now_us: u64, send: &mut dyn FnMut(CanMessage)) {
        debug!("Booting node {}", self.node_id.raw());

        if let Some(identity) = self.od.identity() {
            self.lss.update_config(LssConfig {
                identity,
                node_id: self.node_id,
                store_supported: false,
            });
        }

        self.nmt.configure(&self.od);
        self.sync.configure(&self.od);
        self.time.configure(&self.od);
        self.emcy.configure(&self.od);
        self.pdo.configure(&self.od, self.node_id.raw());
        match build_sdo_servers(&self.od, self.node_id) {
            Ok(servers) => self.sdo_servers = servers,
            Err(e) => warn!("SDO server configuration invalid after reset: {e}"),
        }

        if self.node_id.is_configured() {
            // Boot-up message: a heartbeat carrying the Initializing state
            self.nmt.send_heartbeat(self.node_id.raw(), send);
        }
        self.nmt.set_state(NmtState::PreOperational, &mut self.events);

        if self.started {
            if self.nmt.heartbeat_enabled() {
                self.nmt.start_heartbeat(now_us).ok();
            }
            if self.sync.enabled() {
                if let Err(e) = self.sync.start(now_us) {
                    warn!("SYNC producer not restarted: {e}");
                }
            }
            if let Err(e) = self.pdo.start(now_us) {
                warn!("PDO producer not restarted: {e}");
            }
        }
    }

    /// Drain the dictionary journal, re-reading engine configuration and
    /// marking event-driven TPDOs
    fn apply_od_updates(&mut self, now_us: u64) {
        if !self.od.has_updates() {
            return;
        }
        let updates = self.od.take_updates();

        let mut nmt_cfg = false;
        let mut sync_cfg = false;
        let mut time_cfg = false;
        let mut emcy_cfg = false;
        let mut pdo_cfg = false;
        let mut sdo_cfg = false;

        for id in &updates {
            match id.index {
                object_ids::COB_ID_SYNC
                | object_ids::COMM_CYCLE_PERIOD
                | object_ids::SYNC_COUNTER_OVERFLOW => sync_cfg = true,
                object_ids::COB_ID_TIME => time_cfg = true,
                object_ids::COB_ID_EMCY | object_ids::INHIBIT_TIME_EMCY => emcy_cfg = true,
                object_ids::HEARTBEAT_CONSUMER_TIME | object_ids::HEARTBEAT_PRODUCER_TIME => {
                    nmt_cfg = true
                }
                i if index_regions::SDO_SERVER.contains(&i) => sdo_cfg = true,
                i if index_regions::RPDO_COMM.contains(&i)
                    || index_regions::RPDO_MAPPING.contains(&i)
                    || index_regions::TPDO_COMM.contains(&i)
                    || index_regions::TPDO_MAPPING.contains(&i) =>
                {
                    pdo_cfg = true
                }
                _ => {}
            }
            self.pdo.mark_updated(*id);
        }

        if nmt_cfg {
            self.nmt.configure(&self.od);
            if self.started && self.nmt.heartbeat_enabled() {
                self.nmt.start_heartbeat(now_us).ok();
            }
        }
        if sync_cfg {
            self.sync.configure(&self.od);
            if self.started && self.sync.enabled() {
                if let Err(e) = self.sync.start(now_us) {
                    warn!("SYNC producer not restarted after reconfiguration: {e}");
                }
            }
        }
        if time_cfg {
            self.time.configure(&self.od);
        }
        if emcy_cfg {
            self.emcy.configure(&self.od);
        }
        if pdo_cfg {
            let was_running = self.pdo.running();
            self.pdo.configure(&self.od, self.node_id.raw());
            if was_running {
                if let Err(e) = self.pdo.start(now_us) {
                    warn!("PDO producer not restarted after reconfiguration: {e}");
                }
            }
        }
        if sdo_cfg {
            match build_sdo_servers(&self.od, self.node_id) {
                Ok(servers) => self.sdo_servers = servers,
                Err(e) => warn!("Ignoring invalid SDO server reconfiguration: {e}"),
            }
        }
    }

    fn apply_nmt_command(&mut self, cs: NmtCommandSpecifier) {
        self.nmt.handle_command(cs, &mut self.events);
    }

    fn dispatch_frame(&mut self, msg: CanMessage, now_us: u64, send: &mut dyn FnMut(CanMessage)) {
        if msg.id().is_extended() || msg.is_rtr() {
            return;
        }
        let id = msg.id().raw() as u16;

        // NMT command
        if id == 0 {
            if let Ok(cmd) = NmtCommand::try_from(msg) {
                if cmd.node == 0 || cmd.node == self.node_id.raw() {
                    debug!("Received NMT command: {:?}", cmd.cs);
                    self.apply_nmt_command(cmd.cs);
                }
            }
            return;
        }

        // Heartbeats from other nodes
        if id & 0x780 == 0x700 {
            let node = (id & 0x7F) as u8;
            if let Some(state) = msg.data().first() {
                if let Ok(state) = NmtState::try_from(*state & 0x7F) {
                    self.nmt.on_heartbeat(node, state, now_us);
                }
            }
            return;
        }

        // SYNC
        if let Some(sync) = self.sync.on_frame(id, msg.data()) {
            self.events.push(DeviceEvent::Sync { counter: sync.count });
            if self.nmt.state() != NmtState::Stopped {
                self.pdo.on_sync(sync.count, &self.od, send);
            }
            return;
        }

        // TIME
        if let Some(time) = self.time.on_frame(id, msg.data()) {
            self.events.push(DeviceEvent::Time { time });
            return;
        }

        // EMCY
        if self
            .emcy
            .on_frame(id, msg.data(), self.node_id.raw(), &mut self.od, &mut self.events)
        {
            return;
        }

        // LSS slave
        if id == 0x7E5 {
            if let Ok(req) = LssRequest::try_from(msg.data()) {
                if let Some(resp) = self.lss.process_request(req) {
                    send(resp.to_can_message(LSS_RESP_ID));
                }
                while let Some(event) = self.lss.pending_event() {
                    match event {
                        LssEvent::ConfigureNodeId { node_id } => {
                            if let Ok(new_id) = NodeId::new(node_id) {
                                self.set_node_id(new_id);
                                self.events
                                    .push(DeviceEvent::LssChangeDeviceId { node_id });
                            }
                        }
                        LssEvent::ConfigureBitTiming { .. }
                        | LssEvent::ActivateBitTiming { .. }
                        | LssEvent::StoreConfiguration => {}
                    }
                }
            }
            return;
        }

        // SDO servers
        if self.nmt.state() != NmtState::Stopped {
            for i in 0..self.sdo_servers.len() {
                if id == self.sdo_servers[i].cob_rx {
                    let resp =
                        self.sdo_servers[i].handle_request(msg.data(), &mut self.od, now_us);
                    if let Some(resp) = resp {
                        let cob_tx = self.sdo_servers[i].cob_tx;
                        send(resp.to_can_message(CanId::Std(cob_tx)));
                    }
                    return;
                }
            }
        }

        // RPDOs
        if self.pdo.running() && (0x180..0x580).contains(&id) {
            if let Some((entries, cob_id)) = self.pdo.on_frame(id, msg.data(), &mut self.od) {
                if !entries.is_empty() {
                    self.events.push(DeviceEvent::Pdo { cob_id, entries });
                }
            }
        }
    }
}

/// Build the SDO server channel list: the default channel plus any server
/// parameter records (0x1200..0x127F)
fn build_sdo_servers(
    od: &ObjectDictionary,
    node_id: NodeId,
) -> Result<Vec<SdoServerChannel>, ConfigError> {
    let mut servers = Vec::new();
    if node_id.is_configured() {
        let id = node_id.raw() as u16;
        servers.push(SdoServerChannel::new(SDO_REQ_BASE | id, SDO_RESP_BASE | id));
    }

    let indexes: Vec<u16> = od.indexes_in(index_regions::SDO_SERVER).collect();
    for index in indexes {
        let Some(raw_rx) = od.read_unsigned(index, 1) else {
            continue;
        };
        let Some(raw_tx) = od.read_unsigned(index, 2) else {
            continue;
        };
        // Dynamic allocation and extended frames are not supported
        for raw in [raw_rx, raw_tx] {
            if raw & (1 << 30) != 0 || raw & (1 << 29) != 0 {
                return Err(ConfigError::InvalidBitfield { index });
            }
        }
        let mut cob_rx = (raw_rx & 0x7FF) as u16;
        let mut cob_tx = (raw_tx & 0x7FF) as u16;
        if node_id.is_configured() {
            let id = node_id.raw() as u16;
            if cob_rx & 0xF == 0 && cob_rx == SDO_REQ_BASE {
                cob_rx |= id;
            }
            if cob_tx & 0xF == 0 && cob_tx == SDO_RESP_BASE {
                cob_tx |= id;
            }
        }
        if servers.iter().any(|s| s.cob_rx == cob_rx) {
            continue;
        }
        servers.push(SdoServerChannel::new(cob_rx, cob_tx));
    }
    Ok(servers)
}
