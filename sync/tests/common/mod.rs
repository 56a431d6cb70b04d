//! In-memory host pair used by the integration suites: a tiny variable
//! world, a manager over it, and a network interface that collects outgoing
//! packets for the tests to pump between peers.
#![allow(dead_code)]

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use resim::{
    ControllerConfig, ControllerManager, ControllerSetup, InputId, NetworkInterface, ObjectHandle,
    ObjectSetup, PeerId, RpcChannel, SceneSynchronizer, SynchronizerManager, VarValue,
};
use resim_serde::{BitReader, BitWriter, Serde, SerdeErr};

pub const SERVER_PEER: PeerId = 1;

// ---------------------------------------------------------------- World

pub struct TestObjectDef {
    pub name: String,
    pub vars: Vec<(String, VarValue)>,
    pub controlled_by: Option<PeerId>,
    pub server_controlled: bool,
}

impl TestObjectDef {
    pub fn plain(name: &str, vars: &[(&str, VarValue)]) -> Self {
        Self {
            name: name.into(),
            vars: vars
                .iter()
                .map(|(n, v)| (n.to_string(), v.clone()))
                .collect(),
            controlled_by: None,
            server_controlled: false,
        }
    }

    pub fn controlled(name: &str, vars: &[(&str, VarValue)], peer: PeerId) -> Self {
        Self {
            controlled_by: Some(peer),
            ..Self::plain(name, vars)
        }
    }
}

pub struct TestWorld {
    pub objects: Vec<TestObjectDef>,
}

impl TestWorld {
    fn index_of(&self, name: &str) -> Option<usize> {
        self.objects.iter().position(|o| o.name == name)
    }

    pub fn var(&self, object: &str, var: &str) -> VarValue {
        let object = &self.objects[self.index_of(object).expect("object exists")];
        object
            .vars
            .iter()
            .find(|(n, _)| n == var)
            .map(|(_, v)| v.clone())
            .expect("var exists")
    }

    pub fn set_var(&mut self, object: &str, var: &str, value: VarValue) {
        let index = self.index_of(object).expect("object exists");
        for (n, v) in &mut self.objects[index].vars {
            if n == var {
                *v = value;
                return;
            }
        }
        panic!("var `{var}` not found on `{object}`");
    }
}

pub type SharedWorld = Rc<RefCell<TestWorld>>;

// ------------------------------------------------------------ Var codec

pub fn encode_value(writer: &mut BitWriter, value: &VarValue) {
    match value {
        VarValue::Nil => 0u8.ser(writer),
        VarValue::Bool(b) => {
            1u8.ser(writer);
            b.ser(writer);
        }
        VarValue::Int(i) => {
            2u8.ser(writer);
            i.ser(writer);
        }
        VarValue::Float(f) => {
            3u8.ser(writer);
            f.ser(writer);
        }
        VarValue::Str(s) => {
            4u8.ser(writer);
            s.ser(writer);
        }
        VarValue::Bytes(b) => {
            5u8.ser(writer);
            b.ser(writer);
        }
    }
}

pub fn decode_value(reader: &mut BitReader) -> Result<VarValue, SerdeErr> {
    Ok(match u8::de(reader)? {
        0 => VarValue::Nil,
        1 => VarValue::Bool(bool::de(reader)?),
        2 => VarValue::Int(i64::de(reader)?),
        3 => VarValue::Float(f64::de(reader)?),
        4 => VarValue::Str(String::de(reader)?),
        5 => VarValue::Bytes(Vec::<u8>::de(reader)?),
        tag => return Err(SerdeErr::UnknownTag { tag }),
    })
}

// ------------------------------------------------------------ Controller

/// Simple deterministic pawn: each input frame carries one `u8` step, the
/// simulation adds it to the object's `v` variable.
struct TestControllerManager {
    world: SharedWorld,
    object_index: usize,
}

impl ControllerManager for TestControllerManager {
    fn collect_inputs(&mut self, _delta: f64, writer: &mut BitWriter) {
        1u8.ser(writer);
    }

    fn controller_process(&mut self, _delta: f64, inputs: &mut BitReader) {
        let step = u8::de(inputs).unwrap_or(0) as i64;
        let mut world = self.world.borrow_mut();
        for (name, value) in &mut world.objects[self.object_index].vars {
            if name == "v" {
                if let VarValue::Int(v) = value {
                    *v += step;
                }
                return;
            }
        }
    }

    fn are_inputs_different(&mut self, a: &mut BitReader, b: &mut BitReader) -> bool {
        u8::de(a).unwrap_or(0) != u8::de(b).unwrap_or(0)
    }
}

// --------------------------------------------------------------- Manager

pub struct TestManager {
    pub world: SharedWorld,
    pub controller_config: ControllerConfig,
}

impl SynchronizerManager for TestManager {
    fn fetch_app_object(&mut self, name: &str) -> Option<ObjectHandle> {
        self.world
            .borrow()
            .index_of(name)
            .map(|index| ObjectHandle(index as u64))
    }

    fn get_object_id(&self, handle: ObjectHandle) -> u64 {
        handle.0
    }

    fn get_object_name(&self, handle: ObjectHandle) -> String {
        self.world.borrow().objects[handle.0 as usize].name.clone()
    }

    fn get_variable(&self, handle: ObjectHandle, name: &str) -> Option<VarValue> {
        self.world.borrow().objects[handle.0 as usize]
            .vars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    fn set_variable(&mut self, handle: ObjectHandle, name: &str, value: &VarValue) {
        let mut world = self.world.borrow_mut();
        for (n, v) in &mut world.objects[handle.0 as usize].vars {
            if n == name {
                *v = value.clone();
                return;
            }
        }
    }

    fn extract_controller(&mut self, handle: ObjectHandle) -> Option<ControllerSetup> {
        let world = self.world.borrow();
        let def = &world.objects[handle.0 as usize];
        def.controlled_by?;
        let server_controlled = def.server_controlled;
        drop(world);
        Some(ControllerSetup {
            server_controlled,
            config: self.controller_config.clone(),
            manager: Box::new(TestControllerManager {
                world: self.world.clone(),
                object_index: handle.0 as usize,
            }),
        })
    }

    fn setup_synchronizer_for(
        &mut self,
        handle: ObjectHandle,
        _object: resim::ObjectLocalId,
        setup: &mut ObjectSetup,
    ) {
        let vars: Vec<(String, VarValue)> =
            self.world.borrow().objects[handle.0 as usize].vars.clone();
        for (name, value) in vars {
            setup.register_variable(&name, value);
        }
    }
}

// --------------------------------------------------------------- Network

pub type Outbox = Rc<RefCell<VecDeque<(PeerId, RpcChannel, Vec<u8>)>>>;

pub struct TestNetwork {
    pub local_peer: PeerId,
    pub is_server: bool,
    pub networked: bool,
    pub world: SharedWorld,
    pub outbox: Outbox,
    pub clock_msec: Rc<RefCell<u32>>,
}

impl NetworkInterface for TestNetwork {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer
    }

    fn server_peer_id(&self) -> PeerId {
        SERVER_PEER
    }

    fn is_local_peer_networked(&self) -> bool {
        self.networked
    }

    fn is_local_peer_server(&self) -> bool {
        self.is_server
    }

    fn fetch_connected_peers(&self) -> Vec<PeerId> {
        Vec::new()
    }

    fn authority_of(&self, handle: ObjectHandle) -> PeerId {
        self.world.borrow().objects[handle.0 as usize]
            .controlled_by
            .unwrap_or(SERVER_PEER)
    }

    fn relative_msec(&self) -> u32 {
        *self.clock_msec.borrow()
    }

    fn send(&mut self, recipient: PeerId, channel: RpcChannel, payload: Vec<u8>) {
        self.outbox.borrow_mut().push_back((recipient, channel, payload));
    }

    fn encode(&self, writer: &mut BitWriter, value: &VarValue) {
        encode_value(writer, value);
    }

    fn decode(&self, reader: &mut BitReader) -> Result<VarValue, SerdeErr> {
        decode_value(reader)
    }

    fn compare(&self, a: &VarValue, b: &VarValue) -> bool {
        a == b
    }
}

// ------------------------------------------------------------------ Peer

pub struct TestPeer {
    pub sync: SceneSynchronizer,
    pub world: SharedWorld,
    pub outbox: Outbox,
    pub clock_msec: Rc<RefCell<u32>>,
    pub local_peer: PeerId,
}

fn make_peer(
    local_peer: PeerId,
    is_server: bool,
    defs: Vec<TestObjectDef>,
    config: ControllerConfig,
) -> TestPeer {
    let world: SharedWorld = Rc::new(RefCell::new(TestWorld { objects: defs }));
    let outbox: Outbox = Rc::new(RefCell::new(VecDeque::new()));
    let clock_msec = Rc::new(RefCell::new(0u32));

    let manager = Box::new(TestManager {
        world: world.clone(),
        controller_config: config,
    });
    let network = Box::new(TestNetwork {
        local_peer,
        is_server,
        networked: true,
        world: world.clone(),
        outbox: outbox.clone(),
        clock_msec: clock_msec.clone(),
    });

    let mut sync = SceneSynchronizer::new(manager, network);
    sync.setup();
    TestPeer {
        sync,
        world,
        outbox,
        clock_msec,
        local_peer,
    }
}

pub fn make_server(defs: Vec<TestObjectDef>) -> TestPeer {
    make_peer(SERVER_PEER, true, defs, ControllerConfig::default())
}

pub fn make_client(local_peer: PeerId, defs: Vec<TestObjectDef>) -> TestPeer {
    make_peer(local_peer, false, defs, ControllerConfig::default())
}

pub fn make_client_with_config(
    local_peer: PeerId,
    defs: Vec<TestObjectDef>,
    config: ControllerConfig,
) -> TestPeer {
    make_peer(local_peer, false, defs, config)
}

/// Dispatch a delivered packet into the receiving synchronizer's RPC entry
/// points, the way a transport would.
pub fn deliver(sync: &mut SceneSynchronizer, sender: PeerId, channel: RpcChannel, payload: &[u8]) {
    match channel {
        RpcChannel::ReceiveState => sync.rpc_receive_state(payload),
        RpcChannel::ReceiveInput => sync.rpc_receive_input(sender, payload),
        RpcChannel::NotifyNeedFullSnapshot => sync.rpc_notify_need_full_snapshot(sender),
        RpcChannel::SetNetworkEnabled => {
            let mut reader = BitReader::new(payload);
            if let Ok(enabled) = bool::de(&mut reader) {
                sync.rpc_set_network_enabled(sender, enabled);
            }
        }
        RpcChannel::NotifyPeerStatus => {
            let mut reader = BitReader::new(payload);
            if let Ok(enabled) = bool::de(&mut reader) {
                sync.rpc_notify_peer_status(enabled);
            }
        }
        RpcChannel::DeferredSyncData => sync.rpc_deferred_sync_data(payload),
        RpcChannel::SetServerControlled => sync.rpc_set_server_controlled(payload),
        RpcChannel::NotifyFpsAcceleration => sync.rpc_notify_fps_acceleration(payload),
    }
}

/// Move every pending packet from `from`'s outbox into `to`'s entry points.
pub fn pump(from: &TestPeer, to: &mut TestPeer) {
    let sender = from.local_peer;
    let pending: Vec<(PeerId, RpcChannel, Vec<u8>)> =
        from.outbox.borrow_mut().drain(..).collect();
    for (recipient, channel, payload) in pending {
        if recipient == to.local_peer {
            deliver(&mut to.sync, sender, channel, &payload);
        }
    }
}

impl TestPeer {
    pub fn drain_outbox(&self) -> Vec<(PeerId, RpcChannel, Vec<u8>)> {
        self.outbox.borrow_mut().drain(..).collect()
    }
}

// ----------------------------------------------------- Snapshot crafting

pub struct SnapshotRecord {
    pub net_id: u32,
    pub name: Option<String>,
    /// One entry per declared slot; `None` writes "no value".
    pub vars: Vec<Option<VarValue>>,
}

/// Build a server snapshot payload byte-exact to the protocol, for tests
/// that drive a client without a real server.
pub fn craft_snapshot(
    input_id: Option<InputId>,
    active_list: Option<&[u32]>,
    records: &[SnapshotRecord],
) -> Vec<u8> {
    let mut writer = BitWriter::new();
    input_id.unwrap_or(u32::MAX).ser(&mut writer);

    match active_list {
        Some(ids) => {
            true.ser(&mut writer);
            for id in ids {
                id.ser(&mut writer);
            }
            u32::MAX.ser(&mut writer);
        }
        None => false.ser(&mut writer),
    }

    // No custom data.
    false.ser(&mut writer);

    for record in records {
        record.net_id.ser(&mut writer);
        match &record.name {
            Some(name) => {
                true.ser(&mut writer);
                name.clone().ser(&mut writer);
            }
            None => false.ser(&mut writer),
        }
        (record.vars.len() as u8).ser(&mut writer);
        for var in &record.vars {
            match var {
                Some(value) => {
                    true.ser(&mut writer);
                    encode_value(&mut writer, value);
                }
                None => false.ser(&mut writer),
            }
        }
    }

    u32::MAX.ser(&mut writer);
    writer.to_bytes()
}

/// Build a deferred-sync packet: `(epoch, [(net_id, payload, bit_count)])`.
pub fn craft_deferred_packet(epoch: u32, entries: &[(u32, Vec<u8>, u32)]) -> Vec<u8> {
    use resim_serde::UnsignedInteger;

    let mut writer = BitWriter::new();
    epoch.ser(&mut writer);
    for (net_id, payload, bit_count) in entries {
        if *net_id > u8::MAX as u32 {
            true.ser(&mut writer);
            UnsignedInteger::<16>::new(*net_id).ser(&mut writer);
        } else {
            false.ser(&mut writer);
            UnsignedInteger::<8>::new(*net_id).ser(&mut writer);
        }
        UnsignedInteger::<16>::new(*bit_count).ser(&mut writer);
        writer.write_bits(payload, *bit_count);
    }
    writer.to_bytes()
}

// -------------------------------------------------------- Event capture

#[derive(Clone, Default)]
pub struct EventLog {
    pub validated: Rc<RefCell<Vec<InputId>>>,
    pub rewinds: Rc<RefCell<Vec<(InputId, usize, usize)>>>,
    pub desyncs: Rc<RefCell<Vec<(InputId, Vec<String>, Vec<VarValue>, Vec<VarValue>)>>>,
}

pub fn attach_event_log(sync: &mut SceneSynchronizer) -> EventLog {
    let log = EventLog::default();

    let validated = log.validated.clone();
    sync.events()
        .on_state_validated(move |input_id| validated.borrow_mut().push(input_id));

    let rewinds = log.rewinds.clone();
    sync.events().on_rewind_frame_begin(move |input_id, index, count| {
        rewinds.borrow_mut().push((input_id, index, count))
    });

    let desyncs = log.desyncs.clone();
    sync.events().on_desync_detected(move |input_id, divergence| {
        desyncs.borrow_mut().push((
            input_id,
            divergence.var_names.clone(),
            divergence.client_values.clone(),
            divergence.server_values.clone(),
        ))
    });

    log
}
