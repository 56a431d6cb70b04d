use resim_serde::{BitReader, BitWriter, SerdeErr};

use crate::{
    controller::ControllerConfig,
    types::{ObjectHandle, PeerId, SyncGroupId},
    var::VarValue,
};

/// The eight RPC endpoints of the protocol, with their reliability class.
/// Inbound traffic enters the core through the orchestrator's `rpc_*` entry
/// points; outbound traffic leaves through [`NetworkInterface::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcChannel {
    /// server -> client, snapshot bit buffer.
    ReceiveState,
    /// client -> server, empty payload.
    NotifyNeedFullSnapshot,
    /// client -> server, bool.
    SetNetworkEnabled,
    /// server -> client, bool.
    NotifyPeerStatus,
    /// server -> client, epoch-tagged byte array.
    DeferredSyncData,
    /// client -> server, packed input frame batch.
    ReceiveInput,
    /// server -> client, (object net id, bool).
    SetServerControlled,
    /// server -> client, (distance_to_optimal, worst_receival_time_ms).
    NotifyFpsAcceleration,
}

impl RpcChannel {
    pub fn is_reliable(self) -> bool {
        !matches!(self, RpcChannel::DeferredSyncData | RpcChannel::ReceiveInput)
    }
}

/// Transport contract the host provides to the core. The core never opens
/// sockets; it only enumerates peers and hands payloads to `send`.
pub trait NetworkInterface {
    fn local_peer_id(&self) -> PeerId;
    fn server_peer_id(&self) -> PeerId;

    /// `false` when this process runs without any network session.
    fn is_local_peer_networked(&self) -> bool;
    fn is_local_peer_server(&self) -> bool;

    fn fetch_connected_peers(&self) -> Vec<PeerId>;

    /// The peer with authority over the given application object.
    fn authority_of(&self, handle: ObjectHandle) -> PeerId;

    /// Monotonic local clock, used to timestamp received input frames.
    fn relative_msec(&self) -> u32;

    fn send(&mut self, recipient: PeerId, channel: RpcChannel, payload: Vec<u8>);

    /// Encode a dynamic value into a bit buffer. The core never interprets
    /// values; the host owns the wire format of its variants.
    fn encode(&self, writer: &mut BitWriter, value: &VarValue);
    fn decode(&self, reader: &mut BitReader) -> Result<VarValue, SerdeErr>;

    /// Value equality. Hosts typically add a tolerance for floats so that
    /// benign drift does not read as divergence.
    fn compare(&self, a: &VarValue, b: &VarValue) -> bool;
}

/// Host-side half of a networked controller: input collection and the
/// simulation step driven by an input frame.
pub trait ControllerManager {
    /// Write the current player inputs for one frame into `writer`.
    fn collect_inputs(&mut self, delta: f64, writer: &mut BitWriter);

    /// Advance the controlled object's simulation with the given inputs.
    fn controller_process(&mut self, delta: f64, inputs: &mut BitReader);

    /// Compare two collected frames; `true` when they encode different
    /// inputs. Drives the run-length redundancy compression.
    fn are_inputs_different(&mut self, a: &mut BitReader, b: &mut BitReader) -> bool;
}

/// Everything the core needs to drive a controller, returned by
/// [`SynchronizerManager::extract_controller`] at registration.
pub struct ControllerSetup {
    /// When `true` the server both owns and simulates the object; every
    /// client sees it as a doll.
    pub server_controlled: bool,
    pub config: ControllerConfig,
    pub manager: Box<dyn ControllerManager>,
}

/// Host application contract: object resolution, variable access, custom
/// snapshot payloads and lifecycle hooks.
#[allow(unused_variables)]
pub trait SynchronizerManager {
    /// Resolve a stable application name to an object handle.
    fn fetch_app_object(&mut self, name: &str) -> Option<ObjectHandle>;

    /// Opaque application id for a handle.
    fn get_object_id(&self, handle: ObjectHandle) -> u64;

    /// Canonical, stable name for a handle.
    fn get_object_name(&self, handle: ObjectHandle) -> String;

    /// Read a named variable. `None` when the variable does not exist.
    fn get_variable(&self, handle: ObjectHandle, name: &str) -> Option<VarValue>;

    /// Write a named variable back into the application object.
    fn set_variable(&mut self, handle: ObjectHandle, name: &str, value: &VarValue);

    /// Extract the controller attached to the object, if any.
    fn extract_controller(&mut self, handle: ObjectHandle) -> Option<ControllerSetup> {
        None
    }

    /// Prepare an object for sync, right after registration. Variables,
    /// process functions and deferred hooks declared here are live before
    /// the registering snapshot record is parsed.
    fn setup_synchronizer_for(
        &mut self,
        handle: ObjectHandle,
        object: crate::types::ObjectLocalId,
        setup: &mut crate::registration::ObjectSetup,
    ) {
    }

    /// Executed on the server before anything else each relevancy period;
    /// move peers and adjust group membership here.
    fn update_objects_relevancy(&mut self, relevancy: &mut crate::server_sync::RelevancyContext) {}

    /// Per-group custom snapshot payload. `group` is `None` when a client
    /// captures its local state.
    fn snapshot_get_custom_data(&mut self, group: Option<SyncGroupId>) -> Option<VarValue> {
        None
    }

    fn snapshot_set_custom_data(&mut self, data: &VarValue) {}

    fn on_init_synchronizer(&mut self, was_generating_ids: bool) {}
    fn on_uninit_synchronizer(&mut self) {}
    fn on_add_object_data(&mut self, handle: ObjectHandle) {}
    fn on_drop_object_data(&mut self, handle: ObjectHandle) {}
    fn on_sync_group_created(&mut self, group_id: SyncGroupId) {}
}
