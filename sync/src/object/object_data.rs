use resim_serde::{BitReader, BitWriter};

use crate::{
    controller::NetController,
    processor::{ProcessPhase, Processor},
    types::{ListenerHandle, ObjectHandle, ObjectLocalId, ObjectNetId, VarId},
    var::VarValue,
};

/// One tracked variable slot of an object. Slots are assigned dense ids in
/// registration order and are disabled rather than removed, so ids stay a
/// contiguous `[0..n)` range for the object's whole lifetime.
pub struct VarDescriptor {
    pub id: VarId,
    pub name: String,
    pub value: VarValue,
    /// Replicated but excluded from divergence detection.
    pub skip_rewinding: bool,
    /// A disabled slot keeps its id but is not replicated.
    pub enabled: bool,
    pub(crate) listeners: Vec<ListenerHandle>,
}

impl VarDescriptor {
    pub(crate) fn new(id: VarId, name: String, value: VarValue) -> Self {
        Self {
            id,
            name,
            value,
            skip_rewinding: false,
            enabled: true,
            listeners: Vec::new(),
        }
    }
}

/// The epoch hooks of an object registered for deferred sync.
pub struct DeferredHooks {
    /// Serialize the object's current deferred state into the writer.
    pub collect_epoch: Box<dyn FnMut(&mut BitWriter)>,
    /// Blend between two collected epochs and install the result.
    pub apply_epoch: Box<dyn FnMut(f64, f64, &mut BitReader, &mut BitReader)>,
}

/// A single simulated entity known to the synchronizer.
pub struct ObjectData {
    local_id: ObjectLocalId,
    pub(crate) net_id: ObjectNetId,
    /// Stable application name, used to resolve the object on peers that do
    /// not know its net id yet.
    pub name: String,
    /// Opaque application id, as reported by the host.
    pub instance_id: u64,
    pub handle: ObjectHandle,
    pub vars: Vec<VarDescriptor>,
    pub(crate) controller: Option<NetController>,
    pub(crate) deferred: Option<DeferredHooks>,
    pub(crate) functions: [Processor; ProcessPhase::COUNT],
    /// Whether this peer's server currently replicates the object to us in
    /// realtime. Objects outside the flag are skipped by processing and by
    /// local snapshot capture.
    pub realtime_sync_enabled_on_client: bool,
}

impl ObjectData {
    pub(crate) fn new(local_id: ObjectLocalId) -> Self {
        Self {
            local_id,
            net_id: ObjectNetId::NONE,
            name: String::new(),
            instance_id: 0,
            handle: ObjectHandle::NONE,
            vars: Vec::new(),
            controller: None,
            deferred: None,
            functions: Default::default(),
            realtime_sync_enabled_on_client: true,
        }
    }

    pub fn local_id(&self) -> ObjectLocalId {
        self.local_id
    }

    pub fn net_id(&self) -> ObjectNetId {
        self.net_id
    }

    pub fn find_variable_id(&self, name: &str) -> VarId {
        self.vars
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.id)
            .unwrap_or(VarId::NONE)
    }

    pub fn controller(&self) -> Option<&NetController> {
        self.controller.as_ref()
    }

    pub fn controller_mut(&mut self) -> Option<&mut NetController> {
        self.controller.as_mut()
    }

    pub fn can_deferred_sync(&self) -> bool {
        self.deferred.is_some()
    }

    pub fn has_registered_process_functions(&self) -> bool {
        self.functions.iter().any(|p| !p.is_empty())
    }
}
