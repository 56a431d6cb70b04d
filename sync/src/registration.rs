use std::{cell::RefCell, rc::Rc};

use log::{debug, error};
use resim_serde::{BitReader, BitWriter};

use crate::{
    controller::{
        AutonomousServerController, ControllerRole, DollController, NetController,
        NoNetController, PlayerController, ServerController,
    },
    interface::{NetworkInterface, SynchronizerManager},
    object::{DeferredHooks, VarDescriptor},
    processor::ProcessPhase,
    scene::SceneData,
    types::{ObjectHandle, ObjectLocalId, ProcessHandler, VarId},
    var::VarValue,
};

/// Registration-time view of one object, handed to
/// [`SynchronizerManager::setup_synchronizer_for`] so the host can declare
/// variables, process functions and deferred hooks synchronously.
pub struct ObjectSetup<'a> {
    pub(crate) scene: &'a mut SceneData,
    pub(crate) object: ObjectLocalId,
}

impl ObjectSetup<'_> {
    pub fn object_id(&self) -> ObjectLocalId {
        self.object
    }

    /// Declare a tracked variable with its current value as baseline. The
    /// variable receives the next dense slot id; re-registering an existing
    /// name re-enables its slot instead.
    pub fn register_variable(&mut self, name: &str, value: VarValue) {
        register_variable_with_value(self.scene, self.object, name, value);
    }

    pub fn set_skip_rewinding(&mut self, name: &str, skip_rewinding: bool) {
        if let Some(od) = self.scene.storage.get_object_data_mut(self.object) {
            let var_id = od.find_variable_id(name);
            if let Some(descriptor) = od.vars.get_mut(var_id.index()) {
                descriptor.skip_rewinding = skip_rewinding;
            }
        }
    }

    pub fn register_process(
        &mut self,
        phase: ProcessPhase,
        func: impl FnMut(f64) + 'static,
    ) -> ProcessHandler {
        let handler = match self.scene.storage.get_object_data_mut(self.object) {
            Some(od) => od.functions[phase.index()].bind(Rc::new(RefCell::new(func))),
            None => ProcessHandler::NONE,
        };
        self.scene.process_functions_clear();
        handler
    }

    pub fn setup_deferred_sync(
        &mut self,
        collect_epoch: impl FnMut(&mut BitWriter) + 'static,
        apply_epoch: impl FnMut(f64, f64, &mut BitReader, &mut BitReader) + 'static,
    ) {
        if let Some(od) = self.scene.storage.get_object_data_mut(self.object) {
            od.deferred = Some(DeferredHooks {
                collect_epoch: Box::new(collect_epoch),
                apply_epoch: Box::new(apply_epoch),
            });
        }
    }
}

pub(crate) fn register_variable_with_value(
    scene: &mut SceneData,
    object: ObjectLocalId,
    name: &str,
    value: VarValue,
) -> VarId {
    let Some(od) = scene.storage.get_object_data_mut(object) else {
        return VarId::NONE;
    };
    let var_id = od.find_variable_id(name);
    if var_id != VarId::NONE {
        // Re-registering re-enables the slot; ordering is preserved.
        od.vars[var_id.index()].enabled = true;
        return var_id;
    }
    let var_id = VarId(od.vars.len() as u32);
    od.vars
        .push(VarDescriptor::new(var_id, name.to_string(), value));
    debug_assert!(od
        .vars
        .iter()
        .enumerate()
        .all(|(index, v)| v.id.index() == index));
    var_id
}

/// Allocate and wire up an object record: metadata, controller extraction,
/// net-id minting on the authoritative side, and the host's setup hook.
/// Role-specific bookkeeping (sync groups, player tracking) is the caller's
/// business.
pub(crate) fn register_app_object_core(
    scene: &mut SceneData,
    manager: &mut dyn SynchronizerManager,
    network: &dyn NetworkInterface,
    handle: ObjectHandle,
) -> ObjectLocalId {
    if handle == ObjectHandle::NONE {
        error!("Cannot register the NONE object handle.");
        return ObjectLocalId::NONE;
    }

    let existing = scene.storage.find_object_local_id(handle);
    if !existing.is_none() {
        return existing;
    }

    let object = {
        let od = scene.storage.allocate_object_data();
        od.handle = handle;
        od.local_id()
    };

    let name = manager.get_object_name(handle);
    let instance_id = manager.get_object_id(handle);
    let controller = manager.extract_controller(handle).map(|setup| {
        NetController::new(
            setup.manager,
            setup.config,
            setup.server_controlled,
            network.authority_of(handle),
        )
    });

    {
        let od = scene
            .storage
            .get_object_data_mut(object)
            .expect("just allocated");
        od.name = name;
        od.instance_id = instance_id;
        od.controller = controller;
    }
    scene.storage.notify_controller_presence(object);

    if scene.generate_id {
        let net_id = scene.storage.generate_net_id();
        scene.storage.set_net_id(object, net_id);
    }

    let has_controller = scene
        .storage
        .get_object_data(object)
        .map(|od| od.controller.is_some())
        .unwrap_or(false);
    if has_controller {
        scene.peer_dirty = true;
        reset_controller_role(scene, network, object);
    }

    scene.process_functions_clear();

    manager.on_add_object_data(handle);
    let mut setup = ObjectSetup {
        scene: &mut *scene,
        object,
    };
    manager.setup_synchronizer_for(handle, object, &mut setup);

    if let Some(od) = scene.storage.get_object_data(object) {
        debug!("New object registered (net id {:?}): {}", od.net_id(), od.name);
    }

    object
}

/// Select the controller role from the local network standing and the
/// object's `server_controlled` bit. Role changes are replacements.
/// Returns `true` when the object carries a controller.
pub(crate) fn reset_controller_role(
    scene: &mut SceneData,
    network: &dyn NetworkInterface,
    object: ObjectLocalId,
) -> bool {
    let local_peer = network.local_peer_id();
    let networked = network.is_local_peer_networked();
    let is_server = network.is_local_peer_server();

    let Some(od) = scene.storage.get_object_data_mut(object) else {
        return false;
    };
    let Some(controller) = od.controller.as_mut() else {
        return false;
    };

    controller.role = if !networked {
        ControllerRole::NoNet(NoNetController::new())
    } else if is_server {
        if controller.server_controlled() {
            ControllerRole::AutonomousServer(AutonomousServerController::new())
        } else {
            ControllerRole::Server(ServerController::new(controller.config.network_traced_frames))
        }
    } else if controller.peer() == local_peer && !controller.server_controlled() {
        ControllerRole::Player(PlayerController::new())
    } else {
        ControllerRole::Doll(DollController::new(
            controller.config.max_redundant_inputs as u32,
        ))
    };

    scene.peer_dirty = true;
    true
}
