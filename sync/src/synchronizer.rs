use std::{cell::RefCell, rc::Rc};

use log::{error, warn};
use resim_serde::{BitReader, BitWriter, Serde};

use crate::{
    client_sync::ClientSynchronizer,
    controller::ControllerEvent,
    error::ConfigError,
    event::{ChangesListener, NetEventFlag, WatchingVar},
    interface::{NetworkInterface, RpcChannel, SynchronizerManager},
    no_net_sync::NoNetSynchronizer,
    object::ObjectData,
    peer::PeerData,
    processor::ProcessPhase,
    registration::{register_app_object_core, register_variable_with_value, reset_controller_role},
    scene::SceneData,
    server_sync::{sync_group_move_peer_to, ServerSynchronizer},
    snapshot::ObjectDivergence,
    sync_group::SyncGroup,
    types::{
        InputId, ListenerHandle, ObjectHandle, ObjectLocalId, ObjectNetId, PeerId, ProcessHandler,
        SyncGroupId, VarId,
    },
    var::VarValue,
};

/// Observable events of the synchronizer. Subscribe with the `on_*` methods;
/// every callback registered for an event fires in registration order.
#[derive(Default)]
pub struct SyncEvents {
    sync_started: Vec<Box<dyn FnMut()>>,
    sync_paused: Vec<Box<dyn FnMut()>>,
    peer_status_updated: Vec<Box<dyn FnMut(Option<ObjectHandle>, PeerId, bool, bool)>>,
    state_validated: Vec<Box<dyn FnMut(InputId)>>,
    rewind_frame_begin: Vec<Box<dyn FnMut(InputId, usize, usize)>>,
    desync_detected: Vec<Box<dyn FnMut(InputId, &ObjectDivergence)>>,
    input_missed: Vec<Box<dyn FnMut(InputId)>>,
    client_speedup_adjusted: Vec<Box<dyn FnMut(u32, i32, i32, i32)>>,
}

impl SyncEvents {
    pub fn on_sync_started(&mut self, callback: impl FnMut() + 'static) {
        self.sync_started.push(Box::new(callback));
    }

    pub fn on_sync_paused(&mut self, callback: impl FnMut() + 'static) {
        self.sync_paused.push(Box::new(callback));
    }

    /// `(controller_handle, peer, connected, enabled)`
    pub fn on_peer_status_updated(
        &mut self,
        callback: impl FnMut(Option<ObjectHandle>, PeerId, bool, bool) + 'static,
    ) {
        self.peer_status_updated.push(Box::new(callback));
    }

    pub fn on_state_validated(&mut self, callback: impl FnMut(InputId) + 'static) {
        self.state_validated.push(Box::new(callback));
    }

    /// `(input_id, index, count)` for each replayed frame of a rewind.
    pub fn on_rewind_frame_begin(
        &mut self,
        callback: impl FnMut(InputId, usize, usize) + 'static,
    ) {
        self.rewind_frame_begin.push(Box::new(callback));
    }

    pub fn on_desync_detected(
        &mut self,
        callback: impl FnMut(InputId, &ObjectDivergence) + 'static,
    ) {
        self.desync_detected.push(Box::new(callback));
    }

    pub fn on_input_missed(&mut self, callback: impl FnMut(InputId) + 'static) {
        self.input_missed.push(Box::new(callback));
    }

    /// `(worst_receival_time_ms, optimal_frame_delay, current_frame_delay,
    /// distance_to_optimal)`
    pub fn on_client_speedup_adjusted(
        &mut self,
        callback: impl FnMut(u32, i32, i32, i32) + 'static,
    ) {
        self.client_speedup_adjusted.push(Box::new(callback));
    }

    pub(crate) fn emit_sync_started(&mut self) {
        for callback in &mut self.sync_started {
            callback();
        }
    }

    pub(crate) fn emit_sync_paused(&mut self) {
        for callback in &mut self.sync_paused {
            callback();
        }
    }

    pub(crate) fn emit_peer_status_updated(
        &mut self,
        handle: Option<ObjectHandle>,
        peer: PeerId,
        connected: bool,
        enabled: bool,
    ) {
        for callback in &mut self.peer_status_updated {
            callback(handle, peer, connected, enabled);
        }
    }

    pub(crate) fn emit_state_validated(&mut self, input_id: InputId) {
        for callback in &mut self.state_validated {
            callback(input_id);
        }
    }

    pub(crate) fn emit_rewind_frame_begin(&mut self, input_id: InputId, index: usize, count: usize) {
        for callback in &mut self.rewind_frame_begin {
            callback(input_id, index, count);
        }
    }

    pub(crate) fn emit_desync_detected(
        &mut self,
        input_id: InputId,
        divergence: &ObjectDivergence,
    ) {
        for callback in &mut self.desync_detected {
            callback(input_id, divergence);
        }
    }

    pub(crate) fn emit_input_missed(&mut self, input_id: InputId) {
        for callback in &mut self.input_missed {
            callback(input_id);
        }
    }

    pub(crate) fn emit_client_speedup_adjusted(
        &mut self,
        worst_receival_time_ms: u32,
        optimal_frame_delay: i32,
        current_frame_delay: i32,
        distance_to_optimal: i32,
    ) {
        for callback in &mut self.client_speedup_adjusted {
            callback(
                worst_receival_time_ms,
                optimal_frame_delay,
                current_frame_delay,
                distance_to_optimal,
            );
        }
    }

    pub(crate) fn drain_controller_events(&mut self, scene: &mut SceneData) {
        let drained: Vec<ControllerEvent> = scene.controller_events.drain(..).collect();
        for event in drained {
            match event {
                ControllerEvent::InputMissed(input_id) => self.emit_input_missed(input_id),
                ControllerEvent::SpeedupAdjusted {
                    worst_receival_time_ms,
                    optimal_frame_delay,
                    current_frame_delay,
                    distance_to_optimal,
                } => self.emit_client_speedup_adjusted(
                    worst_receival_time_ms,
                    optimal_frame_delay,
                    current_frame_delay,
                    distance_to_optimal,
                ),
            }
        }
    }
}

enum Role {
    None,
    NoNet(NoNetSynchronizer),
    Server(ServerSynchronizer),
    Client(ClientSynchronizer),
}

/// The orchestrator: owns the registry, selects the role from the network
/// standing, dispatches RPCs and exposes the public surface.
///
/// Each [`SceneSynchronizer::process`] call is atomic from the outside; no
/// public operation may be invoked while it runs. RPC deliveries are drained
/// synchronously through the `rpc_*` entry points between ticks.
pub struct SceneSynchronizer {
    manager: Box<dyn SynchronizerManager>,
    network: Box<dyn NetworkInterface>,
    scene: SceneData,
    events: SyncEvents,
    role: Role,
}

impl SceneSynchronizer {
    pub fn new(
        manager: Box<dyn SynchronizerManager>,
        network: Box<dyn NetworkInterface>,
    ) -> Self {
        Self {
            manager,
            network,
            scene: SceneData::new(),
            events: SyncEvents::default(),
            role: Role::None,
        }
    }

    /// Initialize the role synchronizer. Call once the network interface
    /// knows its standing, and again (via [`Self::reset_synchronizer_mode`])
    /// whenever that standing changes.
    pub fn setup(&mut self) {
        self.reset_synchronizer_mode();
    }

    /// Prepare for destruction: drop every registered object and listener.
    pub fn conclude(&mut self) {
        self.clear();
        self.uninit_synchronizer();
    }

    // --------------------------------------------------------- Role state

    pub fn is_server(&self) -> bool {
        matches!(self.role, Role::Server(_))
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, Role::Client(_))
    }

    pub fn is_no_network(&self) -> bool {
        matches!(self.role, Role::NoNet(_))
    }

    pub fn is_networked(&self) -> bool {
        self.is_server() || self.is_client()
    }

    pub fn is_recovered(&self) -> bool {
        self.scene.recover_in_progress
    }

    pub fn is_resetted(&self) -> bool {
        self.scene.reset_in_progress
    }

    pub fn is_rewinding(&self) -> bool {
        self.scene.rewinding_in_progress
    }

    pub fn is_end_sync(&self) -> bool {
        self.scene.end_sync
    }

    pub fn events(&mut self) -> &mut SyncEvents {
        &mut self.events
    }

    // ------------------------------------------------------ Configuration

    pub fn set_ticks_per_second(&mut self, ticks_per_second: f64) {
        self.scene.ticks_per_second = ticks_per_second;
    }

    pub fn set_state_notify_interval(&mut self, interval: f64) {
        self.scene.state_notify_interval = interval;
    }

    pub fn state_notify_interval(&self) -> f64 {
        self.scene.state_notify_interval
    }

    pub fn set_objects_relevancy_update_time(&mut self, time: f64) {
        self.scene.relevancy_update_time = time;
    }

    pub fn set_max_deferred_objects_per_update(&mut self, count: usize) {
        self.scene.max_deferred_objects_per_update = count;
    }

    // ------------------------------------------------------------ Process

    /// Advance one tick: the role synchronizer simulates, detects changes
    /// and runs its half of the protocol.
    pub fn process(&mut self) {
        let Self {
            manager,
            network,
            scene,
            events,
            role,
        } = self;
        match role {
            Role::None => error!("`process` called before `setup`."),
            Role::NoNet(no_net) => no_net.process(scene, manager.as_mut(), network.as_mut(), events),
            Role::Server(server) => server.process(scene, manager.as_mut(), network.as_mut(), events),
            Role::Client(client) => client.process(scene, manager.as_mut(), network.as_mut(), events),
        }
    }

    // ------------------------------------------------------- Registration

    /// Register an application object, returning its process-local id.
    /// Registering an already registered handle returns the existing id.
    pub fn register_app_object(&mut self, handle: ObjectHandle) -> ObjectLocalId {
        let Self {
            manager,
            network,
            scene,
            role,
            ..
        } = self;
        let existed = !scene.storage.find_object_local_id(handle).is_none();
        let object = register_app_object_core(scene, manager.as_mut(), network.as_ref(), handle);
        if object.is_none() || existed {
            return object;
        }

        match role {
            Role::Server(server) => {
                server.on_object_data_added(scene, object);
                let var_names: Vec<String> = scene
                    .storage
                    .get_object_data(object)
                    .map(|od| od.vars.iter().map(|v| v.name.clone()).collect())
                    .unwrap_or_default();
                for name in var_names {
                    server.on_variable_added(object, &name);
                }
            }
            Role::Client(client) => client.on_controller_reset(scene, object),
            _ => {}
        }
        object
    }

    /// Call when a networked application object is destroyed.
    pub fn on_app_object_removed(&mut self, handle: ObjectHandle) {
        let object = self.scene.storage.find_object_local_id(handle);
        self.unregister_app_object(object);
    }

    pub fn unregister_app_object(&mut self, object: ObjectLocalId) {
        if object.is_none() {
            return;
        }
        let Self {
            manager,
            scene,
            role,
            ..
        } = self;
        let Some(od) = scene.storage.get_object_data(object) else {
            return;
        };
        let handle = od.handle;
        let net_id = od.net_id();
        let had_controller = od.controller().is_some();
        let had_functions = od.has_registered_process_functions();

        manager.on_drop_object_data(handle);
        match role {
            Role::Server(server) => server.on_object_data_removed(object),
            Role::Client(client) => client.on_object_removed(object, net_id),
            _ => {}
        }

        if had_controller {
            scene.peer_dirty = true;
        }

        // Listeners keep their shape; the dropped pairs just go inert.
        for listener in scene.listeners.iter_mut().flatten() {
            for watching in &mut listener.watching {
                if watching.object == object {
                    watching.object = ObjectLocalId::NONE;
                    watching.var = VarId::NONE;
                }
            }
        }

        if had_functions {
            scene.process_functions_clear();
        }
        scene.storage.deallocate_object_data(object);
    }

    /// Register a variable by name: the current host value becomes the
    /// baseline and the next dense slot id is assigned.
    pub fn register_variable(
        &mut self,
        object: ObjectLocalId,
        name: &str,
    ) -> Result<VarId, ConfigError> {
        let Self {
            manager,
            scene,
            role,
            ..
        } = self;
        let handle = scene
            .storage
            .get_object_data(object)
            .map(|od| od.handle)
            .ok_or(ConfigError::UnknownObject(object))?;

        let baseline = match manager.get_variable(handle, name) {
            Some(value) => value,
            None => {
                error!(
                    "The variable `{name}` was not found on the object `{handle:?}`; \
                     make sure the variable exists."
                );
                VarValue::Nil
            }
        };
        let var_id = register_variable_with_value(scene, object, name, baseline);

        if let Role::Server(server) = role {
            server.on_variable_added(object, name);
        }
        Ok(var_id)
    }

    /// Disable a variable slot. The slot id persists so later registrations
    /// keep their ordering; a disabled slot is simply not replicated.
    pub fn unregister_variable(
        &mut self,
        object: ObjectLocalId,
        name: &str,
    ) -> Result<(), ConfigError> {
        let od = self
            .scene
            .storage
            .get_object_data_mut(object)
            .ok_or(ConfigError::UnknownObject(object))?;
        let var_id = od.find_variable_id(name);
        if var_id == VarId::NONE {
            return Err(ConfigError::UnknownVariable {
                object,
                name: name.to_string(),
            });
        }

        let descriptor = &mut od.vars[var_id.index()];
        descriptor.enabled = false;
        let orphaned = std::mem::take(&mut descriptor.listeners);

        for handle in orphaned {
            if let Some(listener) = self
                .scene
                .listeners
                .get_mut(handle.index())
                .and_then(Option::as_mut)
            {
                for watching in &mut listener.watching {
                    if watching.object == object && watching.var == var_id {
                        watching.object = ObjectLocalId::NONE;
                        watching.var = VarId::NONE;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn is_variable_registered(&self, object: ObjectLocalId, name: &str) -> bool {
        self.scene
            .storage
            .get_object_data(object)
            .map(|od| od.find_variable_id(name) != VarId::NONE)
            .unwrap_or(false)
    }

    pub fn get_variable_id(&self, object: ObjectLocalId, name: &str) -> VarId {
        self.scene
            .storage
            .get_object_data(object)
            .map(|od| od.find_variable_id(name))
            .unwrap_or(VarId::NONE)
    }

    pub fn set_skip_rewinding(
        &mut self,
        object: ObjectLocalId,
        name: &str,
        skip_rewinding: bool,
    ) -> Result<(), ConfigError> {
        let od = self
            .scene
            .storage
            .get_object_data_mut(object)
            .ok_or(ConfigError::UnknownObject(object))?;
        let var_id = od.find_variable_id(name);
        let descriptor = od
            .vars
            .get_mut(var_id.index())
            .ok_or_else(|| ConfigError::UnknownVariable {
                object,
                name: name.to_string(),
            })?;
        descriptor.skip_rewinding = skip_rewinding;
        Ok(())
    }

    // -------------------------------------------------- Change listeners

    /// Subscribe to a set of `(object, variable)` pairs. All-or-nothing:
    /// every pair must name a registered variable.
    pub fn track_variables_changes(
        &mut self,
        objects: &[ObjectLocalId],
        variables: &[&str],
        flags: NetEventFlag,
        callback: impl FnMut(&[VarValue]) + 'static,
    ) -> Result<ListenerHandle, ConfigError> {
        if objects.len() != variables.len() || objects.is_empty() {
            return Err(ConfigError::InvalidListener {
                reason: "objects and variables must be equally sized and non-empty".into(),
            });
        }

        let mut watching = Vec::with_capacity(objects.len());
        for (object, name) in objects.iter().zip(variables.iter()) {
            let od = self
                .scene
                .storage
                .get_object_data(*object)
                .ok_or(ConfigError::UnknownObject(*object))?;
            let var_id = od.find_variable_id(name);
            if var_id == VarId::NONE {
                return Err(ConfigError::UnknownVariable {
                    object: *object,
                    name: name.to_string(),
                });
            }
            watching.push(WatchingVar {
                object: *object,
                var: var_id,
                old_set: false,
            });
        }

        let old_values = vec![VarValue::Nil; watching.len()];
        let pairs: Vec<(ObjectLocalId, VarId)> =
            watching.iter().map(|w| (w.object, w.var)).collect();
        let handle = self.scene.add_listener(ChangesListener {
            callback: Box::new(callback),
            flags,
            emitted: true,
            watching,
            old_values,
        });

        for (object, var) in pairs {
            if let Some(od) = self.scene.storage.get_object_data_mut(object) {
                od.vars[var.index()].listeners.push(handle);
            }
        }
        Ok(handle)
    }

    pub fn track_variable_changes(
        &mut self,
        object: ObjectLocalId,
        variable: &str,
        flags: NetEventFlag,
        callback: impl FnMut(&[VarValue]) + 'static,
    ) -> Result<ListenerHandle, ConfigError> {
        self.track_variables_changes(&[object], &[variable], flags, callback)
    }

    pub fn untrack_variable_changes(&mut self, handle: ListenerHandle) {
        self.scene.remove_listener(handle);
    }

    // --------------------------------------------------- Process functions

    pub fn register_process(
        &mut self,
        object: ObjectLocalId,
        phase: ProcessPhase,
        func: impl FnMut(f64) + 'static,
    ) -> Result<ProcessHandler, ConfigError> {
        let od = self
            .scene
            .storage
            .get_object_data_mut(object)
            .ok_or(ConfigError::UnknownObject(object))?;
        let handler = od.functions[phase.index()].bind(Rc::new(RefCell::new(func)));
        self.scene.process_functions_clear();
        Ok(handler)
    }

    pub fn unregister_process(
        &mut self,
        object: ObjectLocalId,
        phase: ProcessPhase,
        handler: ProcessHandler,
    ) {
        if let Some(od) = self.scene.storage.get_object_data_mut(object) {
            od.functions[phase.index()].unbind(handler);
            self.scene.process_functions_clear();
        }
    }

    /// Register the epoch hook pair that switches this object to the
    /// deferred (streamed, interpolated) sync channel.
    pub fn setup_deferred_sync(
        &mut self,
        object: ObjectLocalId,
        collect_epoch: impl FnMut(&mut BitWriter) + 'static,
        apply_epoch: impl FnMut(f64, f64, &mut BitReader, &mut BitReader) + 'static,
    ) -> Result<(), ConfigError> {
        let od = self
            .scene
            .storage
            .get_object_data_mut(object)
            .ok_or(ConfigError::UnknownObject(object))?;
        od.deferred = Some(crate::object::DeferredHooks {
            collect_epoch: Box::new(collect_epoch),
            apply_epoch: Box::new(apply_epoch),
        });
        Ok(())
    }

    // -------------------------------------------------------- Sync groups

    fn server_role(&mut self) -> Result<&mut ServerSynchronizer, ConfigError> {
        match &mut self.role {
            Role::Server(server) => Ok(server),
            _ => Err(ConfigError::WrongRole("server")),
        }
    }

    pub fn sync_group_create(&mut self) -> Result<SyncGroupId, ConfigError> {
        let id = self.server_role()?.sync_group_create();
        self.manager.on_sync_group_created(id);
        Ok(id)
    }

    pub fn sync_group_get(&self, group_id: SyncGroupId) -> Result<&SyncGroup, ConfigError> {
        match &self.role {
            Role::Server(server) => server.group(group_id),
            _ => Err(ConfigError::WrongRole("server")),
        }
    }

    pub fn sync_group_add_object(
        &mut self,
        object: ObjectLocalId,
        group_id: SyncGroupId,
        realtime: bool,
    ) -> Result<(), ConfigError> {
        if self.scene.storage.get_object_data(object).is_none() {
            return Err(ConfigError::UnknownObject(object));
        }
        self.server_role()?
            .group_mut_user(group_id)?
            .add_object(object, realtime);
        Ok(())
    }

    pub fn sync_group_remove_object(
        &mut self,
        object: ObjectLocalId,
        group_id: SyncGroupId,
    ) -> Result<(), ConfigError> {
        self.server_role()?
            .group_mut_user(group_id)?
            .remove_object(object);
        Ok(())
    }

    /// Atomically replace a group's object lists; surviving objects keep
    /// their change records.
    pub fn sync_group_replace_objects(
        &mut self,
        group_id: SyncGroupId,
        new_realtime: Vec<ObjectLocalId>,
        new_deferred: Vec<(ObjectLocalId, f32)>,
    ) -> Result<(), ConfigError> {
        self.server_role()?
            .group_mut_user(group_id)?
            .replace_objects(new_realtime, new_deferred);
        Ok(())
    }

    pub fn sync_group_remove_all_objects(
        &mut self,
        group_id: SyncGroupId,
    ) -> Result<(), ConfigError> {
        self.server_role()?
            .group_mut_user(group_id)?
            .remove_all_objects();
        Ok(())
    }

    /// Move a peer to another group. The peer's next snapshot is forced and
    /// full, regardless of its prior acknowledgement state.
    pub fn sync_group_move_peer_to(
        &mut self,
        peer: PeerId,
        group_id: SyncGroupId,
    ) -> Result<(), ConfigError> {
        let Self { scene, role, .. } = self;
        let Role::Server(server) = role else {
            return Err(ConfigError::WrongRole("server"));
        };
        let pd = scene
            .peer_data
            .get_mut(&peer)
            .ok_or(ConfigError::UnknownPeer(peer))?;
        if pd.sync_group_id == group_id {
            return Ok(());
        }
        pd.sync_group_id = group_id;
        sync_group_move_peer_to(
            &mut server.sync_groups,
            &mut scene.peer_data,
            &scene.storage,
            peer,
            Some(group_id),
        )
    }

    pub fn sync_group_get_peer_group(&self, peer: PeerId) -> Result<SyncGroupId, ConfigError> {
        if !self.is_server() {
            return Err(ConfigError::WrongRole("server"));
        }
        self.scene
            .peer_data
            .get(&peer)
            .map(|pd| pd.sync_group_id)
            .ok_or(ConfigError::UnknownPeer(peer))
    }

    pub fn sync_group_get_peers(&self, group_id: SyncGroupId) -> Result<&[PeerId], ConfigError> {
        Ok(&self.sync_group_get(group_id)?.peers)
    }

    pub fn sync_group_set_deferred_update_rate(
        &mut self,
        object: ObjectLocalId,
        group_id: SyncGroupId,
        update_rate: f32,
    ) -> Result<(), ConfigError> {
        self.server_role()?
            .group_mut_user(group_id)?
            .set_deferred_update_rate(object, update_rate);
        Ok(())
    }

    pub fn sync_group_get_deferred_update_rate(
        &self,
        object: ObjectLocalId,
        group_id: SyncGroupId,
    ) -> Result<f32, ConfigError> {
        Ok(self.sync_group_get(group_id)?.deferred_update_rate(object))
    }

    pub fn sync_group_set_user_data(
        &mut self,
        group_id: SyncGroupId,
        user_data: u64,
    ) -> Result<(), ConfigError> {
        let server = self.server_role()?;
        let group = server
            .sync_groups
            .get_mut(group_id.index())
            .ok_or(ConfigError::UnknownSyncGroup(group_id))?;
        group.user_data = user_data;
        Ok(())
    }

    pub fn sync_group_get_user_data(&self, group_id: SyncGroupId) -> Result<u64, ConfigError> {
        Ok(self.sync_group_get(group_id)?.user_data)
    }

    /// Force a group's next state notification, skipping the interval.
    pub fn force_state_notify(&mut self, group_id: SyncGroupId) -> Result<(), ConfigError> {
        let interval = self.scene.state_notify_interval;
        let server = self.server_role()?;
        let group = server
            .sync_groups
            .get_mut(group_id.index())
            .ok_or(ConfigError::UnknownSyncGroup(group_id))?;
        group.state_notifier_timer = interval + 1.0;
        Ok(())
    }

    pub fn force_state_notify_all(&mut self) -> Result<(), ConfigError> {
        let interval = self.scene.state_notify_interval;
        let server = self.server_role()?;
        for group in &mut server.sync_groups {
            group.state_notifier_timer = interval + 1.0;
        }
        Ok(())
    }

    /// Mark peers dirty so they get revalidated next tick.
    pub fn dirty_peers(&mut self) {
        self.scene.peer_dirty = true;
    }

    // ----------------------------------------------------- Enable control

    /// Client: ask the server to pause/resume our replication. No-net:
    /// toggle the local loop. The server is always enabled.
    pub fn set_enabled(&mut self, enabled: bool) {
        let Self {
            network,
            events,
            role,
            ..
        } = self;
        match role {
            Role::Server(_) => error!("The server is always enabled."),
            Role::Client(client) => {
                let mut writer = BitWriter::new();
                enabled.ser(&mut writer);
                let server_peer = network.server_peer_id();
                network.send(server_peer, RpcChannel::SetNetworkEnabled, writer.to_bytes());
                if !enabled {
                    // Disabling is immediate; enabling waits for the server.
                    client.set_enabled(false, events);
                }
            }
            Role::NoNet(no_net) => no_net.set_enabled(enabled, events),
            Role::None => {}
        }
    }

    pub fn is_enabled(&self) -> bool {
        match &self.role {
            Role::Server(_) => true,
            Role::Client(client) => client.enabled,
            Role::NoNet(no_net) => no_net.enabled,
            Role::None => false,
        }
    }

    /// Server: park a peer outside every sync group (or restore it) and
    /// tell it about the new status.
    pub fn set_peer_networking_enable(
        &mut self,
        peer: PeerId,
        enabled: bool,
    ) -> Result<(), ConfigError> {
        let Self {
            network,
            scene,
            events,
            role,
            ..
        } = self;
        match role {
            Role::Server(server) => {
                let pd = scene
                    .peer_data
                    .get_mut(&peer)
                    .ok_or(ConfigError::UnknownPeer(peer))?;
                if pd.enabled == enabled {
                    return Ok(());
                }
                pd.enabled = enabled;
                pd.force_notify_snapshot = true;
                pd.need_full_snapshot = true;
                let destination = enabled.then_some(pd.sync_group_id);
                let result = sync_group_move_peer_to(
                    &mut server.sync_groups,
                    &mut scene.peer_data,
                    &scene.storage,
                    peer,
                    destination,
                );
                scene.peer_dirty = true;

                let mut writer = BitWriter::new();
                enabled.ser(&mut writer);
                network.send(peer, RpcChannel::NotifyPeerStatus, writer.to_bytes());
                result
            }
            Role::NoNet(no_net) => {
                no_net.set_enabled(enabled, events);
                Ok(())
            }
            _ => Err(ConfigError::WrongRole("server")),
        }
    }

    pub fn is_peer_networking_enable(&self, peer: PeerId) -> bool {
        if self.is_server() {
            if peer == self.network.server_peer_id() {
                return true;
            }
            return self
                .scene
                .peer_data
                .get(&peer)
                .map(|pd| pd.enabled)
                .unwrap_or(false);
        }
        self.is_enabled()
    }

    // ------------------------------------------------------ Peer lifecycle

    pub fn on_peer_connected(&mut self, peer: PeerId) {
        self.scene.peer_data.insert(peer, PeerData::default());
        self.events.emit_peer_status_updated(None, peer, true, false);
        self.scene.peer_dirty = true;
        if let Role::Server(server) = &mut self.role {
            server.on_peer_connected(&mut self.scene, peer);
        }
    }

    pub fn on_peer_disconnected(&mut self, peer: PeerId) {
        let handle = self
            .scene
            .peer_data
            .get(&peer)
            .and_then(|pd| self.scene.storage.find_by_net_id(pd.controller_id))
            .and_then(|id| self.scene.storage.get_object_data(id))
            .map(|od| od.handle);
        self.events
            .emit_peer_status_updated(handle, peer, false, false);
        self.scene.peer_data.remove(&peer);
        if let Role::Server(server) = &mut self.role {
            server.on_peer_disconnected(peer);
        }
    }

    pub fn clear_peers(&mut self) {
        let peers: Vec<PeerId> = self.scene.peer_data.keys().copied().collect();
        for peer in peers {
            self.on_peer_disconnected(peer);
        }
    }

    // -------------------------------------------------------- Controllers

    /// Flip an object between server-controlled and client-controlled. The
    /// server notifies the commanding peer; the role flips on both ends.
    pub fn set_server_controlled(
        &mut self,
        object: ObjectLocalId,
        server_controlled: bool,
    ) -> Result<(), ConfigError> {
        if !self.is_server() && !self.is_no_network() {
            return Err(ConfigError::WrongRole("server"));
        }
        let Some(od) = self.scene.storage.get_object_data_mut(object) else {
            return Err(ConfigError::UnknownObject(object));
        };
        let net_id = od.net_id();
        let Some(controller) = od.controller_mut() else {
            return Err(ConfigError::UnknownObject(object));
        };
        if controller.server_controlled == server_controlled {
            return Ok(());
        }
        controller.server_controlled = server_controlled;
        let peer = controller.peer();

        if self.is_server() {
            let mut writer = BitWriter::new();
            net_id.0.ser(&mut writer);
            server_controlled.ser(&mut writer);
            self.network
                .send(peer, RpcChannel::SetServerControlled, writer.to_bytes());
        }

        self.notify_controller_control_mode_changed(object);
        Ok(())
    }

    fn notify_controller_control_mode_changed(&mut self, object: ObjectLocalId) {
        if reset_controller_role(&mut self.scene, self.network.as_ref(), object) {
            if let Role::Client(client) = &mut self.role {
                client.on_controller_reset(&mut self.scene, object);
            }
        }
    }

    // --------------------------------------------------------------- RPCs

    /// server -> client: a snapshot bit buffer.
    pub fn rpc_receive_state(&mut self, data: &[u8]) {
        let Self {
            manager,
            network,
            scene,
            events,
            role,
        } = self;
        match role {
            Role::Client(client) => {
                client.receive_snapshot(scene, manager.as_mut(), network.as_mut(), events, data)
            }
            _ => error!("Only clients are supposed to receive the server snapshot."),
        }
    }

    /// client -> server: the sender lost track and needs everything again.
    pub fn rpc_notify_need_full_snapshot(&mut self, sender: PeerId) {
        if !self.is_server() {
            error!("Only the server can receive the full snapshot request.");
            return;
        }
        match self.scene.peer_data.get_mut(&sender) {
            Some(pd) => pd.need_full_snapshot = true,
            None => warn!("Full snapshot requested by the unknown peer {sender}."),
        }
    }

    /// client -> server: the sender toggles its own replication.
    pub fn rpc_set_network_enabled(&mut self, sender: PeerId, enabled: bool) {
        if !self.is_server() {
            error!("The peer enable status is supposed to be received by the server.");
            return;
        }
        if let Err(err) = self.set_peer_networking_enable(sender, enabled) {
            warn!("Failed to toggle networking for peer {sender}: {err}");
        }
    }

    /// server -> client: our replication was toggled on the server.
    pub fn rpc_notify_peer_status(&mut self, enabled: bool) {
        let Self { events, role, .. } = self;
        match role {
            Role::Client(client) => client.set_enabled(enabled, events),
            _ => error!("The peer status is supposed to be received by a client."),
        }
    }

    /// server -> client: an epoch-tagged deferred-sync packet.
    pub fn rpc_deferred_sync_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            error!("Received an empty deferred-sync packet.");
            return;
        }
        let Self { scene, role, .. } = self;
        match role {
            Role::Client(client) => client.receive_deferred_sync_data(scene, data),
            _ => error!("Only clients are supposed to receive deferred-sync data."),
        }
    }

    /// client -> server (or server -> client relay for dolls): a packed
    /// input batch from the peer commanding a controller.
    pub fn rpc_receive_input(&mut self, sender: PeerId, data: &[u8]) {
        let now_msec = self.network.relative_msec();
        let Self { scene, .. } = self;
        for object in scene.storage.controller_ids().to_vec() {
            let Some(controller) = scene
                .storage
                .get_object_data_mut(object)
                .and_then(|od| od.controller_mut())
            else {
                continue;
            };
            if controller.peer() == sender {
                controller.receive_inputs(data, now_msec);
                return;
            }
        }
        warn!("Received inputs from peer {sender}, which commands no controller.");
    }

    /// server -> client: authority over an object flipped.
    pub fn rpc_set_server_controlled(&mut self, data: &[u8]) {
        if !self.is_client() {
            error!("Only clients are supposed to receive the authority flip.");
            return;
        }
        let mut reader = BitReader::new(data);
        let (net_id, server_controlled) = match (u32::de(&mut reader), bool::de(&mut reader)) {
            (Ok(id), Ok(flag)) => (ObjectNetId(id), flag),
            _ => {
                error!("Malformed authority-flip payload; dropped.");
                return;
            }
        };
        let Some(object) = self.scene.storage.find_by_net_id(net_id) else {
            warn!("Authority flip for the unknown object {net_id:?}.");
            return;
        };
        if let Some(controller) = self
            .scene
            .storage
            .get_object_data_mut(object)
            .and_then(|od| od.controller_mut())
        {
            controller.server_controlled = server_controlled;
        }
        self.notify_controller_control_mode_changed(object);
    }

    /// server -> client: tick-rate feedback
    /// `(distance_to_optimal: i8, worst_receival_time_ms: u32)`.
    pub fn rpc_notify_fps_acceleration(&mut self, data: &[u8]) {
        let Self {
            scene,
            events,
            role,
            ..
        } = self;
        let Role::Client(client) = role else {
            error!("Only clients are supposed to receive tick-rate feedback.");
            return;
        };
        let mut reader = BitReader::new(data);
        let (distance, worst_ms) = match (i8::de(&mut reader), u32::de(&mut reader)) {
            (Ok(distance), Ok(worst)) => (distance as i32, worst),
            _ => {
                error!("Malformed tick-rate feedback payload; dropped.");
                return;
            }
        };

        let Some(player) = client.player_controller_object else {
            return;
        };
        let Some(controller) = scene
            .storage
            .get_object_data_mut(player)
            .and_then(|od| od.controller_mut())
        else {
            return;
        };
        let tick_acceleration = controller.config.tick_acceleration;
        if let Some(player_controller) = controller.player_mut() {
            let current = player_controller.frames_input_count() as i32;
            player_controller.apply_fps_acceleration(distance, tick_acceleration);
            events.emit_client_speedup_adjusted(worst_ms, current + distance, current, distance);
        }
    }

    // ---------------------------------------------------------- Accessors

    pub fn get_object_local_id(&self, handle: ObjectHandle) -> ObjectLocalId {
        self.scene.storage.find_object_local_id(handle)
    }

    pub fn get_app_object_net_id(&self, handle: ObjectHandle) -> ObjectNetId {
        let object = self.scene.storage.find_object_local_id(handle);
        self.scene
            .storage
            .get_object_data(object)
            .map(|od| od.net_id())
            .unwrap_or(ObjectNetId::NONE)
    }

    pub fn get_app_object_from_net_id(&self, net_id: ObjectNetId) -> ObjectHandle {
        self.scene
            .storage
            .find_by_net_id(net_id)
            .and_then(|id| self.scene.storage.get_object_data(id))
            .map(|od| od.handle)
            .unwrap_or(ObjectHandle::NONE)
    }

    pub fn get_object_data(&self, object: ObjectLocalId) -> Option<&ObjectData> {
        self.scene.storage.get_object_data(object)
    }

    /// The highest assigned net id, or `NONE` when no object carries one.
    pub fn get_biggest_net_id(&self) -> ObjectNetId {
        match self.scene.storage.net_id_span() {
            0 => ObjectNetId::NONE,
            span => ObjectNetId(span - 1),
        }
    }

    // ------------------------------------------------------ Role plumbing

    /// Re-select the role from the network standing, migrating net ids when
    /// the authority over id generation changes.
    pub fn reset_synchronizer_mode(&mut self) {
        let was_generating = self.scene.generate_id;
        self.uninit_synchronizer();
        self.init_synchronizer(was_generating);
    }

    fn uninit_synchronizer(&mut self) {
        if !matches!(self.role, Role::None) {
            self.manager.on_uninit_synchronizer();
        }
        self.scene.generate_id = false;
        self.role = Role::None;
    }

    fn init_synchronizer(&mut self, was_generating_ids: bool) {
        let networked = self.network.is_local_peer_networked();
        let is_server = self.network.is_local_peer_server();

        self.role = if !networked {
            self.scene.generate_id = true;
            Role::NoNet(NoNetSynchronizer::new())
        } else if is_server {
            self.scene.generate_id = true;
            Role::Server(ServerSynchronizer::new())
        } else {
            self.scene.generate_id = false;
            Role::Client(ClientSynchronizer::new(self.network.as_mut()))
        };

        // The authority over net id generation changed: mint or clear them.
        if was_generating_ids != self.scene.generate_id {
            let objects = self.scene.storage.local_ids();
            for object in objects {
                if self.scene.generate_id {
                    let net_id = ObjectNetId(object.0);
                    self.scene.storage.set_net_id(object, net_id);
                } else {
                    self.scene.storage.set_net_id(object, ObjectNetId::NONE);
                }
            }
        }

        // Replay the registered world and peers into the fresh role.
        let objects = self.scene.storage.sorted_local_ids();
        if let Role::Server(server) = &mut self.role {
            let scene = &mut self.scene;
            for object in &objects {
                server.on_object_data_added(scene, *object);
                let var_names: Vec<String> = scene
                    .storage
                    .get_object_data(*object)
                    .map(|od| od.vars.iter().map(|v| v.name.clone()).collect())
                    .unwrap_or_default();
                for name in var_names {
                    server.on_variable_added(*object, &name);
                }
            }
            let peers: Vec<PeerId> = scene.peer_data.keys().copied().collect();
            for peer in peers {
                server.on_peer_connected(scene, peer);
            }
        }

        // Reset every controller to its role under the new standing.
        for object in &objects {
            if reset_controller_role(&mut self.scene, self.network.as_ref(), *object) {
                if let Role::Client(client) = &mut self.role {
                    client.on_controller_reset(&mut self.scene, *object);
                }
            }
        }

        self.scene.process_functions_clear();
        self.manager.on_init_synchronizer(was_generating_ids);
    }

    /// Drop every object, listener and role-local queue. Peers survive.
    pub fn clear(&mut self) {
        let objects = self.scene.storage.local_ids();
        for object in objects {
            self.unregister_app_object(object);
        }
        self.scene.listeners.clear();
        match &mut self.role {
            Role::Server(server) => server.clear(),
            Role::Client(client) => client.clear(),
            Role::NoNet(no_net) => no_net.clear(),
            Role::None => {}
        }
        self.scene.process_functions_clear();
    }
}
