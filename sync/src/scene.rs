use std::collections::BTreeMap;

use log::warn;

use crate::{
    controller::ControllerEvent,
    event::{ChangesListener, NetEventFlag},
    interface::{NetworkInterface, SynchronizerManager},
    object::ObjectDataStorage,
    peer::PeerData,
    processor::{ProcessFunc, ProcessPhase},
    sync_group::SyncGroup,
    types::{ListenerHandle, ObjectLocalId, ObjectNetId, PeerId, VarId},
    var::VarValue,
};

/// Where variable-change notifications go besides the user listeners:
/// the server records them into its sync-group change bookkeeping, the
/// client collects the end-sync candidates of a reconciliation batch.
pub(crate) enum ChangeSink<'a> {
    None,
    Server(&'a mut Vec<SyncGroup>),
    Client(&'a mut BTreeMap<(ObjectNetId, VarId), (ObjectLocalId, VarValue)>),
}

#[derive(Clone)]
pub(crate) enum ProcessEntry {
    Func(ProcessFunc),
    Controller(ObjectLocalId),
}

/// Registry state shared by every role: object storage, listeners, peers,
/// the change-batch machinery and the cached per-phase dispatchers.
pub(crate) struct SceneData {
    pub storage: ObjectDataStorage,
    pub listeners: Vec<Option<ChangesListener>>,
    pub peer_data: BTreeMap<PeerId, PeerData>,
    pub peer_dirty: bool,
    /// Whether this peer mints net ids (server and no-net modes).
    pub generate_id: bool,

    // Active change batch.
    pub event_flag: NetEventFlag,
    pub recover_in_progress: bool,
    pub reset_in_progress: bool,
    pub rewinding_in_progress: bool,
    pub end_sync: bool,

    cached_process_valid: bool,
    cached_process: [Vec<ProcessEntry>; ProcessPhase::COUNT],
    pub controller_events: Vec<ControllerEvent>,

    // Surface-level configuration.
    pub ticks_per_second: f64,
    pub state_notify_interval: f64,
    pub relevancy_update_time: f64,
    pub max_deferred_objects_per_update: usize,
}

impl SceneData {
    pub fn new() -> Self {
        Self {
            storage: ObjectDataStorage::default(),
            listeners: Vec::new(),
            peer_data: BTreeMap::new(),
            peer_dirty: false,
            generate_id: false,
            event_flag: NetEventFlag::empty(),
            recover_in_progress: false,
            reset_in_progress: false,
            rewinding_in_progress: false,
            end_sync: false,
            cached_process_valid: false,
            cached_process: Default::default(),
            controller_events: Vec::new(),
            ticks_per_second: 60.0,
            state_notify_interval: 1.0,
            relevancy_update_time: 0.5,
            max_deferred_objects_per_update: 30,
        }
    }

    pub fn tick_delta(&self) -> f64 {
        1.0 / self.ticks_per_second
    }

    // ---------------------------------------------------------- Listeners

    pub fn add_listener(&mut self, listener: ChangesListener) -> ListenerHandle {
        for (index, slot) in self.listeners.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(listener);
                return ListenerHandle(index as u32);
            }
        }
        self.listeners.push(Some(listener));
        ListenerHandle(self.listeners.len() as u32 - 1)
    }

    /// Unlink the listener from every watched variable and drop it.
    pub fn remove_listener(&mut self, handle: ListenerHandle) {
        let Some(listener) = self
            .listeners
            .get_mut(handle.index())
            .and_then(Option::take)
        else {
            return;
        };
        for watching in &listener.watching {
            if let Some(od) = self.storage.get_object_data_mut(watching.object) {
                if let Some(var) = od.vars.get_mut(watching.var.index()) {
                    var.listeners.retain(|h| *h != handle);
                }
            }
        }
    }

    // ------------------------------------------------------ Change batches

    pub fn change_events_begin(&mut self, flags: NetEventFlag) {
        debug_assert!(!self.recover_in_progress);
        debug_assert!(!self.reset_in_progress);
        debug_assert!(!self.rewinding_in_progress);
        debug_assert!(!self.end_sync);
        self.event_flag = flags;
        self.recover_in_progress = flags.intersects(NetEventFlag::SYNC_ALL);
        self.reset_in_progress = flags.intersects(NetEventFlag::SYNC_RESET);
        self.rewinding_in_progress = flags.intersects(NetEventFlag::SYNC_REWIND);
        self.end_sync = flags.intersects(NetEventFlag::END_SYNC);
    }

    /// Record one variable change into the current batch. Listeners matching
    /// the batch flag are armed to fire at flush time with `old` as the
    /// pre-batch value of this slot.
    pub fn change_event_add(
        &mut self,
        object: ObjectLocalId,
        var: VarId,
        old: VarValue,
        sink: &mut ChangeSink,
    ) {
        let Some(od) = self.storage.get_object_data(object) else {
            return;
        };
        let Some(descriptor) = od.vars.get(var.index()) else {
            return;
        };
        let var_name = descriptor.name.clone();
        let net_id = od.net_id;
        let handles = descriptor.listeners.clone();

        for handle in handles {
            let Some(listener) = self
                .listeners
                .get_mut(handle.index())
                .and_then(Option::as_mut)
            else {
                continue;
            };
            if !listener.flags.intersects(self.event_flag) {
                continue;
            }
            listener.emitted = false;
            for (index, watching) in listener.watching.iter_mut().enumerate() {
                if watching.object == object && watching.var == var {
                    watching.old_set = true;
                    listener.old_values[index] = old.clone();
                }
            }
        }

        match sink {
            ChangeSink::None => {}
            ChangeSink::Server(groups) => {
                for group in groups.iter_mut() {
                    group.notify_variable_changed(object, &var_name);
                }
            }
            ChangeSink::Client(end_sync_events) => {
                if self.event_flag.intersects(NetEventFlag::SYNC_ALL) {
                    // Keep the first old value: that is the pre-sync one.
                    end_sync_events
                        .entry((net_id, var))
                        .or_insert((object, old));
                }
            }
        }
    }

    /// Close the batch: every armed listener fires exactly once, receiving
    /// its watched variables' old values in watched order. Slots without a
    /// recorded old value default to the current value.
    pub fn change_events_flush(&mut self) {
        let Self {
            listeners, storage, ..
        } = self;
        for listener in listeners.iter_mut().flatten() {
            if listener.emitted {
                continue;
            }
            listener.emitted = true;

            for (index, watching) in listener.watching.iter_mut().enumerate() {
                if !watching.old_set {
                    listener.old_values[index] = storage
                        .get_object_data(watching.object)
                        .and_then(|od| od.vars.get(watching.var.index()))
                        .map(|v| v.value.clone())
                        .unwrap_or(VarValue::Nil);
                }
                watching.old_set = false;
            }

            (listener.callback)(&listener.old_values);
        }

        self.recover_in_progress = false;
        self.reset_in_progress = false;
        self.rewinding_in_progress = false;
        self.end_sync = false;
    }

    /// The per-tick pull: fetch every enabled variable from the host,
    /// compare with the stored value, record events on inequality.
    pub fn pull_object_changes(
        &mut self,
        manager: &mut dyn SynchronizerManager,
        network: &dyn NetworkInterface,
        object: ObjectLocalId,
        sink: &mut ChangeSink,
    ) {
        let mut changed: Vec<(VarId, VarValue)> = Vec::new();
        {
            let Some(od) = self.storage.get_object_data_mut(object) else {
                return;
            };
            let handle = od.handle;
            for descriptor in od.vars.iter_mut() {
                if !descriptor.enabled {
                    continue;
                }
                let Some(new_value) = manager.get_variable(handle, &descriptor.name) else {
                    warn!(
                        "The variable `{}` disappeared from the host object `{:?}`.",
                        descriptor.name, handle
                    );
                    continue;
                };
                if !network.compare(&descriptor.value, &new_value) {
                    let old = std::mem::replace(&mut descriptor.value, new_value);
                    changed.push((descriptor.id, old));
                }
            }
        }
        for (var, old) in changed {
            self.change_event_add(object, var, old, sink);
        }
    }

    /// Pull changes for every object and flush one batch under `flags`.
    pub fn detect_changes(
        &mut self,
        manager: &mut dyn SynchronizerManager,
        network: &dyn NetworkInterface,
        flags: NetEventFlag,
        sink: &mut ChangeSink,
    ) {
        if self.event_flag != flags {
            self.change_events_begin(flags);
        }
        for object in self.storage.local_ids() {
            self.pull_object_changes(manager, network, object, sink);
        }
        self.change_events_flush();
    }

    // --------------------------------------------------- Process pipeline

    pub fn process_functions_clear(&mut self) {
        self.cached_process_valid = false;
    }

    fn rebuild_process_cache(&mut self, is_client: bool) {
        for phase in &mut self.cached_process {
            phase.clear();
        }
        for object in self.storage.sorted_local_ids() {
            let od = self
                .storage
                .get_object_data(object)
                .expect("sorted ids are live");
            if is_client && !od.realtime_sync_enabled_on_client {
                continue;
            }
            for phase in ProcessPhase::ALL {
                if phase == ProcessPhase::Process && od.controller.is_some() {
                    self.cached_process[phase.index()].push(ProcessEntry::Controller(object));
                }
                for func in od.functions[phase.index()].funcs() {
                    self.cached_process[phase.index()].push(ProcessEntry::Func(func.clone()));
                }
            }
        }
        self.cached_process_valid = true;
    }

    /// Run one simulation step: every phase in order, objects in sorted
    /// order within a phase, controllers stepped at the head of the
    /// `Process` phase. Returns `true` when a local player produced a new
    /// input frame.
    pub fn process_functions_execute(
        &mut self,
        network: &mut dyn NetworkInterface,
        delta: f64,
        is_client: bool,
    ) -> bool {
        if !self.cached_process_valid {
            self.rebuild_process_cache(is_client);
        }

        let mut new_player_input = false;
        for phase in 0..ProcessPhase::COUNT {
            let entries = self.cached_process[phase].clone();
            for entry in entries {
                match entry {
                    ProcessEntry::Func(func) => (&mut *func.borrow_mut())(delta),
                    ProcessEntry::Controller(object) => {
                        let Self {
                            storage,
                            controller_events,
                            rewinding_in_progress,
                            ..
                        } = self;
                        if let Some(controller) = storage
                            .get_object_data_mut(object)
                            .and_then(|od| od.controller.as_mut())
                        {
                            new_player_input |= controller.process(
                                delta,
                                network,
                                controller_events,
                                *rewinding_in_progress,
                            );
                        }
                    }
                }
            }
        }
        new_player_input
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::{event::WatchingVar, object::VarDescriptor};

    fn scene_with_two_vars() -> (SceneData, ObjectLocalId) {
        let mut scene = SceneData::new();
        let object = {
            let od = scene.storage.allocate_object_data();
            od.vars
                .push(VarDescriptor::new(VarId(0), "a".into(), VarValue::Int(1)));
            od.vars
                .push(VarDescriptor::new(VarId(1), "b".into(), VarValue::Int(2)));
            od.local_id()
        };
        (scene, object)
    }

    fn watch(
        scene: &mut SceneData,
        object: ObjectLocalId,
        vars: &[VarId],
        flags: NetEventFlag,
        fired: Rc<RefCell<Vec<Vec<VarValue>>>>,
    ) -> ListenerHandle {
        let watching: Vec<WatchingVar> = vars
            .iter()
            .map(|var| WatchingVar {
                object,
                var: *var,
                old_set: false,
            })
            .collect();
        let old_values = vec![VarValue::Nil; watching.len()];
        let handle = scene.add_listener(ChangesListener {
            callback: Box::new(move |old| fired.borrow_mut().push(old.to_vec())),
            flags,
            emitted: true,
            watching,
            old_values,
        });
        for var in vars {
            let od = scene.storage.get_object_data_mut(object).unwrap();
            od.vars[var.index()].listeners.push(handle);
        }
        handle
    }

    #[test]
    fn a_listener_fires_once_per_batch_with_pre_batch_values() {
        let (mut scene, object) = scene_with_two_vars();
        let fired = Rc::new(RefCell::new(Vec::new()));
        watch(
            &mut scene,
            object,
            &[VarId(0), VarId(1)],
            NetEventFlag::DEFAULT,
            fired.clone(),
        );

        scene.change_events_begin(NetEventFlag::CHANGE);
        // Two changes of the same watched object still fire the listener
        // once; the unset slot defaults to the current value.
        scene.change_event_add(object, VarId(0), VarValue::Int(1), &mut ChangeSink::None);
        scene.change_events_flush();

        let fired = fired.borrow();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0], vec![VarValue::Int(1), VarValue::Int(2)]);
    }

    #[test]
    fn listeners_filter_batches_by_flag_mask() {
        let (mut scene, object) = scene_with_two_vars();
        let fired = Rc::new(RefCell::new(Vec::new()));
        watch(
            &mut scene,
            object,
            &[VarId(0)],
            NetEventFlag::SYNC_RECOVER,
            fired.clone(),
        );

        scene.change_events_begin(NetEventFlag::CHANGE);
        scene.change_event_add(object, VarId(0), VarValue::Int(1), &mut ChangeSink::None);
        scene.change_events_flush();
        assert!(fired.borrow().is_empty());

        scene.change_events_begin(NetEventFlag::SYNC_RECOVER);
        scene.change_event_add(object, VarId(0), VarValue::Int(7), &mut ChangeSink::None);
        scene.change_events_flush();
        assert_eq!(fired.borrow().len(), 1);
        assert_eq!(fired.borrow()[0], vec![VarValue::Int(7)]);
    }

    #[test]
    fn client_sink_keeps_the_first_old_value_of_a_sync_batch() {
        let (mut scene, object) = scene_with_two_vars();
        let net_id = scene.storage.generate_net_id();
        scene.storage.set_net_id(object, net_id);

        let mut end_sync = BTreeMap::new();
        scene.change_events_begin(NetEventFlag::SYNC_RECOVER | NetEventFlag::SYNC_REWIND);
        scene.change_event_add(
            object,
            VarId(0),
            VarValue::Int(10),
            &mut ChangeSink::Client(&mut end_sync),
        );
        scene.change_event_add(
            object,
            VarId(0),
            VarValue::Int(11),
            &mut ChangeSink::Client(&mut end_sync),
        );
        scene.change_events_flush();

        assert_eq!(end_sync.len(), 1);
        let (stored_object, old) = end_sync.get(&(net_id, VarId(0))).unwrap();
        assert_eq!(*stored_object, object);
        assert_eq!(*old, VarValue::Int(10));
    }
}
