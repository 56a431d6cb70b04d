use std::collections::{BTreeMap, VecDeque};

use log::{debug, error, trace, warn};
use resim_serde::{BitReader, Serde, UnsignedInteger};

use crate::{
    error::ProtocolError,
    event::NetEventFlag,
    interface::{NetworkInterface, RpcChannel, SynchronizerManager},
    registration::register_app_object_core,
    scene::{ChangeSink, SceneData},
    snapshot::{CompareOutcome, Snapshot},
    synchronizer::SyncEvents,
    types::{InputId, ObjectLocalId, ObjectNetId, VarId, INPUT_ID_NONE},
    var::{NameAndVar, VarValue},
};

/// Per-object deferred interpolation state: the two most recent epochs and
/// the blend cursor between them.
struct DeferredInterpolation {
    object: ObjectLocalId,
    past_buffer: Vec<u8>,
    future_buffer: Vec<u8>,
    past_epoch: u32,
    future_epoch: u32,
    alpha_step: f64,
    alpha: f64,
}

/// The predicting role: simulates ahead of the server, stores per-tick
/// snapshots, and repairs divergence through rewind-and-resimulate.
pub(crate) struct ClientSynchronizer {
    pub player_controller_object: Option<ObjectLocalId>,
    /// Names learned from snapshots, so later records can omit them.
    objects_names: BTreeMap<ObjectNetId, String>,
    /// Snapshots are incremental; the last received one is the base every
    /// new parse starts from.
    last_received_snapshot: Snapshot,
    pub client_snapshots: VecDeque<Snapshot>,
    pub server_snapshots: VecDeque<Snapshot>,
    pub last_checked_input: InputId,
    pub enabled: bool,
    want_to_enable: bool,
    need_full_snapshot_notified: bool,
    /// Variables touched during a sync batch, with their pre-batch values,
    /// keyed in net-id order for deterministic END_SYNC emission.
    sync_end_events: BTreeMap<(ObjectNetId, VarId), (ObjectLocalId, VarValue)>,
    deferred_sync: Vec<DeferredInterpolation>,
}

impl ClientSynchronizer {
    pub fn new(network: &mut dyn NetworkInterface) -> Self {
        let mut client = Self {
            player_controller_object: None,
            objects_names: BTreeMap::new(),
            last_received_snapshot: Snapshot::default(),
            client_snapshots: VecDeque::new(),
            server_snapshots: VecDeque::new(),
            last_checked_input: 0,
            enabled: true,
            want_to_enable: false,
            need_full_snapshot_notified: false,
            sync_end_events: BTreeMap::new(),
            deferred_sync: Vec::new(),
        };
        // A fresh client knows nothing; ask for everything.
        client.notify_server_full_snapshot_is_needed(network);
        client
    }

    pub fn clear(&mut self) {
        self.player_controller_object = None;
        self.objects_names.clear();
        self.last_received_snapshot = Snapshot::default();
        self.client_snapshots.clear();
        self.server_snapshots.clear();
        self.last_checked_input = 0;
        self.enabled = true;
        self.need_full_snapshot_notified = false;
        self.sync_end_events.clear();
        self.deferred_sync.clear();
    }

    pub fn process(
        &mut self,
        scene: &mut SceneData,
        manager: &mut dyn SynchronizerManager,
        network: &mut dyn NetworkInterface,
        events: &mut SyncEvents,
    ) {
        let delta = scene.tick_delta();

        self.process_simulation(scene, manager, network, delta);
        self.process_received_server_state(scene, manager, network, events, delta);
        self.signal_end_sync_changed_variables_events(scene, network);
        self.process_received_deferred_sync_data(scene, delta);

        events.drain_controller_events(scene);
    }

    // ------------------------------------------------------- Simulation

    fn process_simulation(
        &mut self,
        scene: &mut SceneData,
        manager: &mut dyn SynchronizerManager,
        network: &mut dyn NetworkInterface,
        delta: f64,
    ) {
        let Some(player) = self.player_controller_object.filter(|_| self.enabled) else {
            // No player controller; still fetch changed variables.
            scene.detect_changes(
                manager,
                network,
                NetEventFlag::CHANGE,
                &mut ChangeSink::Client(&mut self.sync_end_events),
            );
            return;
        };

        // Lag may require pretending time advances faster; the sub-tick
        // count absorbs the difference while each step still uses `delta`.
        let ticks_per_second = scene.ticks_per_second;
        let mut sub_ticks = scene
            .storage
            .get_object_data_mut(player)
            .and_then(|od| od.controller_mut())
            .and_then(|c| c.player_mut())
            .map(|p| p.calculates_sub_ticks(delta, ticks_per_second))
            .unwrap_or(0);

        if sub_ticks == 0 {
            trace!("No sub ticks this frame; the tick-rate adjustment is at work.");
        }

        while sub_ticks > 0 {
            let new_input = scene.process_functions_execute(network, delta, true);
            scene.detect_changes(
                manager,
                network,
                NetEventFlag::CHANGE,
                &mut ChangeSink::Client(&mut self.sync_end_events),
            );
            if new_input {
                self.store_snapshot(scene, manager);
            }
            sub_ticks -= 1;
        }
    }

    /// Capture the post-tick state under the input id just produced.
    fn store_snapshot(&mut self, scene: &mut SceneData, manager: &mut dyn SynchronizerManager) {
        let Some(player) = self.player_controller_object else {
            return;
        };
        let input_id = scene
            .storage
            .get_object_data(player)
            .and_then(|od| od.controller())
            .map(|c| c.current_input_id())
            .unwrap_or(INPUT_ID_NONE);

        if let Some(back) = self.client_snapshots.back() {
            debug_assert!(
                back.input_id.map(|id| id < input_id).unwrap_or(true),
                "client snapshots must be strictly increasing in input id"
            );
        }

        let mut snapshot =
            Snapshot::capture(&scene.storage, manager.snapshot_get_custom_data(None));
        snapshot.input_id = Some(input_id);
        self.client_snapshots.push_back(snapshot);
    }

    // -------------------------------------------------- Snapshot intake

    pub fn receive_snapshot(
        &mut self,
        scene: &mut SceneData,
        manager: &mut dyn SynchronizerManager,
        network: &mut dyn NetworkInterface,
        events: &mut SyncEvents,
        data: &[u8],
    ) {
        match self.parse_snapshot(scene, manager, network, events, data) {
            Ok(()) => {
                let parsed = self.last_received_snapshot.clone();
                self.store_controllers_snapshot(parsed);
            }
            Err(err) => {
                error!("Snapshot parsing failed: {err}");
            }
        }
    }

    fn parse_snapshot(
        &mut self,
        scene: &mut SceneData,
        manager: &mut dyn SynchronizerManager,
        network: &mut dyn NetworkInterface,
        events: &mut SyncEvents,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        if self.want_to_enable {
            if self.enabled {
                error!("The client is supposed to be disabled at this point.");
            }
            self.enabled = true;
            self.want_to_enable = false;
            events.emit_sync_started();
        }

        // Whatever the server sends next supersedes this request.
        self.need_full_snapshot_notified = false;

        let mut snapshot = self.last_received_snapshot.clone();
        snapshot.input_id = None;
        snapshot.custom_data = None;

        let mut reader = BitReader::new(data);

        let raw_input_id = InputId::de(&mut reader)?;
        if self.player_controller_object.is_some() && raw_input_id != INPUT_ID_NONE {
            snapshot.input_id = Some(raw_input_id);
        }

        let has_active_list = bool::de(&mut reader)?;
        let mut active_objects: Vec<ObjectNetId> = Vec::new();
        if has_active_list {
            loop {
                let id = u32::de(&mut reader)?;
                if id == ObjectNetId::NONE.0 {
                    break;
                }
                active_objects.push(ObjectNetId(id));
            }
        }

        if bool::de(&mut reader)? {
            snapshot.custom_data = Some(network.decode(&mut reader)?);
        }

        loop {
            let raw_net_id = u32::de(&mut reader)?;
            if raw_net_id == ObjectNetId::NONE.0 {
                break;
            }
            let net_id = ObjectNetId(raw_net_id);

            let mut name: Option<String> = None;
            if bool::de(&mut reader)? {
                let parsed_name = String::de(&mut reader)?;
                self.objects_names.insert(net_id, parsed_name.clone());
                name = Some(parsed_name);
            }

            let object = self.resolve_snapshot_object(scene, manager, network, net_id, name);

            let vars_count = u8::de(&mut reader)? as usize;
            match object {
                None => {
                    // Unknown object; consume its record and move on.
                    for _ in 0..vars_count {
                        if bool::de(&mut reader)? {
                            network.decode(&mut reader)?;
                        }
                    }
                }
                Some(object) => {
                    snapshot.ensure_object(net_id);
                    let od = scene
                        .storage
                        .get_object_data(object)
                        .expect("resolved objects are live");
                    if od.vars.len() != vars_count {
                        warn!(
                            "Object `{}` declares {} variable slots but the snapshot \
                             carries {}; the peers disagree on registration order.",
                            od.name,
                            od.vars.len(),
                            vars_count
                        );
                    }
                    let slot_names: Vec<Option<String>> = (0..vars_count)
                        .map(|slot| od.vars.get(slot).map(|v| v.name.clone()))
                        .collect();
                    for (slot, slot_name) in slot_names.iter().enumerate() {
                        if bool::de(&mut reader)? {
                            let value = network.decode(&mut reader)?;
                            if let Some(slot_name) = slot_name {
                                snapshot.set_var(
                                    net_id,
                                    vars_count,
                                    VarId(slot as u32),
                                    NameAndVar {
                                        name: slot_name.clone(),
                                        value,
                                    },
                                );
                            }
                        }
                    }
                }
            }
        }

        // Apply the active-object list: relevance toggles replication and
        // local processing per object.
        if has_active_list {
            let mut cache_dirty = false;
            for object in scene.storage.sorted_local_ids() {
                let Some(od) = scene.storage.get_object_data_mut(object) else {
                    continue;
                };
                if od.net_id().is_none() {
                    continue;
                }
                let net_id = od.net_id();
                let is_active = active_objects.contains(&net_id);
                if od.realtime_sync_enabled_on_client != is_active {
                    od.realtime_sync_enabled_on_client = is_active;
                    cache_dirty = true;
                }
                if is_active {
                    active_objects.retain(|id| *id != net_id);
                    self.deferred_sync.retain(|entry| entry.object != object);
                }
            }
            if cache_dirty {
                scene.process_functions_clear();
            }
            if !active_objects.is_empty() {
                error!(
                    "The snapshot lists {} active objects this peer does not know; \
                     requesting a full snapshot.",
                    active_objects.len()
                );
                self.notify_server_full_snapshot_is_needed(network);
            }
        }

        self.last_received_snapshot = snapshot;
        Ok(())
    }

    /// Find the object a snapshot record refers to, registering it through
    /// the host resolver when it is not known yet.
    fn resolve_snapshot_object(
        &mut self,
        scene: &mut SceneData,
        manager: &mut dyn SynchronizerManager,
        network: &mut dyn NetworkInterface,
        net_id: ObjectNetId,
        name: Option<String>,
    ) -> Option<ObjectLocalId> {
        if let Some(object) = scene.storage.find_by_net_id(net_id) {
            return Some(object);
        }

        let Some(name) = name.or_else(|| self.objects_names.get(&net_id).cloned()) else {
            warn!("The object with net id {net_id:?} is not known by this peer yet.");
            self.notify_server_full_snapshot_is_needed(network);
            return None;
        };

        let Some(handle) = manager.fetch_app_object(&name) else {
            warn!("The object `{name}` does not exist on this peer; requesting a full snapshot.");
            self.notify_server_full_snapshot_is_needed(network);
            return None;
        };

        let existed = !scene.storage.find_object_local_id(handle).is_none();
        let object = register_app_object_core(scene, manager, network, handle);
        if object.is_none() {
            error!("The object `{name}` resolved but could not be registered.");
            return None;
        }
        scene.storage.set_net_id(object, net_id);
        scene.process_functions_clear();
        if !existed {
            self.on_controller_reset(scene, object);
        }
        Some(object)
    }

    /// A controller role was (re)selected: adopt or release the local
    /// player controller, invalidating the prediction queues either way.
    pub fn on_controller_reset(&mut self, scene: &mut SceneData, object: ObjectLocalId) {
        if self.player_controller_object == Some(object) {
            self.player_controller_object = None;
            self.server_snapshots.clear();
            self.client_snapshots.clear();
        }

        let is_player = scene
            .storage
            .get_object_data(object)
            .and_then(|od| od.controller())
            .map(|c| c.is_player_controller())
            .unwrap_or(false);
        if !is_player {
            return;
        }
        if self.player_controller_object.is_some() {
            error!("Only one player controller per client is supported.");
            return;
        }
        self.player_controller_object = Some(object);
        self.server_snapshots.clear();
        self.client_snapshots.clear();
    }

    pub fn on_object_removed(&mut self, object: ObjectLocalId, net_id: ObjectNetId) {
        if self.player_controller_object == Some(object) {
            self.player_controller_object = None;
            self.server_snapshots.clear();
            self.client_snapshots.clear();
        }
        if let Some(vars) = self
            .last_received_snapshot
            .object_vars
            .get_mut(net_id.index())
        {
            *vars = None;
        }
        self.deferred_sync.retain(|entry| entry.object != object);
    }

    fn store_controllers_snapshot(&mut self, snapshot: Snapshot) {
        match snapshot.input_id {
            None => {
                if self.player_controller_object.is_some() {
                    // No info for this controller; skip it.
                    return;
                }
                debug!("Received a server snapshot without input id.");
                self.server_snapshots.clear();
                self.server_snapshots.push_back(snapshot);
            }
            Some(input_id) => {
                debug!("Received the server snapshot: {input_id}");
                if input_id < self.last_checked_input {
                    // Older than the reconciliation cursor; nothing to learn.
                    return;
                }
                match self.server_snapshots.back_mut() {
                    Some(back) => {
                        let back_id = back.input_id.unwrap_or(0);
                        if back_id == input_id {
                            *back = snapshot;
                        } else if input_id < back_id {
                            error!(
                                "Snapshot {input_id} arrived after {back_id}; the reliable \
                                 channel should have kept these ordered. Dropped."
                            );
                        } else {
                            self.server_snapshots.push_back(snapshot);
                        }
                    }
                    None => self.server_snapshots.push_back(snapshot),
                }
            }
        }
    }

    // ----------------------------------------------------- Reconciliation

    fn process_received_server_state(
        &mut self,
        scene: &mut SceneData,
        manager: &mut dyn SynchronizerManager,
        network: &mut dyn NetworkInterface,
        events: &mut SyncEvents,
        delta: f64,
    ) {
        if self.server_snapshots.is_empty() {
            return;
        }

        if self
            .server_snapshots
            .back()
            .map(|s| s.input_id.is_none())
            .unwrap_or(false)
        {
            // An input-less snapshot is authoritative as-is.
            let snapshot = self.server_snapshots.back().cloned().expect("checked");
            apply_snapshot(
                scene,
                manager,
                network,
                &snapshot,
                NetEventFlag::SYNC_RECOVER,
                false,
                &mut self.sync_end_events,
            );
            self.server_snapshots.clear();
            self.client_snapshots.clear();
            return;
        }

        let Some(player) = self.player_controller_object else {
            return;
        };

        // The synchronizer and the player controller store the same window.
        if let Some(back) = self.client_snapshots.back() {
            debug_assert_eq!(
                back.input_id,
                scene
                    .storage
                    .get_object_data(player)
                    .and_then(|od| od.controller())
                    .and_then(|c| c.player())
                    .map(|p| p.last_known_input())
                    .filter(|id| *id != INPUT_ID_NONE),
            );
        }

        if self.client_snapshots.is_empty() {
            // No local inputs: the stream is paused, recover to the newest
            // server state outright.
            self.process_paused_controller_recovery(scene, manager, network);
            return;
        }

        // Find the newest input id present in both queues.
        let mut checkable_input_id = INPUT_ID_NONE;
        'outer: for server_snap in self.server_snapshots.iter().rev() {
            for client_snap in &self.client_snapshots {
                if client_snap.input_id == server_snap.input_id {
                    checkable_input_id = client_snap.input_id.expect("client snapshots carry ids");
                    break 'outer;
                }
            }
        }
        if checkable_input_id == INPUT_ID_NONE {
            return;
        }

        while self
            .server_snapshots
            .front()
            .map(|s| s.input_id.unwrap_or(0) < checkable_input_id)
            .unwrap_or(false)
        {
            self.server_snapshots.pop_front();
        }
        while self
            .client_snapshots
            .front()
            .map(|s| s.input_id.unwrap_or(0) < checkable_input_id)
            .unwrap_or(false)
        {
            self.client_snapshots.pop_front();
        }

        let (outcome, divergences) = Snapshot::compare(
            self.server_snapshots.front().expect("non-empty"),
            self.client_snapshots.front().expect("non-empty"),
            &scene.storage,
            &|a, b| network.compare(a, b),
        );

        self.client_snapshots.pop_front();

        match outcome {
            CompareOutcome::Equal => {
                self.validate_input(scene, events, checkable_input_id);
            }
            CompareOutcome::Soft(partial) => {
                debug!("Soft divergence at input {checkable_input_id}; partial apply.");
                apply_snapshot(
                    scene,
                    manager,
                    network,
                    &partial,
                    NetEventFlag::SYNC_RECOVER,
                    // Partial snapshots never carry custom data.
                    true,
                    &mut self.sync_end_events,
                );
                self.refresh_newest_client_snapshot(scene, manager);
                self.validate_input(scene, events, checkable_input_id);
            }
            CompareOutcome::Hard => {
                debug!("Hard divergence at input {checkable_input_id}; rewinding.");
                for divergence in &divergences {
                    events.emit_desync_detected(checkable_input_id, divergence);
                }

                let server_snapshot =
                    self.server_snapshots.front().cloned().expect("non-empty");
                apply_snapshot(
                    scene,
                    manager,
                    network,
                    &server_snapshot,
                    NetEventFlag::SYNC_RECOVER | NetEventFlag::SYNC_RESET,
                    false,
                    &mut self.sync_end_events,
                );

                self.validate_input(scene, events, checkable_input_id);
                self.rewind(scene, manager, network, events, player, delta);
            }
        }

        self.server_snapshots.pop_front();
        self.last_checked_input = checkable_input_id;
    }

    /// Announce the acknowledged input and drop it from every controller.
    fn validate_input(
        &mut self,
        scene: &mut SceneData,
        events: &mut SyncEvents,
        input_id: InputId,
    ) {
        events.emit_state_validated(input_id);
        for object in scene.storage.controller_ids().to_vec() {
            if let Some(controller) = scene
                .storage
                .get_object_data_mut(object)
                .and_then(|od| od.controller_mut())
            {
                controller.notify_input_checked(input_id);
            }
        }
    }

    /// Replay every still-queued input on top of the authoritative state,
    /// refreshing the stored client snapshots along the way.
    fn rewind(
        &mut self,
        scene: &mut SceneData,
        manager: &mut dyn SynchronizerManager,
        network: &mut dyn NetworkInterface,
        events: &mut SyncEvents,
        player: ObjectLocalId,
        delta: f64,
    ) {
        let remaining_inputs = scene
            .storage
            .get_object_data(player)
            .and_then(|od| od.controller())
            .and_then(|c| c.player())
            .map(|p| p.frames_input_count())
            .unwrap_or(0);
        debug_assert_eq!(
            remaining_inputs,
            self.client_snapshots.len(),
            "the player controller and the snapshot queue always hold the same window"
        );

        for index in 0..remaining_inputs {
            scene.change_events_begin(NetEventFlag::SYNC_RECOVER | NetEventFlag::SYNC_REWIND);

            let input_id = scene
                .storage
                .get_object_data(player)
                .and_then(|od| od.controller())
                .and_then(|c| c.player())
                .map(|p| p.stored_input_id(index))
                .unwrap_or(INPUT_ID_NONE);

            events.emit_rewind_frame_begin(input_id, index, remaining_inputs);
            for object in scene.storage.controller_ids().to_vec() {
                if let Some(controller) = scene
                    .storage
                    .get_object_data_mut(object)
                    .and_then(|od| od.controller_mut())
                {
                    controller.queue_instant_process(input_id, index, remaining_inputs);
                }
            }

            scene.process_functions_execute(network, delta, true);
            scene.detect_changes(
                manager,
                network,
                NetEventFlag::SYNC_RECOVER | NetEventFlag::SYNC_REWIND,
                &mut ChangeSink::Client(&mut self.sync_end_events),
            );

            let mut refreshed =
                Snapshot::capture(&scene.storage, manager.snapshot_get_custom_data(None));
            refreshed.input_id = Some(input_id);
            self.client_snapshots[index] = refreshed;
        }
    }

    fn refresh_newest_client_snapshot(
        &mut self,
        scene: &mut SceneData,
        manager: &mut dyn SynchronizerManager,
    ) {
        if let Some(back) = self.client_snapshots.back_mut() {
            let input_id = back.input_id;
            let mut refreshed =
                Snapshot::capture(&scene.storage, manager.snapshot_get_custom_data(None));
            refreshed.input_id = input_id;
            *back = refreshed;
        }
    }

    /// The input stream is paused: no prediction exists, so the newest
    /// server state is installed outright.
    fn process_paused_controller_recovery(
        &mut self,
        scene: &mut SceneData,
        manager: &mut dyn SynchronizerManager,
        network: &mut dyn NetworkInterface,
    ) {
        while self.server_snapshots.len() > 1 {
            self.server_snapshots.pop_front();
        }
        let snapshot = self.server_snapshots.pop_front().expect("non-empty");
        apply_snapshot(
            scene,
            manager,
            network,
            &snapshot,
            NetEventFlag::SYNC_RECOVER,
            false,
            &mut self.sync_end_events,
        );
    }

    // ------------------------------------------------------- End of sync

    /// Second pass after a sync batch: fire `END_SYNC` for every variable
    /// whose value still differs from its pre-sync value.
    fn signal_end_sync_changed_variables_events(
        &mut self,
        scene: &mut SceneData,
        network: &dyn NetworkInterface,
    ) {
        if self.sync_end_events.is_empty() {
            return;
        }
        scene.change_events_begin(NetEventFlag::END_SYNC);
        let end_events = std::mem::take(&mut self.sync_end_events);
        for ((_, var), (object, old_value)) in end_events {
            let current = scene
                .storage
                .get_object_data(object)
                .and_then(|od| od.vars.get(var.index()))
                .map(|v| v.value.clone())
                .unwrap_or(VarValue::Nil);
            if !network.compare(&current, &old_value) {
                scene.change_event_add(object, var, old_value, &mut ChangeSink::None);
            }
        }
        scene.change_events_flush();
    }

    // ---------------------------------------------------- Deferred sync

    pub fn receive_deferred_sync_data(&mut self, scene: &mut SceneData, data: &[u8]) {
        let mut reader = BitReader::new(data);
        if reader.bits_remaining() < 32 {
            error!("Received a malformed deferred-sync packet; dropped.");
            return;
        }
        let epoch = match u32::de(&mut reader) {
            Ok(epoch) => epoch,
            Err(_) => return,
        };

        loop {
            if reader.bits_remaining() < 1 {
                break;
            }
            let parsed = (|| -> Result<(ObjectNetId, u32), ProtocolError> {
                let wide = bool::de(&mut reader)?;
                let net_id = if wide {
                    UnsignedInteger::<16>::de(&mut reader)?.get() as u32
                } else {
                    UnsignedInteger::<8>::de(&mut reader)?.get() as u32
                };
                let bit_count = UnsignedInteger::<16>::de(&mut reader)?.get() as u32;
                Ok((ObjectNetId(net_id), bit_count))
            })();
            let Ok((net_id, bit_count)) = parsed else {
                // The remainder is byte padding.
                break;
            };
            if reader.bits_remaining() < bit_count as usize {
                error!(
                    "Deferred-sync packet for object {net_id:?} declares {bit_count} bits \
                     but the buffer is shorter; the rest of the packet is dropped."
                );
                break;
            }

            let Some(object) = scene.storage.find_by_net_id(net_id) else {
                trace!("Deferred sync skipping object {net_id:?}: not known locally.");
                let _ = reader.skip_bits(bit_count);
                continue;
            };

            let future_buffer = match reader.read_bits(bit_count) {
                Ok(bits) => bits,
                Err(_) => break,
            };

            // The current local state becomes the past epoch.
            let mut past_writer = resim_serde::BitWriter::new();
            {
                let Some(hooks) = scene
                    .storage
                    .get_object_data_mut(object)
                    .and_then(|od| od.deferred.as_mut())
                else {
                    warn!("Deferred data received for {net_id:?} without epoch hooks.");
                    continue;
                };
                (hooks.collect_epoch)(&mut past_writer);
            }

            let entry = match self
                .deferred_sync
                .iter_mut()
                .position(|entry| entry.object == object)
            {
                Some(index) => &mut self.deferred_sync[index],
                None => {
                    self.deferred_sync.push(DeferredInterpolation {
                        object,
                        past_buffer: Vec::new(),
                        future_buffer: Vec::new(),
                        past_epoch: u32::MAX,
                        future_epoch: u32::MAX,
                        alpha_step: f64::MAX,
                        alpha: f64::MAX,
                    });
                    self.deferred_sync.last_mut().expect("just pushed")
                }
            };

            entry.past_buffer = past_writer.to_bytes();
            entry.future_buffer = future_buffer;
            entry.past_epoch = entry.future_epoch;
            entry.future_epoch = epoch;
            if entry.past_epoch < entry.future_epoch {
                entry.alpha = 0.0;
                entry.alpha_step = 1.0 / (entry.future_epoch - entry.past_epoch) as f64;
            } else {
                // Interpolation has not started yet (or the data is old).
                entry.alpha = f64::MAX;
                entry.alpha_step = f64::MAX;
            }
        }
    }

    fn process_received_deferred_sync_data(&mut self, scene: &mut SceneData, delta: f64) {
        for entry in &mut self.deferred_sync {
            if entry.alpha > 1.2 {
                // Not started, or the stream dried up; idle until a new
                // packet resumes it.
                continue;
            }
            entry.alpha += entry.alpha_step;

            let Some(hooks) = scene
                .storage
                .get_object_data_mut(entry.object)
                .and_then(|od| od.deferred.as_mut())
            else {
                error!("Deferred interpolation entry without epoch hooks; skipped.");
                continue;
            };

            let mut past_reader = BitReader::new(&entry.past_buffer);
            let mut future_reader = BitReader::new(&entry.future_buffer);
            (hooks.apply_epoch)(delta, entry.alpha, &mut past_reader, &mut future_reader);
        }
    }

    // ------------------------------------------------------ Enable state

    pub fn set_enabled(&mut self, enabled: bool, events: &mut SyncEvents) {
        if self.enabled == enabled {
            return;
        }
        if enabled {
            // Postpone enabling until the next server snapshot arrives.
            self.want_to_enable = true;
        } else {
            self.enabled = false;
            self.want_to_enable = false;
            events.emit_sync_paused();
        }
    }

    pub fn notify_server_full_snapshot_is_needed(&mut self, network: &mut dyn NetworkInterface) {
        if self.need_full_snapshot_notified {
            return;
        }
        self.need_full_snapshot_notified = true;
        network.send(
            network.server_peer_id(),
            RpcChannel::NotifyNeedFullSnapshot,
            Vec::new(),
        );
    }
}

/// Install a snapshot into the registry and the host, emitting one change
/// batch under `flags`. Values equal to the current state are not re-set.
fn apply_snapshot(
    scene: &mut SceneData,
    manager: &mut dyn SynchronizerManager,
    network: &dyn NetworkInterface,
    snapshot: &Snapshot,
    flags: NetEventFlag,
    skip_custom_data: bool,
    sync_end_events: &mut BTreeMap<(ObjectNetId, VarId), (ObjectLocalId, VarValue)>,
) {
    scene.change_events_begin(flags);

    for index in 0..snapshot.object_vars.len() {
        let net_id = ObjectNetId(index as u32);
        let Some(vars) = snapshot.vars_of(net_id) else {
            continue;
        };
        let Some(object) = scene.storage.find_by_net_id(net_id) else {
            // The server does not sync every object to every peer; an
            // unknown record here is expected.
            continue;
        };

        let mut changed: Vec<(VarId, String, VarValue, VarValue)> = Vec::new();
        {
            let Some(od) = scene.storage.get_object_data_mut(object) else {
                continue;
            };
            if !od.realtime_sync_enabled_on_client {
                continue;
            }
            for (slot, entry) in vars.iter().enumerate() {
                let Some(entry) = entry else {
                    continue;
                };
                let Some(descriptor) = od.vars.get_mut(slot) else {
                    continue;
                };
                let current = std::mem::replace(&mut descriptor.value, entry.value.clone());
                if !network.compare(&current, &entry.value) {
                    changed.push((
                        VarId(slot as u32),
                        entry.name.clone(),
                        entry.value.clone(),
                        current,
                    ));
                }
            }
        }

        let handle = scene
            .storage
            .get_object_data(object)
            .map(|od| od.handle)
            .expect("object is live");
        for (var, name, value, old) in changed {
            manager.set_variable(handle, &name, &value);
            scene.change_event_add(object, var, old, &mut ChangeSink::Client(sync_end_events));
        }
    }

    if let Some(custom) = snapshot.custom_data.as_ref() {
        if !skip_custom_data {
            manager.snapshot_set_custom_data(custom);
        }
    }

    scene.change_events_flush();
}
