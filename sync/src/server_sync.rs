use std::collections::BTreeMap;

use log::error;
use resim_serde::{overlay_head_u32, BitWriter, Serde, UnsignedInteger};

use crate::{
    error::ConfigError,
    event::NetEventFlag,
    interface::{NetworkInterface, RpcChannel, SynchronizerManager},
    object::ObjectDataStorage,
    peer::PeerData,
    scene::{ChangeSink, SceneData},
    sync_group::{Change, SyncGroup},
    synchronizer::SyncEvents,
    types::{
        ObjectLocalId, ObjectNetId, PeerId, SyncGroupId, GLOBAL_SYNC_GROUP_ID, INPUT_ID_NONE,
    },
};

/// How much of an object record a snapshot carries.
#[derive(Clone, Copy, PartialEq, Eq)]
enum SnapshotGenerationMode {
    /// Net id (or name when unknown) plus the changed variables.
    Normal,
    /// Name only, every variable slot empty. Used to introduce deferred-only
    /// objects to a peer.
    ForceNamePathOnly,
    /// Everything, no matter what.
    ForceFull,
}

/// The authoritative role: advances the simulation, detects changes, emits
/// per-group snapshots and streams deferred epochs.
pub(crate) struct ServerSynchronizer {
    relevancy_update_timer: f64,
    epoch: u32,
    pub sync_groups: Vec<SyncGroup>,
}

impl ServerSynchronizer {
    pub fn new() -> Self {
        Self {
            relevancy_update_timer: 0.0,
            epoch: 0,
            // Group 0 exists from the start and receives every object.
            sync_groups: vec![SyncGroup::default()],
        }
    }

    pub fn clear(&mut self) {
        self.relevancy_update_timer = 0.0;
        self.sync_groups = vec![SyncGroup::default()];
    }

    pub fn process(
        &mut self,
        scene: &mut SceneData,
        manager: &mut dyn SynchronizerManager,
        network: &mut dyn NetworkInterface,
        events: &mut SyncEvents,
    ) {
        self.update_peers(scene, events);

        let delta = scene.tick_delta();

        if self.relevancy_update_timer >= scene.relevancy_update_time {
            let mut relevancy = RelevancyContext {
                sync_groups: &mut self.sync_groups,
                peer_data: &mut scene.peer_data,
                storage: &scene.storage,
            };
            manager.update_objects_relevancy(&mut relevancy);
            self.relevancy_update_timer = 0.0;
        }
        self.relevancy_update_timer += delta;

        self.epoch = self.epoch.wrapping_add(1);

        scene.process_functions_execute(network, delta, false);
        scene.detect_changes(
            manager,
            network,
            NetEventFlag::CHANGE,
            &mut ChangeSink::Server(&mut self.sync_groups),
        );

        self.process_snapshot_notificator(scene, manager, network, delta);
        self.process_deferred_sync(scene, network);

        events.drain_controller_events(scene);
    }

    // ------------------------------------------------------ Peer lifecycle

    pub fn on_peer_connected(&mut self, scene: &mut SceneData, peer: PeerId) {
        if let Err(err) = sync_group_move_peer_to(
            &mut self.sync_groups,
            &mut scene.peer_data,
            &scene.storage,
            peer,
            Some(GLOBAL_SYNC_GROUP_ID),
        ) {
            error!("Failed to place the connecting peer {peer} in the global group: {err}");
        }
    }

    pub fn on_peer_disconnected(&mut self, peer: PeerId) {
        for group in &mut self.sync_groups {
            group.peers.retain(|p| *p != peer);
        }
    }

    /// Validate and (re)associate each peer with its controller object,
    /// propagating the per-peer enable flag.
    fn update_peers(&mut self, scene: &mut SceneData, events: &mut SyncEvents) {
        if !scene.peer_dirty {
            return;
        }
        scene.peer_dirty = false;

        let SceneData {
            peer_data, storage, ..
        } = scene;

        for (peer, pd) in peer_data.iter_mut() {
            if !pd.controller_id.is_none() {
                let still_valid = storage
                    .find_by_net_id(pd.controller_id)
                    .and_then(|id| storage.get_object_data(id))
                    .and_then(|od| od.controller())
                    .map(|c| c.peer() == *peer)
                    .unwrap_or(false);
                if !still_valid {
                    pd.controller_id = ObjectNetId::NONE;
                }
            }
            if pd.controller_id.is_none() {
                for object in storage.controller_ids().to_vec() {
                    let Some(od) = storage.get_object_data(object) else {
                        continue;
                    };
                    if od.controller().map(|c| c.peer()) == Some(*peer) {
                        pd.controller_id = od.net_id();
                        break;
                    }
                }
            }

            if let Some(object) = storage.find_by_net_id(pd.controller_id) {
                if let Some(od) = storage.get_object_data_mut(object) {
                    od.realtime_sync_enabled_on_client = pd.enabled;
                    let handle = od.handle;
                    if let Some(server) = od.controller_mut().and_then(|c| c.server()) {
                        server.on_peer_update(pd.enabled);
                    }
                    events.emit_peer_status_updated(Some(handle), *peer, true, pd.enabled);
                }
            }
        }
    }

    // -------------------------------------------------- Object lifecycle

    pub fn on_object_data_added(&mut self, scene: &mut SceneData, object: ObjectLocalId) {
        self.sync_groups[GLOBAL_SYNC_GROUP_ID.index()].add_object(object, true);

        // A fresh controller object: its commanding peer needs a full
        // snapshot carrying it as soon as possible.
        let controller_peer = scene
            .storage
            .get_object_data(object)
            .and_then(|od| od.controller())
            .map(|c| c.peer());
        if let Some(peer) = controller_peer {
            if let Some(pd) = scene.peer_data.get_mut(&peer) {
                pd.force_notify_snapshot = true;
                pd.need_full_snapshot = true;
            }
        }
    }

    pub fn on_object_data_removed(&mut self, object: ObjectLocalId) {
        for group in &mut self.sync_groups {
            group.remove_object(object);
        }
    }

    pub fn on_variable_added(&mut self, object: ObjectLocalId, var_name: &str) {
        for group in &mut self.sync_groups {
            group.notify_new_variable(object, var_name);
        }
    }

    // ----------------------------------------------------- Sync group API

    pub fn sync_group_create(&mut self) -> SyncGroupId {
        let id = SyncGroupId(self.sync_groups.len() as u32);
        self.sync_groups.push(SyncGroup::default());
        id
    }

    pub fn group(&self, group_id: SyncGroupId) -> Result<&SyncGroup, ConfigError> {
        self.sync_groups
            .get(group_id.index())
            .ok_or(ConfigError::UnknownSyncGroup(group_id))
    }

    pub fn group_mut_user(&mut self, group_id: SyncGroupId) -> Result<&mut SyncGroup, ConfigError> {
        if group_id == GLOBAL_SYNC_GROUP_ID {
            return Err(ConfigError::GlobalGroupImmutable);
        }
        self.sync_groups
            .get_mut(group_id.index())
            .ok_or(ConfigError::UnknownSyncGroup(group_id))
    }

    // ------------------------------------------------ Snapshot notificator

    fn process_snapshot_notificator(
        &mut self,
        scene: &mut SceneData,
        manager: &mut dyn SynchronizerManager,
        network: &mut dyn NetworkInterface,
        delta: f64,
    ) {
        if scene.peer_data.is_empty() {
            // No one is listening.
            return;
        }

        for group_index in 0..self.sync_groups.len() {
            let group_id = SyncGroupId(group_index as u32);
            if self.sync_groups[group_index].peers.is_empty() {
                continue;
            }

            self.sync_groups[group_index].state_notifier_timer += delta;
            let notify_state = self.sync_groups[group_index].state_notifier_timer
                >= scene.state_notify_interval;
            if notify_state {
                self.sync_groups[group_index].state_notifier_timer = 0.0;
            }

            // Generated lazily and shared by every peer of the group that
            // needs the same kind.
            let mut full_snapshot: Option<Vec<u8>> = None;
            let mut delta_snapshot: Option<Vec<u8>> = None;

            let peers = self.sync_groups[group_index].peers.clone();
            for peer in peers {
                let Some(pd) = scene.peer_data.get_mut(&peer) else {
                    error!(
                        "Snapshot emission found peer {peer} in group {group_id:?} \
                         but no peer data; it was removed without clearing the group."
                    );
                    continue;
                };
                if !pd.force_notify_snapshot && !notify_state {
                    continue;
                }
                pd.force_notify_snapshot = false;
                let need_full = pd.need_full_snapshot;
                pd.need_full_snapshot = false;
                let controller_id = pd.controller_id;

                let input_id = scene
                    .storage
                    .find_by_net_id(controller_id)
                    .and_then(|id| scene.storage.get_object_data(id))
                    .and_then(|od| od.controller())
                    .map(|c| c.current_input_id())
                    .unwrap_or(INPUT_ID_NONE);

                let group = &self.sync_groups[group_index];
                let bytes = if need_full {
                    full_snapshot.get_or_insert_with(|| {
                        generate_snapshot(true, group_id, group, &scene.storage, manager, network)
                    })
                } else {
                    delta_snapshot.get_or_insert_with(|| {
                        generate_snapshot(false, group_id, group, &scene.storage, manager, network)
                    })
                };

                // Each recipient sees its own acknowledged input id.
                let mut payload = bytes.clone();
                overlay_head_u32(&mut payload, input_id);
                network.send(peer, RpcChannel::ReceiveState, payload);

                if let Some(server) = scene
                    .storage
                    .find_by_net_id(controller_id)
                    .and_then(|id| scene.storage.get_object_data_mut(id))
                    .and_then(|od| od.controller_mut())
                    .and_then(|c| c.server())
                {
                    server.notify_send_state();
                }
            }

            if notify_state {
                // The state got notified; from here on only new changes
                // matter for this group.
                self.sync_groups[group_index].mark_changes_as_notified();
            }
        }
    }

    // --------------------------------------------------- Deferred stream

    fn process_deferred_sync(&mut self, scene: &mut SceneData, network: &mut dyn NetworkInterface) {
        let epoch = self.epoch;
        for group in &mut self.sync_groups {
            if group.peers.is_empty() || group.deferred_sync_objects().is_empty() {
                continue;
            }

            group.sort_deferred_by_update_priority();

            let mut writer = BitWriter::new();
            epoch.ser(&mut writer);
            let mut update_count = 0usize;

            for info in group.deferred_sync_objects_mut() {
                let ready = info.update_priority >= 1.0
                    && update_count < scene.max_deferred_objects_per_update;
                if !ready {
                    info.update_priority += info.update_rate;
                    continue;
                }

                let Some(od) = scene.storage.get_object_data_mut(info.id) else {
                    continue;
                };
                let net_id = od.net_id();
                if net_id.is_none() || net_id.0 > u16::MAX as u32 {
                    error!(
                        "Deferred sync cannot address object `{}` (net id {net_id:?}).",
                        od.name
                    );
                    continue;
                }
                let name = od.name.clone();
                let Some(hooks) = od.deferred.as_mut() else {
                    error!(
                        "Object `{name}` is in a deferred list without epoch hooks; \
                         use `setup_deferred_sync` to initialize it."
                    );
                    continue;
                };

                let mut epoch_buffer = BitWriter::new();
                (hooks.collect_epoch)(&mut epoch_buffer);
                let bit_count = epoch_buffer.bits_written();
                if bit_count > u16::MAX as u32 {
                    error!(
                        "Deferred epoch of `{name}` collected {bit_count} bits, more \
                         than the {} bit per-object limit; the update is dropped.",
                        u16::MAX
                    );
                    continue;
                }

                info.update_priority = 0.0;
                update_count += 1;

                if net_id.0 > u8::MAX as u32 {
                    true.ser(&mut writer);
                    UnsignedInteger::<16>::new(net_id.0).ser(&mut writer);
                } else {
                    false.ser(&mut writer);
                    UnsignedInteger::<8>::new(net_id.0).ser(&mut writer);
                }
                UnsignedInteger::<16>::new(bit_count).ser(&mut writer);
                writer.write_bits(&epoch_buffer.to_bytes(), bit_count);
            }

            if update_count > 0 {
                let payload = writer.to_bytes();
                for peer in &group.peers {
                    network.send(*peer, RpcChannel::DeferredSyncData, payload.clone());
                }
            }
        }
    }
}

// ------------------------------------------------------------------------
// Snapshot generation

fn generate_snapshot(
    force_full: bool,
    group_id: SyncGroupId,
    group: &SyncGroup,
    storage: &ObjectDataStorage,
    manager: &mut dyn SynchronizerManager,
    network: &dyn NetworkInterface,
) -> Vec<u8> {
    let mut writer = BitWriter::new();

    // Overlaid per recipient just before sending.
    INPUT_ID_NONE.ser(&mut writer);

    // The list of every simulated object of the group, when changed.
    if group.is_realtime_object_list_changed() || force_full {
        true.ser(&mut writer);
        for info in group.realtime_sync_objects() {
            let Some(od) = storage.get_object_data(info.id) else {
                continue;
            };
            debug_assert!(!od.net_id().is_none());
            od.net_id().0.ser(&mut writer);
        }
        ObjectNetId::NONE.0.ser(&mut writer);
    } else {
        false.ser(&mut writer);
    }

    match manager.snapshot_get_custom_data(Some(group_id)) {
        Some(custom) => {
            true.ser(&mut writer);
            network.encode(&mut writer, &custom);
        }
        None => false.ser(&mut writer),
    }

    // Introduce deferred-only objects by name so clients can resolve them.
    if group.is_deferred_object_list_changed() || force_full {
        for info in group.deferred_sync_objects() {
            if info.unknown || force_full {
                if let Some(od) = storage.get_object_data(info.id) {
                    generate_snapshot_object_data(
                        od,
                        SnapshotGenerationMode::ForceNamePathOnly,
                        &Change::default(),
                        network,
                        &mut writer,
                    );
                }
            }
        }
    }

    let mode = if force_full {
        SnapshotGenerationMode::ForceFull
    } else {
        SnapshotGenerationMode::Normal
    };
    for info in group.realtime_sync_objects() {
        if let Some(od) = storage.get_object_data(info.id) {
            generate_snapshot_object_data(od, mode, &info.change, network, &mut writer);
        }
    }

    ObjectNetId::NONE.0.ser(&mut writer);
    writer.to_bytes()
}

fn generate_snapshot_object_data(
    od: &crate::object::ObjectData,
    mode: SnapshotGenerationMode,
    change: &Change,
    network: &dyn NetworkInterface,
    writer: &mut BitWriter,
) {
    if od.handle == crate::types::ObjectHandle::NONE || od.net_id().is_none() {
        return;
    }

    let force_name = mode != SnapshotGenerationMode::Normal;
    let path_only = mode == SnapshotGenerationMode::ForceNamePathOnly;
    let force_full = mode == SnapshotGenerationMode::ForceFull;

    od.net_id().0.ser(writer);

    if force_name || change.unknown {
        true.ser(writer);
        od.name.ser(writer);
    } else {
        false.ser(writer);
    }

    // Declared so the client can walk the record even when it does not know
    // the object yet.
    debug_assert!(od.vars.len() <= u8::MAX as usize);
    (od.vars.len() as u8).ser(writer);

    for descriptor in &od.vars {
        let has_value = !path_only
            && descriptor.enabled
            && (force_full || change.unknown || change.vars.contains(&descriptor.name));
        has_value.ser(writer);
        if has_value {
            network.encode(writer, &descriptor.value);
        }
    }
}

// ------------------------------------------------------------------------
// Group/peer plumbing shared with the relevancy hook

/// Move a peer into a group (or out of every group with `None`). The peer
/// gets a forced full snapshot either way, and its controller object joins
/// the destination group's realtime list.
pub(crate) fn sync_group_move_peer_to(
    sync_groups: &mut [SyncGroup],
    peer_data: &mut BTreeMap<PeerId, PeerData>,
    storage: &ObjectDataStorage,
    peer: PeerId,
    group_id: Option<SyncGroupId>,
) -> Result<(), ConfigError> {
    for group in sync_groups.iter_mut() {
        group.peers.retain(|p| *p != peer);
    }

    let Some(group_id) = group_id else {
        // This peer is not listening to anything.
        return Ok(());
    };

    let group = sync_groups
        .get_mut(group_id.index())
        .ok_or(ConfigError::UnknownSyncGroup(group_id))?;
    group.peers.push(peer);

    let pd = peer_data
        .get_mut(&peer)
        .ok_or(ConfigError::UnknownPeer(peer))?;
    pd.force_notify_snapshot = true;
    pd.need_full_snapshot = true;

    if let Some(object) = storage.find_by_net_id(pd.controller_id) {
        group.add_object(object, true);
    }

    Ok(())
}

/// Server-side view handed to the host's relevancy hook: group membership
/// and peer placement, without the rest of the synchronizer surface.
pub struct RelevancyContext<'a> {
    pub(crate) sync_groups: &'a mut Vec<SyncGroup>,
    pub(crate) peer_data: &'a mut BTreeMap<PeerId, PeerData>,
    pub(crate) storage: &'a ObjectDataStorage,
}

impl RelevancyContext<'_> {
    pub fn peers(&self) -> Vec<PeerId> {
        self.peer_data.keys().copied().collect()
    }

    pub fn peer_group(&self, peer: PeerId) -> Option<SyncGroupId> {
        self.peer_data.get(&peer).map(|pd| pd.sync_group_id)
    }

    pub fn sync_group_create(&mut self) -> SyncGroupId {
        let id = SyncGroupId(self.sync_groups.len() as u32);
        self.sync_groups.push(SyncGroup::default());
        id
    }

    pub fn sync_group_move_peer_to(
        &mut self,
        peer: PeerId,
        group_id: SyncGroupId,
    ) -> Result<(), ConfigError> {
        if let Some(pd) = self.peer_data.get_mut(&peer) {
            if pd.sync_group_id == group_id {
                return Ok(());
            }
            pd.sync_group_id = group_id;
        }
        sync_group_move_peer_to(
            self.sync_groups,
            self.peer_data,
            self.storage,
            peer,
            Some(group_id),
        )
    }

    pub fn sync_group_add_object(
        &mut self,
        object: ObjectNetId,
        group_id: SyncGroupId,
        realtime: bool,
    ) -> Result<(), ConfigError> {
        if group_id == GLOBAL_SYNC_GROUP_ID {
            return Err(ConfigError::GlobalGroupImmutable);
        }
        let local = self
            .storage
            .find_by_net_id(object)
            .ok_or(ConfigError::UnknownObject(ObjectLocalId::NONE))?;
        self.sync_groups
            .get_mut(group_id.index())
            .ok_or(ConfigError::UnknownSyncGroup(group_id))?
            .add_object(local, realtime);
        Ok(())
    }

    pub fn sync_group_remove_object(
        &mut self,
        object: ObjectNetId,
        group_id: SyncGroupId,
    ) -> Result<(), ConfigError> {
        if group_id == GLOBAL_SYNC_GROUP_ID {
            return Err(ConfigError::GlobalGroupImmutable);
        }
        let local = self
            .storage
            .find_by_net_id(object)
            .ok_or(ConfigError::UnknownObject(ObjectLocalId::NONE))?;
        self.sync_groups
            .get_mut(group_id.index())
            .ok_or(ConfigError::UnknownSyncGroup(group_id))?
            .remove_object(local);
        Ok(())
    }

    pub fn sync_group_set_deferred_update_rate(
        &mut self,
        object: ObjectNetId,
        group_id: SyncGroupId,
        update_rate: f32,
    ) -> Result<(), ConfigError> {
        if group_id == GLOBAL_SYNC_GROUP_ID {
            return Err(ConfigError::GlobalGroupImmutable);
        }
        let local = self
            .storage
            .find_by_net_id(object)
            .ok_or(ConfigError::UnknownObject(ObjectLocalId::NONE))?;
        self.sync_groups
            .get_mut(group_id.index())
            .ok_or(ConfigError::UnknownSyncGroup(group_id))?
            .set_deferred_update_rate(local, update_rate);
        Ok(())
    }
}
