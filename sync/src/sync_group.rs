use std::collections::HashSet;

use crate::types::{ObjectLocalId, PeerId};

/// Per-(group, object) change record: whether the group's clients know the
/// object at all, and which variable names changed since the last
/// acknowledged checkpoint.
#[derive(Debug, Clone, Default)]
pub struct Change {
    pub unknown: bool,
    pub vars: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct RealtimeObjectInfo {
    pub id: ObjectLocalId,
    pub change: Change,
}

impl RealtimeObjectInfo {
    pub fn new(id: ObjectLocalId) -> Self {
        Self {
            id,
            change: Change {
                unknown: true,
                vars: HashSet::new(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeferredObjectInfo {
    pub id: ObjectLocalId,
    /// Fraction of an update earned per tick; the object is streamed when
    /// the accumulated priority reaches one.
    pub update_rate: f32,
    pub update_priority: f32,
    pub unknown: bool,
}

impl DeferredObjectInfo {
    pub fn new(id: ObjectLocalId, update_rate: f32) -> Self {
        Self {
            id,
            update_rate,
            update_priority: 0.0,
            unknown: true,
        }
    }
}

/// A relevance partition: the realtime and deferred objects a set of peers
/// receives, with per-object change bookkeeping.
#[derive(Default)]
pub struct SyncGroup {
    realtime: Vec<RealtimeObjectInfo>,
    deferred: Vec<DeferredObjectInfo>,
    pub peers: Vec<PeerId>,
    pub state_notifier_timer: f64,
    pub user_data: u64,
    realtime_list_changed: bool,
    deferred_list_changed: bool,
}

impl SyncGroup {
    pub fn realtime_sync_objects(&self) -> &[RealtimeObjectInfo] {
        &self.realtime
    }

    pub fn deferred_sync_objects(&self) -> &[DeferredObjectInfo] {
        &self.deferred
    }

    pub fn deferred_sync_objects_mut(&mut self) -> &mut [DeferredObjectInfo] {
        &mut self.deferred
    }

    pub fn is_realtime_object_list_changed(&self) -> bool {
        self.realtime_list_changed
    }

    pub fn is_deferred_object_list_changed(&self) -> bool {
        self.deferred_list_changed
    }

    pub fn contains_object(&self, id: ObjectLocalId) -> bool {
        self.realtime.iter().any(|info| info.id == id)
            || self.deferred.iter().any(|info| info.id == id)
    }

    /// Add an object to the realtime or deferred list. An object already in
    /// the other list is moved, keeping group membership exclusive.
    pub fn add_object(&mut self, id: ObjectLocalId, realtime: bool) {
        if realtime {
            if self.realtime.iter().any(|info| info.id == id) {
                return;
            }
            if let Some(index) = self.deferred.iter().position(|info| info.id == id) {
                self.deferred.remove(index);
                self.deferred_list_changed = true;
            }
            self.realtime.push(RealtimeObjectInfo::new(id));
            self.realtime_list_changed = true;
        } else {
            if self.deferred.iter().any(|info| info.id == id) {
                return;
            }
            if let Some(index) = self.realtime.iter().position(|info| info.id == id) {
                self.realtime.remove(index);
                self.realtime_list_changed = true;
            }
            self.deferred.push(DeferredObjectInfo::new(id, 1.0));
            self.deferred_list_changed = true;
        }
    }

    pub fn remove_object(&mut self, id: ObjectLocalId) {
        if let Some(index) = self.realtime.iter().position(|info| info.id == id) {
            self.realtime.remove(index);
            self.realtime_list_changed = true;
        }
        if let Some(index) = self.deferred.iter().position(|info| info.id == id) {
            self.deferred.remove(index);
            self.deferred_list_changed = true;
        }
    }

    pub fn remove_all_objects(&mut self) {
        if !self.realtime.is_empty() {
            self.realtime.clear();
            self.realtime_list_changed = true;
        }
        if !self.deferred.is_empty() {
            self.deferred.clear();
            self.deferred_list_changed = true;
        }
    }

    /// Atomically replace both object lists. Objects surviving the
    /// replacement keep their change records and accumulated priorities;
    /// newcomers start unknown.
    pub fn replace_objects(
        &mut self,
        new_realtime: Vec<ObjectLocalId>,
        new_deferred: Vec<(ObjectLocalId, f32)>,
    ) {
        let old_realtime = std::mem::take(&mut self.realtime);
        let old_deferred = std::mem::take(&mut self.deferred);

        self.realtime = new_realtime
            .into_iter()
            .map(|id| {
                old_realtime
                    .iter()
                    .find(|info| info.id == id)
                    .cloned()
                    .unwrap_or_else(|| RealtimeObjectInfo::new(id))
            })
            .collect();

        self.deferred = new_deferred
            .into_iter()
            .map(|(id, update_rate)| {
                let mut info = old_deferred
                    .iter()
                    .find(|info| info.id == id)
                    .cloned()
                    .unwrap_or_else(|| DeferredObjectInfo::new(id, update_rate));
                info.update_rate = update_rate;
                info
            })
            .collect();

        self.realtime_list_changed = true;
        self.deferred_list_changed = true;
    }

    pub fn notify_new_variable(&mut self, id: ObjectLocalId, var_name: &str) {
        if let Some(info) = self.realtime.iter_mut().find(|info| info.id == id) {
            info.change.vars.insert(var_name.to_string());
        }
    }

    pub fn notify_variable_changed(&mut self, id: ObjectLocalId, var_name: &str) {
        if let Some(info) = self.realtime.iter_mut().find(|info| info.id == id) {
            info.change.vars.insert(var_name.to_string());
        }
    }

    /// A state checkpoint was emitted: from here on only new changes count.
    pub fn mark_changes_as_notified(&mut self) {
        for info in &mut self.realtime {
            info.change.unknown = false;
            info.change.vars.clear();
        }
        for info in &mut self.deferred {
            info.unknown = false;
        }
        self.realtime_list_changed = false;
        self.deferred_list_changed = false;
    }

    pub fn set_deferred_update_rate(&mut self, id: ObjectLocalId, update_rate: f32) {
        if let Some(info) = self.deferred.iter_mut().find(|info| info.id == id) {
            info.update_rate = update_rate;
        }
    }

    pub fn deferred_update_rate(&self, id: ObjectLocalId) -> f32 {
        self.deferred
            .iter()
            .find(|info| info.id == id)
            .map(|info| info.update_rate)
            .unwrap_or(0.0)
    }

    pub fn sort_deferred_by_update_priority(&mut self) {
        self.deferred.sort_by(|a, b| {
            b.update_priority
                .partial_cmp(&a.update_priority)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
}
