use log::error;

use super::object_data::ObjectData;
use crate::types::{ObjectHandle, ObjectLocalId, ObjectNetId};

/// Owns every [`ObjectData`] record. Local ids index a free-listed arena and
/// stay stable for the process lifetime; net ids index a parallel table that
/// defines the sorted order used for deterministic snapshot iteration.
#[derive(Default)]
pub struct ObjectDataStorage {
    objects: Vec<Option<ObjectData>>,
    free_local_ids: Vec<ObjectLocalId>,
    /// Indexed by net id; `ObjectLocalId::NONE` marks a gap.
    net_index: Vec<ObjectLocalId>,
    /// Local ids of objects carrying a controller, in allocation order.
    controllers: Vec<ObjectLocalId>,
}

impl ObjectDataStorage {
    pub fn allocate_object_data(&mut self) -> &mut ObjectData {
        let local_id = match self.free_local_ids.pop() {
            Some(id) => id,
            None => {
                let id = ObjectLocalId(self.objects.len() as u32);
                self.objects.push(None);
                id
            }
        };
        self.objects[local_id.index()] = Some(ObjectData::new(local_id));
        self.objects[local_id.index()].as_mut().unwrap()
    }

    pub fn deallocate_object_data(&mut self, local_id: ObjectLocalId) {
        let Some(slot) = self.objects.get_mut(local_id.index()) else {
            return;
        };
        if let Some(od) = slot.take() {
            if !od.net_id.is_none() {
                if let Some(entry) = self.net_index.get_mut(od.net_id.index()) {
                    *entry = ObjectLocalId::NONE;
                }
            }
            self.controllers.retain(|id| *id != local_id);
            self.free_local_ids.push(local_id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.objects.iter().all(|slot| slot.is_none())
    }

    /// The next unassigned net id, minted by the authoritative side.
    pub fn generate_net_id(&mut self) -> ObjectNetId {
        let id = ObjectNetId(self.net_index.len() as u32);
        self.net_index.push(ObjectLocalId::NONE);
        id
    }

    pub fn set_net_id(&mut self, local_id: ObjectLocalId, net_id: ObjectNetId) {
        let Some(od) = self.get_object_data_mut(local_id) else {
            return;
        };
        let old = od.net_id;
        od.net_id = net_id;

        if !old.is_none() {
            if let Some(entry) = self.net_index.get_mut(old.index()) {
                *entry = ObjectLocalId::NONE;
            }
        }
        if !net_id.is_none() {
            if self.net_index.len() <= net_id.index() {
                self.net_index.resize(net_id.index() + 1, ObjectLocalId::NONE);
            }
            if !self.net_index[net_id.index()].is_none()
                && self.net_index[net_id.index()] != local_id
            {
                error!(
                    "Net id {:?} is already assigned to {:?}; replacing with {:?}.",
                    net_id, self.net_index[net_id.index()], local_id
                );
                debug_assert!(false, "net id collision");
            }
            self.net_index[net_id.index()] = local_id;
        }
    }

    pub(crate) fn notify_controller_presence(&mut self, local_id: ObjectLocalId) {
        let has = self
            .get_object_data(local_id)
            .map(|od| od.controller.is_some())
            .unwrap_or(false);
        let listed = self.controllers.contains(&local_id);
        if has && !listed {
            self.controllers.push(local_id);
        } else if !has && listed {
            self.controllers.retain(|id| *id != local_id);
        }
    }

    pub fn get_object_data(&self, local_id: ObjectLocalId) -> Option<&ObjectData> {
        self.objects.get(local_id.index()).and_then(|s| s.as_ref())
    }

    pub fn get_object_data_mut(&mut self, local_id: ObjectLocalId) -> Option<&mut ObjectData> {
        self.objects.get_mut(local_id.index()).and_then(|s| s.as_mut())
    }

    pub fn find_by_net_id(&self, net_id: ObjectNetId) -> Option<ObjectLocalId> {
        self.net_index
            .get(net_id.index())
            .copied()
            .filter(|id| !id.is_none())
    }

    pub fn find_object_local_id(&self, handle: ObjectHandle) -> ObjectLocalId {
        for slot in self.objects.iter().flatten() {
            if slot.handle == handle {
                return slot.local_id();
            }
        }
        ObjectLocalId::NONE
    }

    /// The number of net-id slots ever assigned; the exclusive upper bound
    /// for sorted iteration.
    pub fn net_id_span(&self) -> u32 {
        self.net_index.len() as u32
    }

    /// All live local ids, in arbitrary order.
    pub fn local_ids(&self) -> Vec<ObjectLocalId> {
        self.objects
            .iter()
            .flatten()
            .map(|od| od.local_id())
            .collect()
    }

    /// Live local ids in net-id order, the order every snapshot walks
    /// objects in. Objects without a net id come last, in local-id order, so
    /// a client can still process objects it has not matched to the server
    /// yet.
    pub fn sorted_local_ids(&self) -> Vec<ObjectLocalId> {
        let mut out: Vec<ObjectLocalId> = self
            .net_index
            .iter()
            .copied()
            .filter(|id| !id.is_none())
            .collect();
        for slot in self.objects.iter().flatten() {
            if slot.net_id.is_none() {
                out.push(slot.local_id());
            }
        }
        out
    }

    pub fn controller_ids(&self) -> &[ObjectLocalId] {
        &self.controllers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ids_are_dense_and_reused() {
        let mut storage = ObjectDataStorage::default();
        let a = storage.allocate_object_data().local_id();
        let b = storage.allocate_object_data().local_id();
        assert_eq!(a, ObjectLocalId(0));
        assert_eq!(b, ObjectLocalId(1));

        storage.deallocate_object_data(a);
        let c = storage.allocate_object_data().local_id();
        assert_eq!(c, ObjectLocalId(0));
    }

    #[test]
    fn net_ids_are_gapless_and_define_sorted_order() {
        let mut storage = ObjectDataStorage::default();
        let a = storage.allocate_object_data().local_id();
        let b = storage.allocate_object_data().local_id();

        let net_a = storage.generate_net_id();
        storage.set_net_id(a, net_a);
        let net_b = storage.generate_net_id();
        storage.set_net_id(b, net_b);
        assert_eq!(net_a, ObjectNetId(0));
        assert_eq!(net_b, ObjectNetId(1));

        assert_eq!(storage.sorted_local_ids(), vec![a, b]);

        // Reassignment keeps the index coherent.
        storage.set_net_id(b, ObjectNetId::NONE);
        assert_eq!(storage.find_by_net_id(net_b), None);
        assert_eq!(storage.sorted_local_ids(), vec![a, b]);
    }

    #[test]
    fn deallocate_clears_the_net_index() {
        let mut storage = ObjectDataStorage::default();
        let a = storage.allocate_object_data().local_id();
        let net_a = storage.generate_net_id();
        storage.set_net_id(a, net_a);

        storage.deallocate_object_data(a);
        assert_eq!(storage.find_by_net_id(net_a), None);
        assert!(storage.is_empty());
    }
}
