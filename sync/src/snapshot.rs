use crate::{
    object::ObjectDataStorage,
    types::{InputId, ObjectHandle, ObjectNetId, VarId},
    var::{NameAndVar, VarValue},
};

/// One tick's captured world state: per-object variable values indexed by
/// net id, plus the input id the state corresponds to and an optional
/// application-defined payload.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub input_id: Option<InputId>,
    /// Outer index: net id. `None` for objects this snapshot says nothing
    /// about. Inner `None` for variable slots the snapshot does not carry.
    pub object_vars: Vec<Option<Vec<Option<NameAndVar>>>>,
    pub custom_data: Option<VarValue>,
}

/// Detail of one diverged object, carried by the desync event.
#[derive(Debug, Clone)]
pub struct ObjectDivergence {
    pub net_id: ObjectNetId,
    pub handle: ObjectHandle,
    pub var_names: Vec<String>,
    pub client_values: Vec<VarValue>,
    pub server_values: Vec<VarValue>,
}

/// Result of matching a server snapshot against the client's own capture of
/// the same input id.
pub enum CompareOutcome {
    /// Prediction confirmed.
    Equal,
    /// Only variables flagged `skip_rewinding` differ; the carried partial
    /// snapshot installs the server values without a rewind.
    Soft(Snapshot),
    /// At least one simulated variable differs; a full apply plus rewind is
    /// required.
    Hard,
}

impl Snapshot {
    /// Capture the current registry state: every realtime-enabled object
    /// with a known net id contributes its enabled variables.
    pub fn capture(storage: &ObjectDataStorage, custom_data: Option<VarValue>) -> Self {
        let span = storage.net_id_span() as usize;
        let mut object_vars = vec![None; span];

        for net_id in 0..span as u32 {
            let Some(local_id) = storage.find_by_net_id(ObjectNetId(net_id)) else {
                continue;
            };
            let od = storage
                .get_object_data(local_id)
                .expect("net index points at a live object");
            if !od.realtime_sync_enabled_on_client {
                continue;
            }

            let vars = od
                .vars
                .iter()
                .map(|v| {
                    v.enabled.then(|| NameAndVar {
                        name: v.name.clone(),
                        value: v.value.clone(),
                    })
                })
                .collect();
            object_vars[net_id as usize] = Some(vars);
        }

        Self {
            input_id: None,
            object_vars,
            custom_data,
        }
    }

    pub fn vars_of(&self, net_id: ObjectNetId) -> Option<&Vec<Option<NameAndVar>>> {
        self.object_vars.get(net_id.index()).and_then(|o| o.as_ref())
    }

    /// Compare a server-authoritative snapshot against the locally predicted
    /// one. Walks the server's content only: variables the server did not
    /// send are not checked. `value_eq` is the host's equality (it may apply
    /// a float tolerance).
    pub fn compare(
        server: &Snapshot,
        client: &Snapshot,
        storage: &ObjectDataStorage,
        value_eq: &dyn Fn(&VarValue, &VarValue) -> bool,
    ) -> (CompareOutcome, Vec<ObjectDivergence>) {
        let mut partial = Snapshot {
            input_id: None,
            object_vars: vec![None; server.object_vars.len()],
            custom_data: None,
        };
        let mut has_soft = false;
        let mut has_hard = false;
        let mut divergences = Vec::new();

        for (index, server_vars) in server.object_vars.iter().enumerate() {
            let net_id = ObjectNetId(index as u32);
            let Some(server_vars) = server_vars else {
                continue;
            };
            let Some(local_id) = storage.find_by_net_id(net_id) else {
                // The object got unregistered since this snapshot was taken;
                // there is nothing to diverge from.
                continue;
            };
            let od = storage
                .get_object_data(local_id)
                .expect("net index points at a live object");

            let client_vars = client.vars_of(net_id);
            let mut detail: Option<ObjectDivergence> = None;

            for (slot, server_var) in server_vars.iter().enumerate() {
                let Some(server_var) = server_var else {
                    continue;
                };
                let client_value = client_vars
                    .and_then(|vars| vars.get(slot))
                    .and_then(|v| v.as_ref())
                    .map(|v| &v.value);

                let equal = client_value
                    .map(|cv| value_eq(cv, &server_var.value))
                    .unwrap_or(false);
                if equal {
                    continue;
                }

                let skip_rewinding = od
                    .vars
                    .get(slot)
                    .map(|v| v.skip_rewinding)
                    .unwrap_or(false);

                if skip_rewinding {
                    has_soft = true;
                    let entry = partial.object_vars[index]
                        .get_or_insert_with(|| vec![None; server_vars.len()]);
                    entry[slot] = Some(server_var.clone());
                } else {
                    has_hard = true;
                }

                let d = detail.get_or_insert_with(|| ObjectDivergence {
                    net_id,
                    handle: od.handle,
                    var_names: Vec::new(),
                    client_values: Vec::new(),
                    server_values: Vec::new(),
                });
                d.var_names.push(server_var.name.clone());
                d.client_values
                    .push(client_value.cloned().unwrap_or(VarValue::Nil));
                d.server_values.push(server_var.value.clone());
            }

            if let Some(d) = detail {
                divergences.push(d);
            }
        }

        let outcome = if has_hard {
            CompareOutcome::Hard
        } else if has_soft {
            CompareOutcome::Soft(partial)
        } else {
            CompareOutcome::Equal
        };
        (outcome, divergences)
    }

    /// Record a parsed variable value, growing the per-object slot vector to
    /// the object's current var count.
    pub(crate) fn set_var(
        &mut self,
        net_id: ObjectNetId,
        var_count: usize,
        var_id: VarId,
        value: NameAndVar,
    ) {
        if self.object_vars.len() <= net_id.index() {
            self.object_vars.resize(net_id.index() + 1, None);
        }
        let vars = self.object_vars[net_id.index()].get_or_insert_with(Vec::new);
        if vars.len() < var_count {
            vars.resize(var_count, None);
        }
        vars[var_id.index()] = Some(value);
    }

    pub(crate) fn ensure_object(&mut self, net_id: ObjectNetId) {
        if self.object_vars.len() <= net_id.index() {
            self.object_vars.resize(net_id.index() + 1, None);
        }
        self.object_vars[net_id.index()].get_or_insert_with(Vec::new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::VarDescriptor;

    fn storage_with_one_object(skip_rewinding: bool) -> ObjectDataStorage {
        let mut storage = ObjectDataStorage::default();
        let local_id = {
            let od = storage.allocate_object_data();
            od.name = "unit".into();
            od.vars
                .push(VarDescriptor::new(VarId(0), "v".into(), VarValue::Int(0)));
            od.vars[0].skip_rewinding = skip_rewinding;
            od.local_id()
        };
        let net_id = storage.generate_net_id();
        storage.set_net_id(local_id, net_id);
        storage
    }

    fn snapshot_with_value(value: i64) -> Snapshot {
        let mut snap = Snapshot::default();
        snap.set_var(
            ObjectNetId(0),
            1,
            VarId(0),
            NameAndVar {
                name: "v".into(),
                value: VarValue::Int(value),
            },
        );
        snap
    }

    #[test]
    fn identical_snapshots_compare_equal() {
        let storage = storage_with_one_object(false);
        let (outcome, diffs) = Snapshot::compare(
            &snapshot_with_value(5),
            &snapshot_with_value(5),
            &storage,
            &|a, b| a == b,
        );
        assert!(matches!(outcome, CompareOutcome::Equal));
        assert!(diffs.is_empty());
    }

    #[test]
    fn simulated_variable_difference_is_hard() {
        let storage = storage_with_one_object(false);
        let (outcome, diffs) = Snapshot::compare(
            &snapshot_with_value(100),
            &snapshot_with_value(3),
            &storage,
            &|a, b| a == b,
        );
        assert!(matches!(outcome, CompareOutcome::Hard));
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].var_names, vec!["v".to_string()]);
        assert_eq!(diffs[0].client_values, vec![VarValue::Int(3)]);
        assert_eq!(diffs[0].server_values, vec![VarValue::Int(100)]);
    }

    #[test]
    fn skip_rewinding_difference_is_soft() {
        let storage = storage_with_one_object(true);
        let (outcome, _) = Snapshot::compare(
            &snapshot_with_value(100),
            &snapshot_with_value(3),
            &storage,
            &|a, b| a == b,
        );
        let CompareOutcome::Soft(partial) = outcome else {
            panic!("expected a soft divergence");
        };
        let vars = partial.vars_of(ObjectNetId(0)).unwrap();
        assert_eq!(vars[0].as_ref().unwrap().value, VarValue::Int(100));
    }

    #[test]
    fn variable_missing_on_client_is_hard() {
        let storage = storage_with_one_object(false);
        let (outcome, diffs) = Snapshot::compare(
            &snapshot_with_value(100),
            &Snapshot::default(),
            &storage,
            &|a, b| a == b,
        );
        assert!(matches!(outcome, CompareOutcome::Hard));
        assert_eq!(diffs[0].client_values, vec![VarValue::Nil]);
    }

    #[test]
    fn capture_skips_disabled_vars_but_keeps_their_slot() {
        let mut storage = ObjectDataStorage::default();
        let local_id = {
            let od = storage.allocate_object_data();
            od.vars
                .push(VarDescriptor::new(VarId(0), "a".into(), VarValue::Int(1)));
            od.vars
                .push(VarDescriptor::new(VarId(1), "b".into(), VarValue::Int(2)));
            od.vars[0].enabled = false;
            od.local_id()
        };
        let net_id = storage.generate_net_id();
        storage.set_net_id(local_id, net_id);

        let snap = Snapshot::capture(&storage, None);
        let vars = snap.vars_of(ObjectNetId(0)).unwrap();
        assert_eq!(vars.len(), 2);
        assert!(vars[0].is_none());
        assert_eq!(vars[1].as_ref().unwrap().value, VarValue::Int(2));
    }
}
