mod common;

use common::*;
use resim::{ObjectHandle, RpcChannel, VarValue};
use resim_serde::{BitReader, Serde};

/// Moving a peer into a fresh group forces a full snapshot listing only
/// that group's realtime objects, with name-only records introducing its
/// deferred objects.
#[test]
fn moving_a_peer_emits_a_full_snapshot_of_the_new_group() {
    let mut server = make_server(vec![
        TestObjectDef::plain("alpha", &[("v", VarValue::Int(7))]),
        TestObjectDef::plain("beta", &[("v", VarValue::Int(9))]),
        TestObjectDef::plain("cloud", &[("height", VarValue::Float(0.0))]),
    ]);

    let alpha = server.sync.register_app_object(ObjectHandle(0));
    let _beta = server.sync.register_app_object(ObjectHandle(1));
    let cloud = server.sync.register_app_object(ObjectHandle(2));
    server.sync.on_peer_connected(2);

    let group = server.sync.sync_group_create().unwrap();
    server.sync.sync_group_add_object(alpha, group, true).unwrap();
    server.sync.sync_group_add_object(cloud, group, false).unwrap();
    server.sync.sync_group_move_peer_to(2, group).unwrap();

    server.sync.process();

    let snapshots: Vec<Vec<u8>> = server
        .drain_outbox()
        .into_iter()
        .filter(|(recipient, channel, _)| {
            *recipient == 2 && *channel == RpcChannel::ReceiveState
        })
        .map(|(_, _, payload)| payload)
        .collect();
    assert_eq!(snapshots.len(), 1, "exactly one snapshot for the moved peer");

    let mut reader = BitReader::new(&snapshots[0]);

    // No controller for this peer.
    assert_eq!(u32::de(&mut reader).unwrap(), u32::MAX);

    // Active object list: only `alpha`.
    assert!(bool::de(&mut reader).unwrap());
    assert_eq!(u32::de(&mut reader).unwrap(), 0);
    assert_eq!(u32::de(&mut reader).unwrap(), u32::MAX);

    // No custom data.
    assert!(!bool::de(&mut reader).unwrap());

    // Name-only introduction of the deferred `cloud` (net id 2).
    assert_eq!(u32::de(&mut reader).unwrap(), 2);
    assert!(bool::de(&mut reader).unwrap());
    assert_eq!(String::de(&mut reader).unwrap(), "cloud");
    assert_eq!(u8::de(&mut reader).unwrap(), 1);
    assert!(!bool::de(&mut reader).unwrap());

    // Full record of `alpha` (net id 0) with its value.
    assert_eq!(u32::de(&mut reader).unwrap(), 0);
    assert!(bool::de(&mut reader).unwrap());
    assert_eq!(String::de(&mut reader).unwrap(), "alpha");
    assert_eq!(u8::de(&mut reader).unwrap(), 1);
    assert!(bool::de(&mut reader).unwrap());
    assert_eq!(decode_value(&mut reader).unwrap(), VarValue::Int(7));

    // Terminator; `beta` never appears.
    assert_eq!(u32::de(&mut reader).unwrap(), u32::MAX);
}

/// The global group rejects user mutation.
#[test]
fn global_group_is_immutable() {
    let mut server = make_server(vec![TestObjectDef::plain(
        "alpha",
        &[("v", VarValue::Int(0))],
    )]);
    let alpha = server.sync.register_app_object(ObjectHandle(0));

    let result = server
        .sync
        .sync_group_add_object(alpha, resim::GLOBAL_SYNC_GROUP_ID, true);
    assert!(matches!(result, Err(resim::ConfigError::GlobalGroupImmutable)));

    let result = server
        .sync
        .sync_group_remove_object(alpha, resim::GLOBAL_SYNC_GROUP_ID);
    assert!(matches!(result, Err(resim::ConfigError::GlobalGroupImmutable)));
}

/// Disabling a variable keeps its slot (and ordering); re-enabling restores
/// replication without reordering.
#[test]
fn disabled_variables_keep_their_slot() {
    let mut server = make_server(vec![TestObjectDef::plain(
        "alpha",
        &[("a", VarValue::Int(1)), ("b", VarValue::Int(2))],
    )]);
    let alpha = server.sync.register_app_object(ObjectHandle(0));

    let a_id = server.sync.get_variable_id(alpha, "a");
    server.sync.unregister_variable(alpha, "a").unwrap();
    assert_eq!(server.sync.get_variable_id(alpha, "a"), a_id);

    // Re-registering re-enables the same slot.
    let re_registered = server.sync.register_variable(alpha, "a").unwrap();
    assert_eq!(re_registered, a_id);
    assert_eq!(server.sync.get_variable_id(alpha, "b").0, 1);
}
