mod common;

use common::*;
use resim::{ObjectHandle, ObjectNetId, RpcChannel, VarValue};

/// A snapshot names an object the client never registered: the client must
/// resolve it through the host, adopt the transmitted net id, apply its
/// variables, and not request a full snapshot.
#[test]
fn unknown_object_is_resolved_by_name() {
    let mut client = make_client(
        2,
        vec![TestObjectDef::plain("mystery", &[("v", VarValue::Int(0))])],
    );
    // Discard the construction-time full snapshot request.
    let _ = client.drain_outbox();

    let payload = craft_snapshot(
        None,
        None,
        &[SnapshotRecord {
            net_id: 7,
            name: Some("mystery".into()),
            vars: vec![Some(VarValue::Int(100))],
        }],
    );
    deliver(&mut client.sync, SERVER_PEER, RpcChannel::ReceiveState, &payload);
    client.sync.process();

    assert_eq!(
        client.sync.get_app_object_net_id(ObjectHandle(0)),
        ObjectNetId(7)
    );
    assert_eq!(client.world.borrow().var("mystery", "v"), VarValue::Int(100));

    let requests = client
        .drain_outbox()
        .into_iter()
        .filter(|(_, channel, _)| *channel == RpcChannel::NotifyNeedFullSnapshot)
        .count();
    assert_eq!(requests, 0, "a resolvable object must not trigger a request");
}

/// An object the host cannot resolve is skipped without corrupting the rest
/// of the record stream, and a full snapshot is requested.
#[test]
fn unresolvable_object_is_skipped_and_full_snapshot_requested() {
    let mut client = make_client(
        2,
        vec![TestObjectDef::plain("known", &[("v", VarValue::Int(0))])],
    );
    let _ = client.drain_outbox();

    let payload = craft_snapshot(
        None,
        None,
        &[
            SnapshotRecord {
                net_id: 3,
                name: Some("ghost".into()),
                vars: vec![Some(VarValue::Int(9))],
            },
            SnapshotRecord {
                net_id: 4,
                name: Some("known".into()),
                vars: vec![Some(VarValue::Int(5))],
            },
        ],
    );
    deliver(&mut client.sync, SERVER_PEER, RpcChannel::ReceiveState, &payload);
    client.sync.process();

    // The unknown record was skipped; the known one still parsed cleanly.
    assert_eq!(client.world.borrow().var("known", "v"), VarValue::Int(5));

    let requests = client
        .drain_outbox()
        .into_iter()
        .filter(|(_, channel, _)| *channel == RpcChannel::NotifyNeedFullSnapshot)
        .count();
    assert_eq!(requests, 1);
}
