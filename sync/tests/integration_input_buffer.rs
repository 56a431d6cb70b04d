mod common;

use common::*;
use resim::{ControllerConfig, ObjectHandle, RpcChannel, VarValue};

/// A full input buffer stalls collection; an acknowledgement unblocks it.
#[test]
fn full_input_buffer_stalls_until_acknowledged() {
    let config = ControllerConfig {
        player_input_storage_size: 4,
        ..Default::default()
    };
    let mut client = make_client_with_config(
        2,
        vec![TestObjectDef::controlled(
            "avatar",
            &[("v", VarValue::Int(0))],
            2,
        )],
        config,
    );
    let object = client.sync.register_app_object(ObjectHandle(0));
    let log = attach_event_log(&mut client.sync);

    let payload = craft_snapshot(
        None,
        None,
        &[SnapshotRecord {
            net_id: 0,
            name: Some("avatar".into()),
            vars: vec![Some(VarValue::Int(0))],
        }],
    );
    deliver(&mut client.sync, SERVER_PEER, RpcChannel::ReceiveState, &payload);

    // Six ticks, but only four inputs fit; the last two stall.
    for _ in 0..6 {
        client.sync.process();
    }
    let current = client
        .sync
        .get_object_data(object)
        .and_then(|od| od.controller())
        .map(|c| c.current_input_id())
        .unwrap();
    assert_eq!(current, 3);
    assert_eq!(client.world.borrow().var("avatar", "v"), VarValue::Int(4));

    // An acknowledgement of the head frees the buffer.
    let ack = craft_snapshot(
        Some(3),
        None,
        &[SnapshotRecord {
            net_id: 0,
            name: None,
            vars: vec![Some(VarValue::Int(4))],
        }],
    );
    deliver(&mut client.sync, SERVER_PEER, RpcChannel::ReceiveState, &ack);
    client.sync.process();
    assert_eq!(*log.validated.borrow(), vec![3]);

    client.sync.process();
    let current = client
        .sync
        .get_object_data(object)
        .and_then(|od| od.controller())
        .map(|c| c.current_input_id())
        .unwrap();
    assert_eq!(current, 4);
    assert_eq!(client.world.borrow().var("avatar", "v"), VarValue::Int(5));
}
