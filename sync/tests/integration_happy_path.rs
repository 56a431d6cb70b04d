mod common;

use common::*;
use resim::{ObjectHandle, VarValue, GLOBAL_SYNC_GROUP_ID};

fn avatar_def() -> TestObjectDef {
    TestObjectDef::controlled("avatar", &[("v", VarValue::Int(0))], 2)
}

/// One client, one player-controlled object. The client predicts, the
/// server acknowledges, and the acknowledged states match without a rewind.
#[test]
fn client_prediction_is_validated_by_the_server() {
    let mut server = make_server(vec![avatar_def()]);
    let mut client = make_client(2, vec![avatar_def()]);

    server.sync.register_app_object(ObjectHandle(0));
    server.sync.on_peer_connected(2);
    client.sync.register_app_object(ObjectHandle(0));

    let log = attach_event_log(&mut client.sync);

    // The connect-forced snapshot introduces the object and its net id.
    server.sync.process();
    pump(&server, &mut client);

    for tick in 0..10u32 {
        *client.clock_msec.borrow_mut() += 16;
        *server.clock_msec.borrow_mut() += 16;

        client.sync.process();
        pump(&client, &mut server);

        server
            .sync
            .force_state_notify(GLOBAL_SYNC_GROUP_ID)
            .unwrap();
        server.sync.process();
        pump(&server, &mut client);

        let _ = tick;
    }
    // Consume the last acknowledgement.
    client.sync.process();

    let validated = log.validated.borrow();
    assert!(
        validated.contains(&5),
        "input 5 must be validated, got {validated:?}"
    );
    assert_eq!(validated.iter().filter(|id| **id == 5).count(), 1);
    assert!(log.rewinds.borrow().is_empty());
    assert!(log.desyncs.borrow().is_empty());

    // The server consumed exactly the ten shipped inputs; the client keeps
    // predicting ahead of the acknowledged state.
    assert_eq!(server.world.borrow().var("avatar", "v"), VarValue::Int(10));
    assert_eq!(client.world.borrow().var("avatar", "v"), VarValue::Int(11));
}

/// Validated inputs are dropped from the player controller: with a buffer
/// of four frames and continuous acknowledgements, collection never stalls
/// across twenty ticks.
#[test]
fn acknowledged_inputs_are_dropped_from_the_player_buffer() {
    let mut server = make_server(vec![avatar_def()]);
    let config = resim::ControllerConfig {
        player_input_storage_size: 4,
        ..Default::default()
    };
    let mut client = make_client_with_config(2, vec![avatar_def()], config);

    server.sync.register_app_object(ObjectHandle(0));
    server.sync.on_peer_connected(2);
    let client_object = client.sync.register_app_object(ObjectHandle(0));

    server.sync.process();
    pump(&server, &mut client);

    for _ in 0..20 {
        client.sync.process();
        pump(&client, &mut server);
        server
            .sync
            .force_state_notify(GLOBAL_SYNC_GROUP_ID)
            .unwrap();
        server.sync.process();
        pump(&server, &mut client);
    }
    client.sync.process();

    let current = client
        .sync
        .get_object_data(client_object)
        .and_then(|od| od.controller())
        .map(|c| c.current_input_id())
        .unwrap();
    assert_eq!(current, 20);
    // Had acknowledged frames not been dropped, the four-frame buffer would
    // have stalled the simulation long before the twenty-first input.
    assert_eq!(client.world.borrow().var("avatar", "v"), VarValue::Int(21));
}
