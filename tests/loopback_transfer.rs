//! End-to-end loopback transfers between two in-process engines.

use std::time::Duration;

use airlift_core::{Event, TransferStatus};
use airlift_files::{CHUNK_SIZE, file_checksum};
use airlift_integration_tests::{
    introduce, next_matching, pin_mutually, spawn_peer, write_patterned_file,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::test(flavor = "multi_thread")]
async fn three_chunk_file_transfers_end_to_end() {
    let sender = spawn_peer("alpha").await;
    let receiver = spawn_peer("beta").await;
    pin_mutually(&sender, &receiver);
    introduce(&sender, &receiver);

    let source = write_patterned_file(sender.dir.path(), "payload.bin", 3 * CHUNK_SIZE);
    let source_checksum = file_checksum(&source).unwrap();

    let mut sender_events = sender.events.subscribe();
    let mut receiver_events = receiver.events.subscribe();

    let queued = sender
        .coordinator
        .send_files(&[receiver.device_id.clone()], &[source.clone()]);
    assert_eq!(queued.len(), 1);
    let transfer_id = queued[0].id.clone();

    let complete = next_matching(&mut sender_events, EVENT_TIMEOUT, |event| {
        matches!(event, Event::TransferComplete(t) if t.id == transfer_id)
    })
    .await;
    let Event::TransferComplete(snapshot) = complete else {
        unreachable!()
    };
    assert_eq!(snapshot.progress, 100);
    assert_eq!(snapshot.status, TransferStatus::Completed);
    assert_eq!(snapshot.size, 3 * CHUNK_SIZE as u64);
    assert_eq!(snapshot.checksum, source_checksum);

    // Receiver delivers the verified artifact with identical bytes.
    next_matching(&mut receiver_events, EVENT_TIMEOUT, |event| {
        matches!(event, Event::TransferComplete(t) if t.id == transfer_id)
    })
    .await;
    let delivered = receiver.download_dir().join("payload.bin");
    assert_eq!(file_checksum(&delivered).unwrap(), source_checksum);

    // The sender's staged temp artifact is gone after completion.
    assert!(!sender.staged_artifact(&transfer_id, "payload.bin").exists());

    // Terminal records are retained for queries.
    let sender_view = sender.coordinator.get_transfer(&transfer_id).unwrap();
    assert_eq!(sender_view.status, TransferStatus::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn single_chunk_file_uses_one_stream() {
    let sender = spawn_peer("gamma").await;
    let receiver = spawn_peer("delta").await;
    pin_mutually(&sender, &receiver);
    introduce(&sender, &receiver);

    let source = write_patterned_file(sender.dir.path(), "small.bin", CHUNK_SIZE);
    let mut sender_events = sender.events.subscribe();

    let queued = sender
        .coordinator
        .send_files(&[receiver.device_id.clone()], &[source]);
    let transfer_id = queued[0].id.clone();

    let complete = next_matching(&mut sender_events, EVENT_TIMEOUT, |event| {
        matches!(event, Event::TransferComplete(t) if t.id == transfer_id)
    })
    .await;
    let Event::TransferComplete(snapshot) = complete else {
        unreachable!()
    };
    assert_eq!(snapshot.stream_count, 1);
    assert_eq!(snapshot.progress, 100);
    assert!(receiver.download_dir().join("small.bin").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn first_contact_verification_pins_both_sides() {
    let sender = spawn_peer("echo").await;
    let receiver = spawn_peer("foxtrot").await;
    introduce(&sender, &receiver);

    let source = write_patterned_file(sender.dir.path(), "greeting.bin", 64 * 1024);
    let mut sender_events = sender.events.subscribe();
    let mut receiver_events = receiver.events.subscribe();

    let queued = sender
        .coordinator
        .send_files(&[receiver.device_id.clone()], &[source]);
    let transfer_id = queued[0].id.clone();

    // Sender side surfaces the challenge first.
    let event = next_matching(&mut sender_events, EVENT_TIMEOUT, |event| {
        matches!(event, Event::VerificationRequired { .. })
    })
    .await;
    let Event::VerificationRequired {
        device_id: sender_sees,
        code: sender_code,
    } = event
    else {
        unreachable!()
    };
    assert_eq!(sender_sees, receiver.device_id);
    assert_eq!(sender_code.len(), 3);
    assert!(sender_code.chars().all(|c| c.is_ascii_digit()));

    // Receiver surfaces the same code once the request arrives.
    let event = next_matching(&mut receiver_events, EVENT_TIMEOUT, |event| {
        matches!(event, Event::VerificationRequired { .. })
    })
    .await;
    let Event::VerificationRequired {
        device_id: receiver_sees,
        code: receiver_code,
    } = event
    else {
        unreachable!()
    };
    assert_eq!(receiver_sees, sender.device_id);
    assert_eq!(receiver_code, sender_code);

    // Both operators accept; trust pins and the transfer completes.
    assert!(sender.coordinator.respond_verification(&receiver.device_id, true));
    assert!(receiver.coordinator.respond_verification(&sender.device_id, true));

    next_matching(&mut sender_events, EVENT_TIMEOUT, |event| {
        matches!(event, Event::TransferComplete(t) if t.id == transfer_id)
    })
    .await;

    assert!(sender.trust.is_pinned(&receiver.device_id));
    assert!(receiver.trust.is_pinned(&sender.device_id));
    assert!(receiver.download_dir().join("greeting.bin").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_removes_transfer_and_temp_artifact() {
    let sender = spawn_peer("hotel").await;

    // A listener that accepts TCP but never speaks TLS: the pipeline stalls
    // in the handshake, leaving a stable window to cancel in.
    let stall = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stall_port = stall.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = stall.accept().await {
            held.push(socket);
        }
    });

    sender.registry.upsert(airlift_discovery::Observation {
        id: "stalled-device".to_string(),
        name: "Stalled".to_string(),
        address: "127.0.0.1".parse().unwrap(),
        port: stall_port,
        platform: "linux".to_string(),
        version: "0.1.0".to_string(),
    });
    sender
        .trust
        .pin("stalled-device", "Stalled", sender.identity.certificate().as_ref())
        .unwrap();

    let source = write_patterned_file(sender.dir.path(), "doomed.bin", 256 * 1024);
    let mut events = sender.events.subscribe();

    let queued = sender
        .coordinator
        .send_files(&["stalled-device".to_string()], &[source]);
    let transfer_id = queued[0].id.clone();

    // Wait until the artifact is staged and the pipeline is connecting.
    next_matching(&mut events, EVENT_TIMEOUT, |event| {
        matches!(
            event,
            Event::TransferProgress(t)
                if t.id == transfer_id && t.status == TransferStatus::Connecting
        )
    })
    .await;

    assert!(sender.coordinator.cancel(&transfer_id));

    // Removed from the active mapping, terminal snapshot notified.
    assert!(sender.coordinator.get_transfer(&transfer_id).is_none());
    next_matching(&mut events, EVENT_TIMEOUT, |event| {
        matches!(
            event,
            Event::TransferProgress(t)
                if t.id == transfer_id && t.status == TransferStatus::Cancelled
        )
    })
    .await;

    // Temp artifact is gone.
    assert!(!sender.staged_artifact(&transfer_id, "doomed.bin").exists());

    // Cancelling again is a no-op.
    assert!(!sender.coordinator.cancel(&transfer_id));
}
