//! Trust-gate scenarios: mismatched pins abort, unpinned peers are declined,
//! rejected verifications pin nothing.

use std::time::Duration;

use airlift_core::Event;
use airlift_integration_tests::{introduce, next_matching, spawn_peer, write_patterned_file};

const EVENT_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::test(flavor = "multi_thread")]
async fn fingerprint_mismatch_aborts_before_any_transfer_data() {
    let sender = spawn_peer("kilo").await;
    let receiver = spawn_peer("lima").await;
    introduce(&sender, &receiver);

    // The sender pinned some other certificate for this device id; the live
    // one will not match.
    sender
        .trust
        .pin(
            &receiver.device_id,
            &receiver.name,
            sender.identity.certificate().as_ref(),
        )
        .unwrap();
    receiver
        .trust
        .pin(&sender.device_id, &sender.name, sender.identity.certificate().as_ref())
        .unwrap();

    let source = write_patterned_file(sender.dir.path(), "secret.bin", 128 * 1024);
    let mut sender_events = sender.events.subscribe();

    let queued = sender
        .coordinator
        .send_files(&[receiver.device_id.clone()], &[source]);
    let transfer_id = queued[0].id.clone();

    let event = next_matching(&mut sender_events, EVENT_TIMEOUT, |event| {
        matches!(event, Event::TransferError { transfer, .. } if transfer.id == transfer_id)
    })
    .await;
    let Event::TransferError { error, .. } = event else {
        unreachable!()
    };
    assert!(error.contains("fingerprint mismatch"), "got: {error}");

    // Nothing reached the receiver: no record, no staged chunks, no file.
    assert!(receiver.coordinator.transfers().is_empty());
    assert!(!receiver.download_dir().join("secret.bin").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn receiver_declines_unpinned_sender() {
    let sender = spawn_peer("mike").await;
    let receiver = spawn_peer("november").await;
    introduce(&sender, &receiver);

    // Sender trusts the receiver, but not vice versa; the receiver must not
    // honor the transfer request.
    sender
        .trust
        .pin(
            &receiver.device_id,
            &receiver.name,
            receiver.identity.certificate().as_ref(),
        )
        .unwrap();

    let source = write_patterned_file(sender.dir.path(), "nope.bin", 64 * 1024);
    let mut sender_events = sender.events.subscribe();

    let queued = sender
        .coordinator
        .send_files(&[receiver.device_id.clone()], &[source]);
    let transfer_id = queued[0].id.clone();

    let event = next_matching(&mut sender_events, EVENT_TIMEOUT, |event| {
        matches!(event, Event::TransferError { transfer, .. } if transfer.id == transfer_id)
    })
    .await;
    let Event::TransferError { error, .. } = event else {
        unreachable!()
    };
    assert!(error.contains("declined"), "got: {error}");
    assert!(receiver.coordinator.transfers().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_verification_pins_nothing() {
    let sender = spawn_peer("oscar").await;
    let receiver = spawn_peer("papa").await;
    introduce(&sender, &receiver);

    let source = write_patterned_file(sender.dir.path(), "unwanted.bin", 64 * 1024);
    let mut sender_events = sender.events.subscribe();
    let mut receiver_events = receiver.events.subscribe();

    let queued = sender
        .coordinator
        .send_files(&[receiver.device_id.clone()], &[source]);
    let transfer_id = queued[0].id.clone();

    next_matching(&mut sender_events, EVENT_TIMEOUT, |event| {
        matches!(event, Event::VerificationRequired { .. })
    })
    .await;
    next_matching(&mut receiver_events, EVENT_TIMEOUT, |event| {
        matches!(event, Event::VerificationRequired { .. })
    })
    .await;

    // Local operator accepts, remote operator rejects.
    assert!(sender.coordinator.respond_verification(&receiver.device_id, true));
    assert!(receiver.coordinator.respond_verification(&sender.device_id, false));

    let event = next_matching(&mut sender_events, EVENT_TIMEOUT, |event| {
        matches!(event, Event::TransferError { transfer, .. } if transfer.id == transfer_id)
    })
    .await;
    let Event::TransferError { error, .. } = event else {
        unreachable!()
    };
    assert!(error.contains("rejected"), "got: {error}");

    assert!(!sender.trust.is_pinned(&receiver.device_id));
    assert!(!receiver.trust.is_pinned(&sender.device_id));
    assert!(receiver.coordinator.transfers().is_empty());
}
