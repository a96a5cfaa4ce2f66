//! Integration tests for the provisioning session state machine.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use linkedlamp_ble_controller::{
    ConnectionState, DisconnectReason, InvalidOperation, ProvisionOutcome, ProvisioningError,
    ProvisioningSession,
};
use linkedlamp_proto::ble::{DEVICE_TO_APP_UUID, SERVICE_UUID};
use linkedlamp_proto::{EncodingError, ProtocolError};

use crate::mock_ble::*;

async fn connected(mock: MockBle) -> (Arc<MockBle>, ProvisioningSession<MockBle>) {
    let mock = Arc::new(mock);
    let session = ProvisioningSession::new(mock.clone(), Duration::from_secs(1));
    session
        .connect(mock.candidate("lamp-1"), &CancellationToken::new())
        .await
        .unwrap();
    (mock, session)
}

/// Poll until the session has written its request to the lamp
async fn request_written(mock: &MockBle) {
    while mock.writes().is_empty() {
        tokio::task::yield_now().await;
    }
}

/// Poll until the session has released the device on the platform side
async fn released(mock: &MockBle) {
    while mock.count(&BleCall::Disconnect("lamp-1".to_string())) == 0 {
        tokio::task::yield_now().await;
    }
}

// ── SSID list ─────────────────────────────────────────────────

#[tokio::test]
async fn ssid_list_reassembled_and_acked_in_order() {
    let (mock, session) = connected(MockBle::lamp().with_ssid_frames(home_and_work())).await;

    let ssids = session
        .request_ssid_list(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ssids, vec!["Home1", "Work1"]);
    assert_eq!(mock.writes()[0], vec![0x00]);
    assert_eq!(mock.acks(), vec![(0, 0), (1, 0), (1, 1)]);
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn second_list_request_starts_from_scratch() {
    let mut frames = home_and_work();
    frames.extend([ssid_frame(0, 1, 0, "Cafe"), ssid_end()]);
    let (_mock, session) = connected(MockBle::lamp().with_ssid_frames(frames)).await;
    let cancel = CancellationToken::new();

    assert_eq!(session.request_ssid_list(&cancel).await.unwrap().len(), 2);
    assert_eq!(session.request_ssid_list(&cancel).await.unwrap(), vec!["Cafe"]);
}

#[tokio::test]
async fn malformed_ssid_frame_fails_the_request() {
    let short_header = vec![0x00, 0, 1];
    let (_mock, session) = connected(MockBle::lamp().with_ssid_frames(vec![short_header])).await;

    let result = session.request_ssid_list(&CancellationToken::new()).await;

    assert_eq!(
        result,
        Err(ProvisioningError::Protocol(ProtocolError::MalformedSsid))
    );
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn request_while_not_connected_writes_nothing() {
    let mock = Arc::new(MockBle::lamp());
    let session = ProvisioningSession::new(mock.clone(), Duration::from_secs(1));

    let result = session.request_ssid_list(&CancellationToken::new()).await;

    assert_eq!(
        result,
        Err(ProvisioningError::InvalidOperation(
            InvalidOperation::NotConnected
        ))
    );
    assert!(mock.writes().is_empty());
}

#[tokio::test]
async fn failed_ack_write_keeps_the_list_going() {
    let lamp = MockBle::lamp()
        .with_ssid_frames(home_and_work())
        .failing_acks();
    let (mock, session) = connected(lamp).await;

    let ssids = session
        .request_ssid_list(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ssids, vec!["Home1", "Work1"]);
    assert_eq!(mock.acks(), vec![(0, 0), (1, 0), (1, 1)]);
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn failed_request_write_frees_the_slot() {
    let lamp = MockBle::lamp()
        .with_ssid_frames(home_and_work())
        .failing_request_write();
    let (_mock, session) = connected(lamp).await;
    let cancel = CancellationToken::new();

    let result = session.request_ssid_list(&cancel).await;
    assert!(matches!(result, Err(ProvisioningError::Transport(_))));
    assert_eq!(session.state(), ConnectionState::Connected);

    let ssids = session.request_ssid_list(&cancel).await.unwrap();
    assert_eq!(ssids, vec!["Home1", "Work1"]);
}

// ── Provisioning ──────────────────────────────────────────────

#[tokio::test]
async fn provision_success() {
    let (mock, session) = connected(MockBle::lamp().with_provision_reply(wifi_ok())).await;

    let outcome = session
        .provision("MyGroup", "MyWifi", "secret", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ProvisionOutcome::Success);
    let mut expected = vec![0x02, 7];
    expected.extend(b"MyGroup");
    expected.push(6);
    expected.extend(b"MyWifi");
    expected.push(6);
    expected.extend(b"secret");
    assert_eq!(mock.writes(), vec![expected]);
}

#[tokio::test]
async fn provision_wifi_failure_is_an_outcome() {
    let (_mock, session) = connected(MockBle::lamp().with_provision_reply(wifi_fail())).await;

    let outcome = session
        .provision("MyGroup", "MyWifi", "wrong", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ProvisionOutcome::WifiFailed);
}

#[tokio::test]
async fn oversized_field_rejected_before_writing() {
    let (mock, session) = connected(MockBle::lamp()).await;
    let ssid = "x".repeat(256);

    let result = session
        .provision("MyGroup", &ssid, "secret", &CancellationToken::new())
        .await;

    assert_eq!(
        result,
        Err(ProvisioningError::Encoding(EncodingError::FieldTooLong {
            field: "ssid",
            len: 256
        }))
    );
    assert!(mock.writes().is_empty());
}

#[tokio::test]
async fn only_one_request_at_a_time() {
    let (mock, session) = connected(MockBle::lamp()).await;
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(session.request_ssid_list(&cancel), async {
        request_written(&mock).await;
        let second = session
            .provision("g", "s", "p", &CancellationToken::new())
            .await;
        cancel.cancel();
        second
    });

    assert_eq!(first, Err(ProvisioningError::Cancelled));
    assert_eq!(
        second,
        Err(ProvisioningError::InvalidOperation(
            InvalidOperation::OperationPending
        ))
    );
    assert_eq!(mock.writes().len(), 1);
}

#[tokio::test]
async fn provision_while_not_connected_checks_state_first() {
    let mock = Arc::new(MockBle::lamp());
    let session = ProvisioningSession::new(mock.clone(), Duration::from_secs(1));
    let ssid = "x".repeat(256);

    let result = session
        .provision("MyGroup", &ssid, "secret", &CancellationToken::new())
        .await;

    assert_eq!(
        result,
        Err(ProvisioningError::InvalidOperation(
            InvalidOperation::NotConnected
        ))
    );
    assert!(mock.writes().is_empty());
}

// ── Cancellation and stray frames ─────────────────────────────

#[tokio::test]
async fn cancelled_request_keeps_connection() {
    let (mock, session) = connected(MockBle::lamp().with_provision_reply(wifi_ok())).await;
    let cancel = CancellationToken::new();

    let (result, ()) = tokio::join!(session.request_ssid_list(&cancel), async {
        request_written(&mock).await;
        cancel.cancel();
    });

    assert_eq!(result, Err(ProvisioningError::Cancelled));
    assert_eq!(session.state(), ConnectionState::Connected);

    // the slot is free again
    let outcome = session
        .provision("MyGroup", "MyWifi", "secret", &CancellationToken::new())
        .await;
    assert_eq!(outcome, Ok(ProvisionOutcome::Success));
}

#[tokio::test]
async fn stray_frames_are_dropped() {
    let (mock, session) = connected(MockBle::lamp().with_ssid_frames(home_and_work())).await;

    mock.notify(wifi_ok());
    mock.notify(ssid_frame(4, 1, 0, "Stray"));
    mock.notify(vec![0x42]);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(mock.acks().is_empty());

    let ssids = session
        .request_ssid_list(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ssids, vec!["Home1", "Work1"]);
}

// ── Disconnects ───────────────────────────────────────────────

#[tokio::test]
async fn device_disconnect_resolves_pending_request() {
    let (mock, session) = connected(MockBle::lamp()).await;
    let mut observer = session.subscribe_disconnects();
    let cancel = CancellationToken::new();

    let (result, ()) = tokio::join!(session.request_ssid_list(&cancel), async {
        request_written(&mock).await;
        mock.drop_link();
    });

    assert_eq!(result, Err(ProvisioningError::Disconnected));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(matches!(observer.try_recv(), Ok(DisconnectReason::Remote)));

    released(&mock).await;
    assert_eq!(mock.count(&BleCall::Unsubscribe(DEVICE_TO_APP_UUID)), 1);
}

#[tokio::test]
async fn lost_notification_stream_releases_the_device() {
    let (mock, session) = connected(MockBle::lamp()).await;
    let mut observer = session.subscribe_disconnects();

    mock.end_notifications();
    assert_eq!(observer.recv().await.unwrap(), DisconnectReason::LinkLost);
    released(&mock).await;

    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(mock.count(&BleCall::Unsubscribe(DEVICE_TO_APP_UUID)), 1);

    // already torn down, nothing more to do
    session.disconnect().await.unwrap();
    assert_eq!(mock.count(&BleCall::Disconnect("lamp-1".to_string())), 1);
}

#[tokio::test]
async fn explicit_disconnect_resolves_pending_request() {
    let (mock, session) = connected(MockBle::lamp()).await;
    let cancel = CancellationToken::new();

    let (result, disconnected) = tokio::join!(session.provision("g", "s", "p", &cancel), async {
        request_written(&mock).await;
        session.disconnect().await
    });

    assert_eq!(result, Err(ProvisioningError::Disconnected));
    assert_eq!(disconnected, Ok(()));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let (mock, session) = connected(MockBle::lamp()).await;
    let mut observer = session.subscribe_disconnects();

    session.disconnect().await.unwrap();
    session.disconnect().await.unwrap();

    assert_eq!(mock.count(&BleCall::Unsubscribe(DEVICE_TO_APP_UUID)), 1);
    assert_eq!(mock.count(&BleCall::Disconnect("lamp-1".to_string())), 1);
    assert_eq!(session.state(), ConnectionState::Disconnected);
    // only device-initiated disconnects are broadcast
    assert!(observer.try_recv().is_err());
}

#[tokio::test]
async fn disconnect_from_idle_is_invalid() {
    let session = ProvisioningSession::new(Arc::new(MockBle::lamp()), Duration::from_secs(1));

    assert_eq!(
        session.disconnect().await,
        Err(ProvisioningError::InvalidOperation(
            InvalidOperation::NotConnected
        ))
    );
}

// ── Connect ───────────────────────────────────────────────────

#[tokio::test]
async fn second_connect_rejected() {
    let (mock, session) = connected(MockBle::lamp().with_ssid_frames(home_and_work())).await;

    let result = session
        .connect(mock.candidate("lamp-2"), &CancellationToken::new())
        .await;

    assert_eq!(
        result,
        Err(ProvisioningError::InvalidOperation(
            InvalidOperation::AlreadyConnected
        ))
    );
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.device_name().as_deref(), Some("LinkedLamp_Caskev_lamp-1"));
    assert_eq!(mock.count(&BleCall::Connect("lamp-2".to_string())), 0);

    // the first connection still works
    let ssids = session.request_ssid_list(&CancellationToken::new()).await;
    assert_eq!(ssids.unwrap().len(), 2);
}

#[tokio::test]
async fn missing_service_aborts_connection() {
    let mock = Arc::new(MockBle::lamp().without_service());
    let session = ProvisioningSession::new(mock.clone(), Duration::from_secs(1));

    let result = session
        .connect(mock.candidate("lamp-1"), &CancellationToken::new())
        .await;

    assert_eq!(result, Err(ProvisioningError::ServiceNotFound(SERVICE_UUID)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(mock.count(&BleCall::Disconnect("lamp-1".to_string())), 1);
}

#[tokio::test]
async fn missing_characteristic_aborts_connection() {
    let mock = Arc::new(MockBle::lamp().without_characteristic(DEVICE_TO_APP_UUID));
    let session = ProvisioningSession::new(mock.clone(), Duration::from_secs(1));

    let result = session
        .connect(mock.candidate("lamp-1"), &CancellationToken::new())
        .await;

    assert_eq!(
        result,
        Err(ProvisioningError::CharacteristicNotFound(DEVICE_TO_APP_UUID))
    );
    assert_eq!(mock.count(&BleCall::Disconnect("lamp-1".to_string())), 1);
}

#[tokio::test]
async fn failed_connect_closes_the_session() {
    let mock = Arc::new(MockBle::lamp().failing_connect());
    let session = ProvisioningSession::new(mock.clone(), Duration::from_secs(1));
    let cancel = CancellationToken::new();

    let result = session.connect(mock.candidate("lamp-1"), &cancel).await;
    assert!(matches!(result, Err(ProvisioningError::Transport(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);

    let retry = session.connect(mock.candidate("lamp-1"), &cancel).await;
    assert_eq!(
        retry,
        Err(ProvisioningError::InvalidOperation(
            InvalidOperation::SessionClosed
        ))
    );
}

#[tokio::test]
async fn cancelled_connect() {
    let mock = Arc::new(MockBle::lamp());
    let session = ProvisioningSession::new(mock.clone(), Duration::from_secs(1));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = session.connect(mock.candidate("lamp-1"), &cancel).await;

    assert_eq!(result, Err(ProvisioningError::Cancelled));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}
