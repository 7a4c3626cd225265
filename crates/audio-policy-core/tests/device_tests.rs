//! Wired, A2DP and SCO headset connection handling

mod common;

use std::time::Duration;

use audio_policy_core::prelude::*;
use audio_policy_core::system::NativeCall;
use audio_policy_core::types::ForceUsage;
use audio_policy_core::ForceConfig;
use common::{caller, drain, headset_device, Harness};

fn speaker_sink(address: &str) -> BluetoothDevice {
    BluetoothDevice::new(address, "Speaker")
}

#[tokio::test]
async fn test_wired_headset_changes_music_route() {
    let h = Harness::voice().await;
    let mut events = h.service.subscribe();
    h.plug_headset().await;

    assert!(h.service.is_device_connected(AudioDevice::WIRED_HEADSET, ""));
    assert_eq!(h.service.device_for_stream(StreamType::Music).await, AudioDevice::WIRED_HEADSET);
    assert!(drain(&mut events).contains(&AudioEvent::DeviceConnectionChanged {
        device: AudioDevice::WIRED_HEADSET,
        state: ConnectionState::Connected,
        address: String::new(),
        name: "Headset".to_string(),
    }));
}

#[tokio::test(start_paused = true)]
async fn test_unplugging_last_headset_becomes_noisy_first() {
    let h = Harness::voice().await;
    h.plug_headset().await;
    let mut events = h.service.subscribe();

    let delay = h
        .service
        .set_wired_device_connection_state(AudioDevice::WIRED_HEADSET, ConnectionState::Disconnected, "Headset")
        .unwrap();
    assert_eq!(delay, Duration::from_millis(1000));
    h.settle().await;
    assert_eq!(drain(&mut events), vec![AudioEvent::AudioBecomingNoisy]);
    assert!(h.service.is_device_connected(AudioDevice::WIRED_HEADSET, ""));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.settle().await;
    assert!(!h.service.is_device_connected(AudioDevice::WIRED_HEADSET, ""));
    assert_eq!(h.service.device_for_stream(StreamType::Music).await, AudioDevice::SPEAKER);
}

#[tokio::test(start_paused = true)]
async fn test_change_behind_pending_one_is_delayed() {
    let h = Harness::voice().await;
    h.plug_headset().await;

    h.service
        .set_wired_device_connection_state(AudioDevice::WIRED_HEADSET, ConnectionState::Disconnected, "Headset")
        .unwrap();
    let delay = h
        .service
        .set_wired_device_connection_state(AudioDevice::WIRED_HEADPHONE, ConnectionState::Connected, "Phones")
        .unwrap();
    assert_eq!(delay, Duration::from_millis(1000));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.settle().await;
    assert!(!h.service.is_device_connected(AudioDevice::WIRED_HEADSET, ""));
    assert!(h.service.is_device_connected(AudioDevice::WIRED_HEADPHONE, ""));
}

#[tokio::test]
async fn test_no_noisy_while_another_noisy_output_remains() {
    let h = Harness::voice().await;
    h.plug_headset().await;
    h.service
        .set_wired_device_connection_state(AudioDevice::WIRED_HEADPHONE, ConnectionState::Connected, "Phones")
        .unwrap();
    h.settle().await;
    let mut events = h.service.subscribe();

    let delay = h
        .service
        .set_wired_device_connection_state(AudioDevice::WIRED_HEADSET, ConnectionState::Disconnected, "Headset")
        .unwrap();
    assert_eq!(delay, Duration::ZERO);
    h.settle().await;
    assert!(!drain(&mut events).contains(&AudioEvent::AudioBecomingNoisy));
    assert!(!h.service.is_device_connected(AudioDevice::WIRED_HEADSET, ""));
}

#[tokio::test]
async fn test_wired_connection_rejects_non_wired_devices() {
    let h = Harness::voice().await;
    for device in [
        AudioDevice::BLUETOOTH_A2DP,
        AudioDevice::BLUETOOTH_SCO_HEADSET,
        AudioDevice::WIRED_HEADSET | AudioDevice::WIRED_HEADPHONE,
    ] {
        let result = h
            .service
            .set_wired_device_connection_state(device, ConnectionState::Connected, "x");
        assert!(
            matches!(result, Err(AudioPolicyError::InvalidArgument { .. })),
            "{device} accepted"
        );
    }
}

#[tokio::test]
async fn test_refused_device_not_recorded() {
    let h = Harness::voice().await;
    h.mocks.audio_system.reject_device(AudioDevice::WIRED_HEADSET);
    h.plug_headset().await;
    assert!(!h.service.is_device_connected(AudioDevice::WIRED_HEADSET, ""));
    assert!(h.service.connected_devices().is_empty());
}

#[tokio::test]
async fn test_a2dp_sink_takes_music() {
    let h = Harness::voice().await;
    let mut events = h.service.subscribe();
    let sink = speaker_sink("00:AA:BB:CC:DD:01");

    let delay = h
        .service
        .set_bluetooth_a2dp_device_connection_state(sink.clone(), ConnectionState::Connected)
        .unwrap();
    assert_eq!(delay, Duration::ZERO);
    h.settle().await;

    assert!(h.service.is_device_connected(AudioDevice::BLUETOOTH_A2DP, &sink.address));
    assert_eq!(h.service.device_for_stream(StreamType::Music).await, AudioDevice::BLUETOOTH_A2DP);
    assert!(h
        .mocks
        .audio_system
        .calls()
        .contains(&NativeCall::SetParameters("A2dpSuspended=false".to_string())));
    assert!(drain(&mut events).contains(&AudioEvent::A2dpRouteChanged {
        device: AudioDevice::BLUETOOTH_A2DP,
        state: ConnectionState::Connected,
    }));
}

#[tokio::test]
async fn test_second_a2dp_sink_replaces_first() {
    let h = Harness::voice().await;
    let first = speaker_sink("00:AA:BB:CC:DD:01");
    let second = speaker_sink("00:AA:BB:CC:DD:02");

    h.service
        .set_bluetooth_a2dp_device_connection_state(first.clone(), ConnectionState::Connected)
        .unwrap();
    h.settle().await;
    h.service
        .set_bluetooth_a2dp_device_connection_state(second.clone(), ConnectionState::Connected)
        .unwrap();
    h.settle().await;

    assert!(!h.service.is_device_connected(AudioDevice::BLUETOOTH_A2DP, &first.address));
    assert!(h.service.is_device_connected(AudioDevice::BLUETOOTH_A2DP, &second.address));
    assert_eq!(h.service.connected_devices().len(), 1);
}

#[tokio::test]
async fn test_wired_headset_pulls_media_off_a2dp() {
    let h = Harness::voice().await;
    h.service
        .set_bluetooth_a2dp_device_connection_state(speaker_sink("00:AA:BB:CC:DD:01"), ConnectionState::Connected)
        .unwrap();
    h.settle().await;
    assert!(h.service.is_bluetooth_a2dp_on());

    h.plug_headset().await;
    assert!(!h.service.is_bluetooth_a2dp_on());
    assert!(h.mocks.audio_system.calls().contains(&NativeCall::SetForceUse {
        usage: ForceUsage::Media,
        config: ForceConfig::NoBtA2dp,
    }));
    assert_eq!(h.service.device_for_stream(StreamType::Music).await, AudioDevice::WIRED_HEADSET);
}

#[tokio::test]
async fn test_sco_headset_connection_tracked() {
    let h = Harness::voice().await;
    let headset = headset_device();

    h.service
        .set_bt_sco_device_connection_state(headset.clone(), ConnectionState::Connected)
        .await
        .unwrap();
    assert!(h
        .service
        .is_device_connected(AudioDevice::BLUETOOTH_SCO_HEADSET, &headset.address));
}

#[tokio::test]
async fn test_sco_headset_loss_resets_link() {
    let h = Harness::voice().await;
    let headset = h.connect_headset_profile().await;
    h.service
        .set_bt_sco_device_connection_state(headset.clone(), ConnectionState::Connected)
        .await
        .unwrap();
    let token = ClientToken::new();
    h.service.start_bluetooth_sco_virtual_call(token, &caller(10)).await.unwrap();
    h.service.set_bluetooth_sco_on(true).unwrap();
    assert_eq!(h.service.sco_state(), ScoState::ActiveInternal);

    h.service
        .set_bt_sco_device_connection_state(headset.clone(), ConnectionState::Disconnected)
        .await
        .unwrap();
    h.settle().await;

    assert!(!h
        .service
        .is_device_connected(AudioDevice::BLUETOOTH_SCO_HEADSET, &headset.address));
    assert_eq!(h.service.sco_state(), ScoState::Inactive);
    assert_eq!(h.service.sco_start_count(&token), 0);
    assert!(!h.service.is_bluetooth_sco_on());
}

#[tokio::test]
async fn test_forced_communication_routes() {
    let h = Harness::voice().await;
    h.service.set_speakerphone_on(true).unwrap();
    h.settle().await;
    assert!(h.service.is_speakerphone_on());
    assert_eq!(h.service.device_for_stream(StreamType::VoiceCall).await, AudioDevice::SPEAKER);

    h.service.set_bluetooth_sco_on(true).unwrap();
    assert!(!h.service.is_speakerphone_on());
    assert!(h.service.is_bluetooth_sco_on());

    h.service.set_speakerphone_on(false).unwrap();
    assert!(h.service.is_bluetooth_sco_on());
    h.settle().await;
    assert_eq!(h.service.device_for_stream(StreamType::VoiceCall).await, AudioDevice::EARPIECE);
}
