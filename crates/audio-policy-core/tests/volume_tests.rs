//! Stream volume, alias and mute behaviour of the audio service

mod common;

use std::time::Duration;

use audio_policy_core::prelude::*;
use audio_policy_core::system::{InMemorySettings, MockCollaborators, SettingsStore};
use audio_policy_core::types::AppOp;
use common::{caller, drain, Harness};
use tracing_test::traced_test;

#[tokio::test]
#[traced_test]
async fn test_set_then_get_music_volume() {
    let h = Harness::voice().await;
    let mut events = h.service.subscribe();

    let outcome = h
        .service
        .set_stream_volume(StreamType::Music, 10, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    assert_eq!(outcome, VolumeOutcome::Applied);
    assert_eq!(h.service.get_stream_volume(StreamType::Music).await, 10);

    h.settle().await;
    assert_eq!(
        h.mocks.audio_system.volume_index(StreamType::Music, AudioDevice::SPEAKER),
        Some(10)
    );
    assert!(drain(&mut events).contains(&AudioEvent::VolumeChanged {
        stream: StreamType::Music,
        alias: StreamType::Music,
        device: AudioDevice::SPEAKER,
        previous_volume: 11,
        volume: 10,
    }));
}

#[tokio::test]
async fn test_volume_clamped_to_stream_max() {
    let h = Harness::voice().await;
    h.service
        .set_stream_volume(StreamType::Music, 99, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    assert_eq!(h.service.get_stream_volume(StreamType::Music).await, 15);
    assert_eq!(h.service.get_stream_max_volume(StreamType::Music), 15);
}

#[tokio::test]
async fn test_ring_volume_propagates_to_aliased_streams() {
    let h = Harness::voice().await;
    h.service
        .set_stream_volume(StreamType::Ring, 3, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();

    assert_eq!(h.service.get_stream_volume(StreamType::Ring).await, 3);
    assert_eq!(h.service.get_stream_volume(StreamType::Notification).await, 3);
    assert_eq!(h.service.get_stream_volume(StreamType::System).await, 3);
    // other targets are untouched
    assert_eq!(h.service.get_stream_volume(StreamType::Alarm).await, 6);
}

#[tokio::test]
async fn test_adjust_moves_one_step() {
    let h = Harness::voice().await;
    let outcome = h
        .service
        .adjust_stream_volume(StreamType::Music, AdjustDirection::Raise, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    assert_eq!(outcome, VolumeOutcome::Applied);
    assert_eq!(h.service.get_stream_volume(StreamType::Music).await, 12);

    h.service
        .adjust_stream_volume(StreamType::Music, AdjustDirection::Lower, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    h.service
        .adjust_stream_volume(StreamType::Music, AdjustDirection::Lower, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    assert_eq!(h.service.get_stream_volume(StreamType::Music).await, 10);
}

#[tokio::test]
async fn test_adjust_at_limit_is_unchanged() {
    let h = Harness::voice().await;
    h.service
        .set_stream_volume(StreamType::Music, 15, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    let outcome = h
        .service
        .adjust_stream_volume(StreamType::Music, AdjustDirection::Raise, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    assert_eq!(outcome, VolumeOutcome::Unchanged);
    assert_eq!(h.service.get_stream_volume(StreamType::Music).await, 15);
}

#[tokio::test]
async fn test_suggested_stream_follows_activity() {
    let h = Harness::voice().await;

    // nothing playing: volume keys drive the ringer
    h.service
        .adjust_suggested_stream_volume(AdjustDirection::Raise, None, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    assert_eq!(h.service.get_stream_volume(StreamType::Ring).await, 6);
    assert_eq!(h.service.get_stream_volume(StreamType::Music).await, 11);

    h.mocks.audio_system.set_stream_active(StreamType::Music, true);
    h.service
        .adjust_suggested_stream_volume(AdjustDirection::Raise, None, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    assert_eq!(h.service.get_stream_volume(StreamType::Music).await, 12);
    assert_eq!(h.service.get_stream_volume(StreamType::Ring).await, 6);
}

#[tokio::test]
async fn test_app_op_denied_leaves_volume() {
    let h = Harness::voice().await;
    h.mocks.permissions.deny_app_op(AppOp::AudioMediaVolume);

    let outcome = h
        .service
        .set_stream_volume(StreamType::Music, 3, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    assert_eq!(outcome, VolumeOutcome::PermissionDenied);
    let outcome = h
        .service
        .adjust_stream_volume(StreamType::Music, AdjustDirection::Lower, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    assert_eq!(outcome, VolumeOutcome::PermissionDenied);
    assert_eq!(h.service.get_stream_volume(StreamType::Music).await, 11);

    // ring volume uses a different op
    let outcome = h
        .service
        .set_stream_volume(StreamType::Ring, 2, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    assert_eq!(outcome, VolumeOutcome::Applied);
}

#[tokio::test]
async fn test_fixed_volume_output_plays_full_scale() {
    let h = Harness::voice().await;
    h.mocks.audio_system.set_route(StreamType::Music, AudioDevice::HDMI);

    h.service
        .set_stream_volume(StreamType::Music, 3, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    assert_eq!(h.service.get_stream_volume(StreamType::Music).await, 15);
    assert_eq!(h.service.stream_index(StreamType::Music, AudioDevice::HDMI), 150);

    h.service
        .set_stream_volume(StreamType::Music, 0, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    assert_eq!(h.service.get_stream_volume(StreamType::Music).await, 0);
}

#[tokio::test]
async fn test_mute_is_counted_per_client() {
    let h = Harness::voice().await;
    let first = ClientToken::new();
    let second = ClientToken::new();

    assert_eq!(
        h.service.set_stream_mute(StreamType::Music, true, first).unwrap(),
        VolumeOutcome::Applied
    );
    assert_eq!(
        h.service.set_stream_mute(StreamType::Music, true, first).unwrap(),
        VolumeOutcome::Unchanged
    );
    h.service.set_stream_mute(StreamType::Music, true, second).unwrap();
    assert!(h.service.is_stream_mute(StreamType::Music));
    assert_eq!(h.service.get_stream_volume(StreamType::Music).await, 0);
    assert_eq!(h.service.get_last_audible_stream_volume(StreamType::Music).await, 11);

    h.service.set_stream_mute(StreamType::Music, false, second).unwrap();
    h.service.set_stream_mute(StreamType::Music, false, first).unwrap();
    assert!(h.service.is_stream_mute(StreamType::Music));
    assert!(!h.service.is_peer_linked(&second));

    assert_eq!(
        h.service.set_stream_mute(StreamType::Music, false, first).unwrap(),
        VolumeOutcome::Applied
    );
    assert!(!h.service.is_stream_mute(StreamType::Music));
    assert!(!h.service.is_peer_linked(&first));
    assert_eq!(h.service.get_stream_volume(StreamType::Music).await, 11);
}

#[tokio::test]
async fn test_mute_reaches_hardware() {
    let h = Harness::voice().await;
    let token = ClientToken::new();
    h.service.set_stream_mute(StreamType::Music, true, token).unwrap();
    h.settle().await;
    assert_eq!(
        h.mocks.audio_system.volume_index(StreamType::Music, AudioDevice::DEFAULT),
        Some(0)
    );

    h.service.set_stream_mute(StreamType::Music, false, token).unwrap();
    h.settle().await;
    assert_eq!(
        h.mocks.audio_system.volume_index(StreamType::Music, AudioDevice::DEFAULT),
        Some(11)
    );
}

#[tokio::test]
async fn test_mute_ignored_for_unaffected_stream() {
    let h = Harness::voice().await;
    let token = ClientToken::new();
    assert_eq!(
        h.service.set_stream_mute(StreamType::VoiceCall, true, token).unwrap(),
        VolumeOutcome::Ignored
    );
    assert!(!h.service.is_stream_mute(StreamType::VoiceCall));
    assert!(!h.service.is_peer_linked(&token));
}

#[tokio::test]
async fn test_solo_mutes_other_streams() {
    let h = Harness::voice().await;
    let token = ClientToken::new();
    h.service.set_stream_solo(StreamType::Music, true, token).unwrap();
    assert!(!h.service.is_stream_mute(StreamType::Music));
    assert!(h.service.is_stream_mute(StreamType::Ring));
    assert!(h.service.is_stream_mute(StreamType::Notification));
    assert!(!h.service.is_stream_mute(StreamType::Alarm));

    h.service.set_stream_solo(StreamType::Music, false, token).unwrap();
    assert!(!h.service.is_stream_mute(StreamType::Ring));
    assert!(!h.service.is_peer_linked(&token));
}

#[tokio::test(start_paused = true)]
async fn test_volume_persisted_after_delay() {
    let h = Harness::voice().await;
    h.service
        .set_stream_volume(StreamType::Music, 7, VolumeFlags::NONE, &caller(100))
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.mocks.settings.get_int("volume_music_speaker"), None);

    tokio::time::sleep(Duration::from_millis(600)).await;
    h.settle().await;
    assert_eq!(h.mocks.settings.get_int("volume_music_speaker"), Some(7));
}

#[tokio::test]
async fn test_persisted_volumes_loaded_at_start() {
    let settings = InMemorySettings::with_values([("volume_music_speaker", 4), ("volume_ring", 2)]);
    let h = Harness::with_mocks(AudioPolicyConfig::voice(), MockCollaborators::with_settings(settings)).await;

    assert_eq!(h.service.get_stream_volume(StreamType::Music).await, 4);
    assert_eq!(h.service.get_stream_volume(StreamType::Ring).await, 2);
    // notification mirrors ring
    assert_eq!(h.service.get_stream_volume(StreamType::Notification).await, 2);
}

#[tokio::test]
async fn test_master_volume_clamped_and_persisted() {
    let h = Harness::voice().await;
    assert_eq!(h.service.master_volume(), 100);
    assert_eq!(h.service.set_master_volume(40).unwrap(), VolumeOutcome::Applied);
    assert_eq!(h.service.set_master_volume(40).unwrap(), VolumeOutcome::Unchanged);
    assert_eq!(h.service.set_master_volume(250).unwrap(), VolumeOutcome::Applied);
    assert_eq!(h.service.master_volume(), h.service.master_max_volume());

    h.service.set_master_mute(true).unwrap();
    assert!(h.service.is_master_mute());
    h.settle().await;
    assert!(h
        .mocks
        .audio_system
        .calls()
        .contains(&audio_policy_core::system::NativeCall::SetMasterMute(true)));
}
