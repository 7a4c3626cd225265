//! Service lifetime, peer death cleanup and sound effect loading

mod common;

use std::sync::Arc;
use std::time::Duration;

use audio_policy_core::prelude::*;
use audio_policy_core::system::{MockCollaborators, MockSoundEffects};
use common::{caller, Harness};
use serial_test::serial;
use tracing_test::traced_test;

#[tokio::test]
async fn test_peer_death_releases_everything_it_held() {
    let h = Harness::voice().await;
    h.connect_headset_profile().await;
    let token = ClientToken::new();
    let app = caller(10);

    h.service.set_stream_mute(StreamType::Music, true, token).unwrap();
    h.service.start_bluetooth_sco_virtual_call(token, &app).await.unwrap();
    h.service
        .set_mode(AudioMode::InCommunication, token, &app)
        .await
        .unwrap();
    let links = h.service.peer_links(&token).unwrap();
    assert!(links.muted.contains(StreamType::Music));
    assert!(links.sco);
    assert!(links.mode);

    h.service.on_peer_died(token).await.unwrap();

    assert!(!h.service.is_stream_mute(StreamType::Music));
    assert_eq!(h.service.sco_start_count(&token), 0);
    assert_eq!(h.mocks.headset.stop_count(), 1);
    assert_eq!(h.service.mode(), AudioMode::Normal);
    assert!(!h.service.is_peer_linked(&token));
}

#[tokio::test]
async fn test_dead_peer_mute_leaves_other_holders() {
    let h = Harness::voice().await;
    let (dead, alive) = (ClientToken::new(), ClientToken::new());
    h.service.set_stream_mute(StreamType::Music, true, dead).unwrap();
    h.service.set_stream_mute(StreamType::Music, true, dead).unwrap();
    h.service.set_stream_mute(StreamType::Music, true, alive).unwrap();

    h.service.on_peer_died(dead).await.unwrap();
    assert!(h.service.is_stream_mute(StreamType::Music));

    h.service.set_stream_mute(StreamType::Music, false, alive).unwrap();
    assert!(!h.service.is_stream_mute(StreamType::Music));
}

#[tokio::test]
async fn test_death_of_unknown_peer_is_ignored() {
    let h = Harness::voice().await;
    h.service.on_peer_died(ClientToken::new()).await.unwrap();
    assert_eq!(h.service.mode(), AudioMode::Normal);
}

#[tokio::test]
#[traced_test]
async fn test_sound_effects_load() {
    let h = Harness::voice().await;
    assert!(h.service.load_sound_effects().await.unwrap());
    assert_eq!(h.mocks.sound_effects.load_count(), 1);

    h.mocks.sound_effects.set_succeed(false);
    assert!(!h.service.load_sound_effects().await.unwrap());

    h.service.unload_sound_effects().unwrap();
    h.settle().await;
    assert_eq!(h.mocks.sound_effects.unload_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_sound_effects_time_out() {
    let mut mocks = MockCollaborators::new();
    mocks.sound_effects = Arc::new(MockSoundEffects::with_latency(Duration::from_secs(20)));
    let h = Harness::with_mocks(AudioPolicyConfig::voice(), mocks).await;

    let result = h.service.load_sound_effects().await;
    assert!(matches!(result, Err(AudioPolicyError::Timeout { .. })));
}

#[tokio::test]
async fn test_stopped_service_refuses_requests() {
    let h = Harness::voice().await;
    h.service.shutdown().await.unwrap();
    assert!(!h.service.is_running());

    let result = h
        .service
        .set_stream_volume(StreamType::Music, 3, VolumeFlags::NONE, &caller(10))
        .await;
    assert!(matches!(result, Err(AudioPolicyError::ServiceStopped)));
    assert!(h.service.settle().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_concurrent_adjusts_are_not_lost() {
    let h = Harness::voice().await;
    h.service
        .set_stream_volume(StreamType::Music, 0, VolumeFlags::NONE, &caller(10))
        .await
        .unwrap();

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let service = h.service.clone();
            tokio::spawn(async move {
                service
                    .adjust_stream_volume(
                        StreamType::Music,
                        AdjustDirection::Raise,
                        VolumeFlags::NONE,
                        &caller(100 + i),
                    )
                    .await
            })
        })
        .collect();
    for result in futures::future::join_all(tasks).await {
        assert!(result.unwrap().unwrap().is_applied());
    }

    assert_eq!(h.service.get_stream_volume(StreamType::Music).await, 10);
    h.settle().await;
    assert_eq!(
        h.mocks.audio_system.volume_index(StreamType::Music, AudioDevice::SPEAKER),
        Some(10)
    );
}
