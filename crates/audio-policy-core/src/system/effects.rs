//! Sound effect asset loading

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait SoundEffectsLoader: Send + Sync {
    /// Load every effect; false if any asset failed
    async fn load(&self) -> bool;

    async fn unload(&self);
}

/// Loader with a configurable latency and result, counting its calls
#[derive(Debug)]
pub struct MockSoundEffects {
    latency: Duration,
    succeed: AtomicBool,
    loads: AtomicUsize,
    unloads: AtomicUsize,
}

impl MockSoundEffects {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            succeed: AtomicBool::new(true),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
        }
    }

    pub fn set_succeed(&self, succeed: bool) {
        self.succeed.store(succeed, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

impl Default for MockSoundEffects {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SoundEffectsLoader for MockSoundEffects {
    async fn load(&self) -> bool {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.succeed.load(Ordering::SeqCst)
    }

    async fn unload(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}
