//! Serial side-effect queue
//!
//! Every hardware push, settings write and broadcast is an [`AudioCommand`]
//! consumed by one worker task, so side effects happen in a total order
//! even when the triggering calls race.
//!
//! Enqueue policies:
//! - [`EnqueuePolicy::Queue`]: always delivered
//! - [`EnqueuePolicy::Replace`]: supersedes any pending command of the same
//!   [`CommandKey`]; only the newest one runs
//! - [`EnqueuePolicy::NoOp`]: dropped if one of the same key is pending
//!
//! Replace and NoOp are tracked with a generation per key. A delivered
//! command runs only if its generation is still the current one.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::error::{AudioPolicyError, Result};
use crate::events::AudioEvent;
use crate::safe_volume::SafeMediaVolumeState;
use crate::sco::ScoAudioState;
use crate::system::BluetoothDevice;
use crate::types::{AudioDevice, ConnectionState, ForceConfig, ForceUsage, StreamType};

/// Side effect executed by the worker
#[derive(Debug)]
pub enum AudioCommand {
    /// Push one device's volume of a stream and its dependents
    ApplyDeviceVolume { stream: StreamType, device: AudioDevice },
    /// Push every device entry of a stream
    ApplyAllVolumes { stream: StreamType },
    PersistVolume { stream: StreamType, device: AudioDevice },
    PersistRingerMode,
    PersistSafeVolumeState { state: SafeMediaVolumeState },
    PersistMusicActiveMs,
    PersistMasterVolume,
    PersistMasterMute,
    PersistVibrateSetting,
    ApplyMasterVolume,
    ApplyMasterMute,
    SetForceUse { usage: ForceUsage, config: ForceConfig },
    SetParameters { key_values: String },
    /// Broadcast a SCO state unless it equals the last one sent
    BroadcastScoState { state: ScoAudioState },
    BroadcastBecomingNoisy,
    Emit(AudioEvent),
    /// Connection change of a wired output, deferred behind the noisy broadcast
    WiredDeviceConnection {
        device: AudioDevice,
        state: ConnectionState,
        name: String,
    },
    A2dpDeviceConnection {
        device: BluetoothDevice,
        state: ConnectionState,
    },
    /// Safe-volume music activity poll
    CheckMusicActive,
    /// Headset proxy did not arrive in time, or a pending request failed
    ScoProfileTimeout,
    LoadSoundEffects { reply: Option<oneshot::Sender<bool>> },
    UnloadSoundEffects,
    /// Barrier: answered once every earlier command has run
    Flush { reply: oneshot::Sender<()> },
    /// Stop the worker after the commands queued before it
    Shutdown,
}

/// Identity used by the Replace and NoOp policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKey {
    DeviceVolume(StreamType, AudioDevice),
    AllVolumes(StreamType),
    PersistVolume(StreamType, AudioDevice),
    RingerMode,
    SafeVolumeState,
    MusicActiveMs,
    MasterVolume,
    MasterMute,
    VibrateSetting,
    ApplyMasterVolume,
    ApplyMasterMute,
    ForceUse(ForceUsage),
    Parameters,
    ScoState,
    BecomingNoisy,
    Event,
    WiredConnection,
    A2dpConnection,
    CheckMusicActive,
    ScoProfileTimeout,
    LoadSoundEffects,
    UnloadSoundEffects,
    Control,
}

impl AudioCommand {
    pub fn key(&self) -> CommandKey {
        match self {
            AudioCommand::ApplyDeviceVolume { stream, device } => CommandKey::DeviceVolume(*stream, *device),
            AudioCommand::ApplyAllVolumes { stream } => CommandKey::AllVolumes(*stream),
            AudioCommand::PersistVolume { stream, device } => CommandKey::PersistVolume(*stream, *device),
            AudioCommand::PersistRingerMode => CommandKey::RingerMode,
            AudioCommand::PersistSafeVolumeState { .. } => CommandKey::SafeVolumeState,
            AudioCommand::PersistMusicActiveMs => CommandKey::MusicActiveMs,
            AudioCommand::PersistMasterVolume => CommandKey::MasterVolume,
            AudioCommand::PersistMasterMute => CommandKey::MasterMute,
            AudioCommand::PersistVibrateSetting => CommandKey::VibrateSetting,
            AudioCommand::ApplyMasterVolume => CommandKey::ApplyMasterVolume,
            AudioCommand::ApplyMasterMute => CommandKey::ApplyMasterMute,
            AudioCommand::SetForceUse { usage, .. } => CommandKey::ForceUse(*usage),
            AudioCommand::SetParameters { .. } => CommandKey::Parameters,
            AudioCommand::BroadcastScoState { .. } => CommandKey::ScoState,
            AudioCommand::BroadcastBecomingNoisy => CommandKey::BecomingNoisy,
            AudioCommand::Emit(_) => CommandKey::Event,
            AudioCommand::WiredDeviceConnection { .. } => CommandKey::WiredConnection,
            AudioCommand::A2dpDeviceConnection { .. } => CommandKey::A2dpConnection,
            AudioCommand::CheckMusicActive => CommandKey::CheckMusicActive,
            AudioCommand::ScoProfileTimeout => CommandKey::ScoProfileTimeout,
            AudioCommand::LoadSoundEffects { .. } => CommandKey::LoadSoundEffects,
            AudioCommand::UnloadSoundEffects => CommandKey::UnloadSoundEffects,
            AudioCommand::Flush { .. } | AudioCommand::Shutdown => CommandKey::Control,
        }
    }
}

/// How a command interacts with pending ones of the same key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueuePolicy {
    Queue,
    Replace,
    NoOp,
}

#[derive(Debug)]
struct Envelope {
    command: AudioCommand,
    ticket: Option<(CommandKey, u64)>,
}

#[derive(Debug)]
struct QueueShared {
    tx: mpsc::UnboundedSender<Envelope>,
    pending: DashMap<CommandKey, u64>,
    generation: AtomicU64,
    /// Delivered to the channel but not yet taken by the worker
    ready: AtomicUsize,
    closed: AtomicBool,
}

impl QueueShared {
    fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.ready.fetch_add(1, Ordering::SeqCst);
        self.tx.send(envelope).map_err(|_| {
            self.ready.fetch_sub(1, Ordering::SeqCst);
            AudioPolicyError::ServiceStopped
        })
    }
}

/// Sending half of the command queue
#[derive(Debug, Clone)]
pub struct CommandQueue {
    shared: Arc<QueueShared>,
}

/// Receiving half, owned by the worker task
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
    shared: Arc<QueueShared>,
}

impl CommandQueue {
    pub fn channel() -> (CommandQueue, CommandReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(QueueShared {
            tx,
            pending: DashMap::new(),
            generation: AtomicU64::new(0),
            ready: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        (
            CommandQueue {
                shared: shared.clone(),
            },
            CommandReceiver { rx, shared },
        )
    }

    /// Enqueue `command`, delivered after `delay`
    pub fn send(&self, command: AudioCommand, policy: EnqueuePolicy, delay: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(AudioPolicyError::ServiceStopped);
        }
        let key = command.key();
        let ticket = match policy {
            EnqueuePolicy::Queue => None,
            EnqueuePolicy::Replace => {
                let generation = self.next_generation();
                self.shared.pending.insert(key, generation);
                Some((key, generation))
            }
            EnqueuePolicy::NoOp => match self.shared.pending.entry(key) {
                Entry::Occupied(_) => {
                    trace!(?key, "command already pending");
                    return Ok(());
                }
                Entry::Vacant(slot) => {
                    let generation = self.next_generation();
                    slot.insert(generation);
                    Some((key, generation))
                }
            },
        };
        trace!(?key, ?policy, delay_ms = delay.as_millis() as u64, "command queued");
        let envelope = Envelope { command, ticket };
        if delay.is_zero() {
            return self.shared.deliver(envelope);
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if shared.deliver(envelope).is_err() {
                trace!("delayed command dropped, worker stopped");
            }
        });
        Ok(())
    }

    /// Enqueue with [`EnqueuePolicy::Queue`] and no delay
    pub fn post(&self, command: AudioCommand) -> Result<()> {
        self.send(command, EnqueuePolicy::Queue, Duration::ZERO)
    }

    /// Drop any pending Replace/NoOp command of `key`
    pub fn cancel(&self, key: CommandKey) -> bool {
        self.shared.pending.remove(&key).is_some()
    }

    pub fn has_pending(&self, key: CommandKey) -> bool {
        self.shared.pending.contains_key(&key)
    }

    /// Commands waiting in the channel
    pub fn ready_len(&self) -> usize {
        self.shared.ready.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst) || self.shared.tx.is_closed()
    }

    /// Refuse new commands; already queued ones still run
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }

    fn next_generation(&self) -> u64 {
        self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl CommandReceiver {
    /// Next command that is still current
    pub async fn recv(&mut self) -> Option<AudioCommand> {
        loop {
            let envelope = self.rx.recv().await?;
            self.shared.ready.fetch_sub(1, Ordering::SeqCst);
            if let Some((key, generation)) = envelope.ticket {
                let current = self
                    .shared
                    .pending
                    .remove_if(&key, |_, g| *g == generation)
                    .is_some();
                if !current {
                    trace!(?key, "superseded command dropped");
                    continue;
                }
            }
            return Some(envelope.command);
        }
    }
}

/// Executes commands taken off the queue
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: AudioCommand);
}

/// Run the worker loop until [`AudioCommand::Shutdown`]
pub fn spawn_worker(mut receiver: CommandReceiver, handler: Arc<dyn CommandHandler>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("audio worker started");
        while let Some(command) = receiver.recv().await {
            match command {
                AudioCommand::Flush { reply } => {
                    let _ = reply.send(());
                }
                AudioCommand::Shutdown => {
                    debug!("audio worker shutting down");
                    break;
                }
                command => handler.handle(command).await,
            }
        }
        info!("audio worker stopped");
    })
}

/// Wait until every command queued so far, and every command those
/// commands queued without delay, has run
pub async fn settle(queue: &CommandQueue) -> Result<()> {
    // bounded: commands that keep re-queueing themselves without delay would spin forever
    for _ in 0..64 {
        let (reply, done) = oneshot::channel();
        queue.send(AudioCommand::Flush { reply }, EnqueuePolicy::Queue, Duration::ZERO)?;
        done.await.map_err(|_| AudioPolicyError::ServiceStopped)?;
        if queue.ready_len() == 0 {
            return Ok(());
        }
    }
    Ok(())
}
