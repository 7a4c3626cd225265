//! Audio mode owners
//!
//! Callers that put the device in a non-normal mode are kept on a stack,
//! most recent first. The head decides the effective mode; NORMAL requests
//! and peer deaths fall back to whoever is next.
//!
//! Applying a mode needs a native call that may fail, so the registry only
//! exposes the steps of that loop ([`prepare`](ModeOwnerRegistry::prepare),
//! [`commit`](ModeOwnerRegistry::commit), [`reject`](ModeOwnerRegistry::reject))
//! and never calls out while its lock is held.

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{AudioMode, ClientToken};

/// One claimant on the mode stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeEntry {
    pub token: ClientToken,
    pub pid: u32,
    pub mode: AudioMode,
}

/// Mode to try next, and the entry it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeCandidate {
    pub mode: AudioMode,
    pub holder: Option<ClientToken>,
}

#[derive(Debug)]
struct ModeStack {
    entries: Vec<ModeEntry>,
    mode: AudioMode,
}

impl ModeStack {
    fn candidate_for_normal(&self) -> ModeCandidate {
        match self.entries.first() {
            Some(head) => ModeCandidate {
                mode: head.mode,
                holder: Some(head.token),
            },
            None => ModeCandidate {
                mode: AudioMode::Normal,
                holder: None,
            },
        }
    }
}

/// Stack of audio mode claimants
pub struct ModeOwnerRegistry {
    stack: Mutex<ModeStack>,
}

impl Default for ModeOwnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeOwnerRegistry {
    pub fn new() -> Self {
        Self {
            stack: Mutex::new(ModeStack {
                entries: Vec::new(),
                mode: AudioMode::Normal,
            }),
        }
    }

    /// Mode last accepted by the audio system
    pub fn mode(&self) -> AudioMode {
        self.stack.lock().mode
    }

    /// Pid at the head of the stack, if any
    pub fn head_pid(&self) -> Option<u32> {
        self.stack.lock().entries.first().map(|e| e.pid)
    }

    /// Pid of the current non-normal owner, 0 when there is none
    pub fn owner_pid(&self) -> u32 {
        let stack = self.stack.lock();
        if stack.mode == AudioMode::Normal {
            return 0;
        }
        stack.entries.first().map(|e| e.pid).unwrap_or(0)
    }

    pub fn entries(&self) -> Vec<ModeEntry> {
        self.stack.lock().entries.clone()
    }

    pub fn contains(&self, token: &ClientToken) -> bool {
        self.stack.lock().entries.iter().any(|e| e.token == *token)
    }

    pub fn pid_of(&self, token: &ClientToken) -> Option<u32> {
        self.stack
            .lock()
            .entries
            .iter()
            .find(|e| e.token == *token)
            .map(|e| e.pid)
    }

    /// First step of a mode request
    ///
    /// Drops the caller's previous entry (matched by pid), then either
    /// pushes a fresh entry at the head or, for NORMAL, proposes the mode
    /// of whoever is now at the head.
    pub fn prepare(&self, mode: AudioMode, token: ClientToken, pid: u32) -> ModeCandidate {
        let mut stack = self.stack.lock();
        if let Some(i) = stack.entries.iter().position(|e| e.pid == pid) {
            stack.entries.remove(i);
        }

        if mode == AudioMode::Normal {
            return stack.candidate_for_normal();
        }
        stack.entries.insert(0, ModeEntry { token, pid, mode });
        debug!(?mode, pid, depth = stack.entries.len(), "mode entry pushed");
        ModeCandidate {
            mode,
            holder: Some(token),
        }
    }

    /// True if `mode` is already the applied mode
    pub fn is_current(&self, mode: AudioMode) -> bool {
        self.stack.lock().mode == mode
    }

    /// The audio system accepted `mode`
    pub fn commit(&self, mode: AudioMode) {
        self.stack.lock().mode = mode;
    }

    /// The audio system refused the candidate
    ///
    /// Removes the entry that proposed it and returns the next candidate.
    /// Once the stack is empty that is NORMAL with no holder; `None` means
    /// NORMAL itself was refused.
    pub fn reject(&self, candidate: ModeCandidate) -> Option<ModeCandidate> {
        let mut stack = self.stack.lock();
        warn!(mode = ?candidate.mode, "audio system refused mode");
        if let Some(holder) = candidate.holder {
            stack.entries.retain(|e| e.token != holder);
        }
        if candidate.mode == AudioMode::Normal && stack.entries.is_empty() {
            return None;
        }
        Some(stack.candidate_for_normal())
    }

    /// Record NORMAL without the audio system's consent
    ///
    /// Last resort when even NORMAL was refused; the stack is dropped so no
    /// claimant is left owning a mode that is not applied.
    pub fn force_normal(&self) {
        let mut stack = self.stack.lock();
        stack.entries.clear();
        stack.mode = AudioMode::Normal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(registry: &ModeOwnerRegistry, mode: AudioMode, token: ClientToken, pid: u32) -> AudioMode {
        let candidate = registry.prepare(mode, token, pid);
        registry.commit(candidate.mode);
        candidate.mode
    }

    #[test]
    fn test_most_recent_caller_wins() {
        let registry = ModeOwnerRegistry::new();
        let a = ClientToken::new();
        let b = ClientToken::new();
        resolve(&registry, AudioMode::InCall, a, 10);
        resolve(&registry, AudioMode::InCommunication, b, 20);
        assert_eq!(registry.mode(), AudioMode::InCommunication);
        assert_eq!(registry.owner_pid(), 20);

        // the same pid calling again moves back to the head
        resolve(&registry, AudioMode::InCall, a, 10);
        assert_eq!(registry.owner_pid(), 10);
        assert_eq!(registry.entries().len(), 2);
    }

    #[test]
    fn test_normal_pops_to_previous_owner() {
        let registry = ModeOwnerRegistry::new();
        let a = ClientToken::new();
        let b = ClientToken::new();
        resolve(&registry, AudioMode::InCall, a, 10);
        resolve(&registry, AudioMode::InCommunication, b, 20);

        let mode = resolve(&registry, AudioMode::Normal, b, 20);
        assert_eq!(mode, AudioMode::InCall);
        assert_eq!(registry.owner_pid(), 10);

        let mode = resolve(&registry, AudioMode::Normal, a, 10);
        assert_eq!(mode, AudioMode::Normal);
        assert_eq!(registry.owner_pid(), 0);
        assert!(registry.entries().is_empty());
    }

    #[test]
    fn test_reject_falls_back_through_the_stack() {
        let registry = ModeOwnerRegistry::new();
        let a = ClientToken::new();
        let b = ClientToken::new();
        resolve(&registry, AudioMode::InCall, a, 10);

        let candidate = registry.prepare(AudioMode::Ringtone, b, 20);
        let next = registry.reject(candidate).unwrap();
        assert_eq!(next.mode, AudioMode::InCall);
        assert_eq!(next.holder, Some(a));
        assert!(!registry.contains(&b));

        let last = registry.reject(next).unwrap();
        assert_eq!(last.mode, AudioMode::Normal);
        assert_eq!(last.holder, None);
        assert!(registry.entries().is_empty());

        assert!(registry.reject(last).is_none());
    }

    #[test]
    fn test_force_normal_drops_every_claimant() {
        let registry = ModeOwnerRegistry::new();
        resolve(&registry, AudioMode::InCall, ClientToken::new(), 10);
        resolve(&registry, AudioMode::Ringtone, ClientToken::new(), 20);

        registry.force_normal();
        assert_eq!(registry.mode(), AudioMode::Normal);
        assert_eq!(registry.owner_pid(), 0);
        assert!(registry.entries().is_empty());
    }

    #[test]
    fn test_reused_pid_replaces_entry() {
        let registry = ModeOwnerRegistry::new();
        let first = ClientToken::new();
        let second = ClientToken::new();
        resolve(&registry, AudioMode::InCall, first, 10);
        resolve(&registry, AudioMode::InCommunication, second, 10);
        assert!(!registry.contains(&first));
        assert_eq!(registry.pid_of(&second), Some(10));
        assert_eq!(registry.entries().len(), 1);
    }
}
