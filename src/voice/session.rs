//! Exclusive hardware audio session
//!
//! Microphone and speaker share one session. Entering a mode is how the pipeline
//! claims the hardware; the previous owner must already be torn down.

use std::sync::{Arc, Mutex, PoisonError};

/// Mode the shared audio session is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioMode {
    /// Nothing holds the hardware
    #[default]
    Inactive,
    /// Microphone is capturing
    Record,
    /// Speaker output is allowed
    Playback,
}

/// Cloneable handle to the shared session mode
#[derive(Debug, Clone, Default)]
pub struct AudioSession {
    mode: Arc<Mutex<AudioMode>>,
}

impl AudioSession {
    /// Create an inactive session
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current mode
    #[must_use]
    pub fn mode(&self) -> AudioMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switch into record mode
    pub fn enter_record(&self) {
        self.set(AudioMode::Record);
    }

    /// Switch into playback-capable mode, releasing any record lock
    pub fn enter_playback(&self) {
        self.set(AudioMode::Playback);
    }

    /// Release the hardware
    pub fn deactivate(&self) {
        self.set(AudioMode::Inactive);
    }

    fn set(&self, mode: AudioMode) {
        let mut current = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != mode {
            tracing::trace!(from = ?*current, to = ?mode, "audio session mode");
            *current = mode;
        }
    }
}
