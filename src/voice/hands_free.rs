//! Hands-free re-arm policy
//!
//! Decides when the microphone should reopen on its own after the assistant has
//! spoken. All decisions go through [`HandsFree::evaluate`], which the pipeline
//! calls from its single transition dispatcher. The slot holds at most one pending
//! timer; anything that invalidates the conditions cancels it.

use tokio::task::JoinHandle;

/// Author of the latest chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The person talking to the companion
    User,
    /// The companion
    Assistant,
}

/// Snapshot of pipeline state relevant to re-arming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmConditions {
    /// Hands-free mode is on
    pub enabled: bool,
    /// A playback session is loading or playing
    pub speaking: bool,
    /// A recording session is open
    pub recording: bool,
    /// A transcription is in flight
    pub processing: bool,
    /// Who posted the latest message
    pub last_message: Option<Role>,
}

impl ArmConditions {
    /// Every condition for an automatic re-arm holds
    #[must_use]
    pub fn satisfied(&self) -> bool {
        self.enabled
            && !self.speaking
            && !self.recording
            && !self.processing
            && self.last_message == Some(Role::Assistant)
    }
}

/// Identifies one scheduled re-arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArmId(u64);

/// What the dispatcher must do after an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmAction {
    /// Spawn a debounce timer for this id and attach it
    Schedule(ArmId),
    /// A pending timer was cancelled
    Cancelled(ArmId),
    /// Nothing changed
    Unchanged,
}

#[derive(Debug, Default)]
enum ArmSlot {
    #[default]
    Idle,
    Pending {
        id: ArmId,
        timer: Option<JoinHandle<()>>,
    },
}

/// Hands-free state: the toggle and the single re-arm slot
#[derive(Debug, Default)]
pub struct HandsFree {
    enabled: bool,
    slot: ArmSlot,
    next_id: u64,
}

impl HandsFree {
    /// Hands-free off, nothing pending
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether hands-free is on
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turn hands-free on or off; turning off cancels any pending re-arm
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.cancel();
        }
    }

    /// Id of the pending re-arm, if any
    #[must_use]
    pub const fn pending(&self) -> Option<ArmId> {
        match &self.slot {
            ArmSlot::Idle => None,
            ArmSlot::Pending { id, .. } => Some(*id),
        }
    }

    /// The single authoritative re-arm check
    ///
    /// Schedules when the conditions hold and nothing is pending, cancels when they
    /// stop holding, otherwise leaves the slot alone.
    pub fn evaluate(&mut self, conditions: ArmConditions) -> ArmAction {
        if !conditions.satisfied() {
            return self
                .cancel()
                .map_or(ArmAction::Unchanged, ArmAction::Cancelled);
        }

        if self.pending().is_some() {
            return ArmAction::Unchanged;
        }

        self.next_id += 1;
        let id = ArmId(self.next_id);
        self.slot = ArmSlot::Pending { id, timer: None };
        ArmAction::Schedule(id)
    }

    /// Attach the timer task spawned for `id`
    ///
    /// Aborts the task instead if `id` was cancelled in the meantime.
    pub fn attach_timer(&mut self, id: ArmId, timer: JoinHandle<()>) {
        match &mut self.slot {
            ArmSlot::Pending {
                id: pending,
                timer: slot,
            } if *pending == id => {
                if let Some(stale) = slot.replace(timer) {
                    stale.abort();
                }
            }
            _ => timer.abort(),
        }
    }

    /// Claim the pending re-arm when its timer fires
    ///
    /// Returns false for a stale timer whose slot was cancelled or replaced.
    pub fn take_due(&mut self, id: ArmId) -> bool {
        if self.pending() != Some(id) {
            return false;
        }
        // The firing task is the timer itself; drop the handle without aborting it
        self.slot = ArmSlot::Idle;
        true
    }

    /// Cancel the pending re-arm, returning its id
    pub fn cancel(&mut self) -> Option<ArmId> {
        match std::mem::take(&mut self.slot) {
            ArmSlot::Idle => None,
            ArmSlot::Pending { id, timer } => {
                if let Some(timer) = timer {
                    timer.abort();
                }
                tracing::debug!(?id, "hands-free re-arm cancelled");
                Some(id)
            }
        }
    }
}
