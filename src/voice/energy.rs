//! Voice energy budget
//!
//! Non-paying accounts get a daily budget of synthesized speech. The budget drains
//! once per second while their audio plays and refills on the first check of a new
//! day. Premium accounts are exempt from both.

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Full budget
pub const MAX_ENERGY: f32 = 100.0;

/// How often the drain timer ticks while exempt-free playback is running
pub const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// Percent drained per tick unless configured otherwise
pub const DEFAULT_DRAIN_PER_TICK: f32 = 1.0;

/// Depletable speech budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyBudget {
    energy_percent: f32,
    last_reset_date: NaiveDate,
    #[serde(skip)]
    premium_exempt: bool,
}

impl EnergyBudget {
    /// A full budget reset on `today`
    #[must_use]
    pub const fn new(today: NaiveDate) -> Self {
        Self {
            energy_percent: MAX_ENERGY,
            last_reset_date: today,
            premium_exempt: false,
        }
    }

    /// A budget at `percent`, clamped into range
    #[must_use]
    pub fn with_energy(percent: f32, today: NaiveDate) -> Self {
        let mut budget = Self::new(today);
        budget.energy_percent = clamp_percent(percent);
        budget
    }

    /// Remaining energy in `[0, 100]`
    #[must_use]
    pub const fn energy_percent(&self) -> f32 {
        self.energy_percent
    }

    /// Day of the last refill
    #[must_use]
    pub const fn last_reset_date(&self) -> NaiveDate {
        self.last_reset_date
    }

    /// Whether the account is exempt from metering
    #[must_use]
    pub const fn is_premium_exempt(&self) -> bool {
        self.premium_exempt
    }

    /// Update the exemption from the entitlement source
    pub const fn set_premium_exempt(&mut self, exempt: bool) {
        self.premium_exempt = exempt;
    }

    /// Out of energy and not exempt
    #[must_use]
    pub fn is_tired(&self) -> bool {
        self.energy_percent <= 0.0 && !self.premium_exempt
    }

    /// Whether playback should run the drain timer
    #[must_use]
    pub const fn meters_playback(&self) -> bool {
        !self.premium_exempt
    }

    /// Subtract `delta_percent`, clamping into `[0, 100]`
    ///
    /// No-op for exempt accounts. Returns the remaining energy.
    pub fn consume(&mut self, delta_percent: f32) -> f32 {
        if self.premium_exempt || !delta_percent.is_finite() {
            return self.energy_percent;
        }
        self.energy_percent = clamp_percent(self.energy_percent - delta_percent);
        self.energy_percent
    }

    /// Refill if the last reset happened on a different day
    ///
    /// Returns true when a refill happened.
    pub fn check_daily_reset(&mut self, today: NaiveDate) -> bool {
        if self.last_reset_date == today {
            return false;
        }
        tracing::info!(
            previous = %self.last_reset_date,
            %today,
            "daily voice energy reset"
        );
        self.energy_percent = MAX_ENERGY;
        self.last_reset_date = today;
        true
    }

    /// Load a saved budget, falling back to a full one
    ///
    /// Applies the daily reset against `today`.
    #[must_use]
    pub fn load_or_new(path: &Path, today: NaiveDate) -> Self {
        let mut budget = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Self>(&content) {
                Ok(budget) => budget,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to parse energy snapshot, starting full"
                    );
                    Self::new(today)
                }
            },
            Err(_) => Self::new(today),
        };
        budget.energy_percent = clamp_percent(budget.energy_percent);
        budget.check_daily_reset(today);
        budget
    }

    /// Persist the budget as JSON
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot cannot be written
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn clamp_percent(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, MAX_ENERGY)
}
