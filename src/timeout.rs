//! Layered timeout policy.
//!
//! A run carries four independent timer tiers:
//!
//! | Tier | Started | Restarted | Bounds |
//! |------|---------|-----------|--------|
//! | `backend_startup` | run start | never | waiting for a worker to connect |
//! | `per_shot` | each shot | at every shot start | reading one shot |
//! | `per_result` | each read | before every blocking read | one stream entry |
//! | `overall` | run start | never | the whole run |
//!
//! An absent duration means the tier is unbounded. Every blocking wait is
//! bounded by the earliest deadline among the tiers active for that phase;
//! when it passes, every active tier whose deadline has passed is reported.
//!
//! Timers use [`tokio::time::Instant`] so they follow a paused test clock.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Timeout configuration for a run. Absence of a field means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeout {
    /// Maximum wait for a worker to connect to its result stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_startup: Option<Duration>,
    /// Maximum wait for any single stream entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_result: Option<Duration>,
    /// Maximum duration of a single shot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_shot: Option<Duration>,
    /// Maximum duration of the whole run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall: Option<Duration>,
}

impl Timeout {
    /// No bound on anything.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Only an overall bound. This is how a single scalar timeout resolves.
    pub fn overall(duration: Duration) -> Self {
        Self {
            overall: Some(duration),
            ..Self::default()
        }
    }

    /// Resolve a scalar number of seconds into an overall bound.
    /// Negative or non-finite values are treated as zero.
    pub fn from_secs_f64(secs: f64) -> Self {
        Self::overall(Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO))
    }

    pub fn with_backend_startup(mut self, duration: Duration) -> Self {
        self.backend_startup = Some(duration);
        self
    }

    pub fn with_per_result(mut self, duration: Duration) -> Self {
        self.per_result = Some(duration);
        self
    }

    pub fn with_per_shot(mut self, duration: Duration) -> Self {
        self.per_shot = Some(duration);
        self
    }

    pub fn with_overall(mut self, duration: Duration) -> Self {
        self.overall = Some(duration);
        self
    }

    /// Duration configured for a tier.
    pub fn get(&self, kind: TimerKind) -> Option<Duration> {
        match kind {
            TimerKind::BackendStartup => self.backend_startup,
            TimerKind::PerShot => self.per_shot,
            TimerKind::PerResult => self.per_result,
            TimerKind::Overall => self.overall,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::overall(duration)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(duration: Option<Duration>) -> Self {
        duration.map(Self::overall).unwrap_or_default()
    }
}

/// One timer tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    BackendStartup,
    PerShot,
    PerResult,
    Overall,
}

impl TimerKind {
    /// All tiers, in reporting order.
    pub const ALL: [TimerKind; 4] = [
        TimerKind::BackendStartup,
        TimerKind::PerShot,
        TimerKind::PerResult,
        TimerKind::Overall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::BackendStartup => "backend_startup",
            TimerKind::PerShot => "per_shot",
            TimerKind::PerResult => "per_result",
            TimerKind::Overall => "overall",
        }
    }

    fn index(self) -> usize {
        match self {
            TimerKind::BackendStartup => 0,
            TimerKind::PerShot => 1,
            TimerKind::PerResult => 2,
            TimerKind::Overall => 3,
        }
    }
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A started timer with an optional deadline.
#[derive(Debug, Clone)]
pub struct Timer {
    kind: TimerKind,
    start: Instant,
    duration: Option<Duration>,
    end: Option<Instant>,
}

impl Timer {
    /// Start a timer now. `None` means it never expires.
    pub fn start(kind: TimerKind, duration: Option<Duration>) -> Self {
        let start = Instant::now();
        Self {
            kind,
            start,
            duration,
            end: duration.and_then(|d| start.checked_add(d)),
        }
    }

    /// Restart the timer from now with the same duration.
    pub fn reset(&mut self) {
        *self = Self::start(self.kind, self.duration);
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.end
    }

    /// Time left before expiry. `None` if unbounded, zero once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.end
            .map(|end| end.saturating_duration_since(Instant::now()))
    }

    pub fn has_expired(&self) -> bool {
        self.has_expired_at(Instant::now())
    }

    pub fn has_expired_at(&self, now: Instant) -> bool {
        self.end.is_some_and(|end| now >= end)
    }
}

/// Error returned by [`TimerSet::bound`]: the tiers whose deadlines passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired(pub Vec<TimerKind>);

impl Expired {
    pub fn contains(&self, kind: TimerKind) -> bool {
        self.0.contains(&kind)
    }
}

impl std::fmt::Display for Expired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Expired timers: ")?;
        for (i, kind) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "'{kind}'")?;
        }
        Ok(())
    }
}

/// All four tiers of a run.
#[derive(Debug, Clone)]
pub struct TimerSet {
    timers: [Timer; 4],
}

impl TimerSet {
    /// Start every tier now.
    pub fn start(timeout: &Timeout) -> Self {
        Self {
            timers: TimerKind::ALL.map(|kind| Timer::start(kind, timeout.get(kind))),
        }
    }

    pub fn get(&self, kind: TimerKind) -> &Timer {
        &self.timers[kind.index()]
    }

    pub fn reset(&mut self, kind: TimerKind) {
        self.timers[kind.index()].reset();
    }

    /// Soonest remaining time across `active`, or `None` if all unbounded.
    pub fn min_remaining(&self, active: &[TimerKind]) -> Option<Duration> {
        active
            .iter()
            .filter_map(|&kind| self.get(kind).remaining())
            .min()
    }

    /// Soonest deadline across `active`, or `None` if all unbounded.
    pub fn earliest_deadline(&self, active: &[TimerKind]) -> Option<Instant> {
        active
            .iter()
            .filter_map(|&kind| self.get(kind).deadline())
            .min()
    }

    /// Active tiers whose deadline is at or before `now`, in reporting order.
    pub fn expired_at(&self, active: &[TimerKind], now: Instant) -> Vec<TimerKind> {
        TimerKind::ALL
            .into_iter()
            .filter(|kind| active.contains(kind) && self.get(*kind).has_expired_at(now))
            .collect()
    }

    /// Run `fut` until it completes or the earliest active deadline passes.
    ///
    /// If a deadline has already passed the future is not polled at all.
    pub async fn bound<F: Future>(
        &self,
        active: &[TimerKind],
        fut: F,
    ) -> Result<F::Output, Expired> {
        let expired = self.expired_at(active, Instant::now());
        if !expired.is_empty() {
            return Err(Expired(expired));
        }
        let Some(deadline) = self.earliest_deadline(active) else {
            return Ok(fut.await);
        };
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(output) => Ok(output),
            Err(_) => {
                let now = Instant::now().max(deadline);
                Err(Expired(self.expired_at(active, now)))
            }
        }
    }
}
