//! Hybrid logical clock.
//!
//! Every entry carries a [`Timestamp`] made of a physical wall-clock reading
//! (nanoseconds since the Unix epoch) and a logical counter that breaks ties
//! when the wall clock does not advance between events. Timestamps are
//! compared lexicographically on `(wall_time, logical)`.
//!
//! A clock instance never hands out the same timestamp twice and never goes
//! backwards, including after observing a remote timestamp through
//! [`HybridLogicalClock::update`]. Anomalies (forward jumps, excessive remote
//! offsets, wall-time overflow) are reported as [`ClockError`]s and never
//! silently clamped.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

/// A point in hybrid logical time.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Wall-clock component in nanoseconds since the Unix epoch.
    pub wall_time: u64,
    /// Logical counter, incremented while the wall component is unchanged.
    pub logical: u32,
}

impl Timestamp {
    /// The smallest possible timestamp.
    pub const ZERO: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };

    pub fn new(wall_time: u64, logical: u32) -> Self {
        Timestamp { wall_time, logical }
    }

    /// Total order on `(wall_time, logical)`.
    pub fn compare(&self, other: &Timestamp) -> Ordering {
        self.cmp(other)
    }

    /// The larger of two timestamps.
    pub fn bigger(a: Timestamp, b: Timestamp) -> Timestamp {
        a.max(b)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.wall_time, self.logical)
    }
}

/// Clock anomalies.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("Forward clock jump of {jump}ns exceeds tolerance of {tolerance}ns")]
    ForwardJump { jump: u64, tolerance: u64 },

    #[error("Clock offset of {offset}ns exceeds maximum of {max_offset}ns")]
    Offset { offset: u64, max_offset: u64 },

    #[error("Wall time {time}ns exceeds bound {bound}ns")]
    WallTimeOverflow { time: u128, bound: u64 },
}

/// Source of physical time in nanoseconds.
pub trait WallClock: Send + Sync + fmt::Debug {
    fn now_ns(&self) -> u128;
}

impl<T: WallClock + ?Sized> WallClock for Arc<T> {
    fn now_ns(&self) -> u128 {
        (**self).now_ns()
    }
}

/// Reads `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_ns(&self) -> u128 {
        // A system clock set before 1970 reads as zero; the forward-jump
        // check reports it against the last issued timestamp.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
    }
}

/// Manually driven wall clock, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct ManualWallClock {
    time: Arc<AtomicU64>,
}

impl ManualWallClock {
    pub fn new(time_ns: u64) -> Self {
        ManualWallClock {
            time: Arc::new(AtomicU64::new(time_ns)),
        }
    }

    pub fn set(&self, time_ns: u64) {
        self.time.store(time_ns, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, delta_ns: u64) {
        self.time.fetch_add(delta_ns, AtomicOrdering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.time.load(AtomicOrdering::SeqCst)
    }
}

impl WallClock for ManualWallClock {
    fn now_ns(&self) -> u128 {
        self.get() as u128
    }
}

/// Bounds enforced by a clock. Zero disables a check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Largest accepted distance of a remote wall time ahead of ours.
    pub max_offset_ns: u64,
    /// Largest accepted wall time.
    pub wall_time_upper_bound_ns: u64,
    /// Largest accepted lead of the last issued wall time over the physical clock.
    pub tolerated_forward_clock_jump_ns: u64,
}

impl ClockConfig {
    pub fn with_max_offset(mut self, ns: u64) -> Self {
        self.max_offset_ns = ns;
        self
    }

    pub fn with_wall_time_upper_bound(mut self, ns: u64) -> Self {
        self.wall_time_upper_bound_ns = ns;
        self
    }

    pub fn with_tolerated_forward_clock_jump(mut self, ns: u64) -> Self {
        self.tolerated_forward_clock_jump_ns = ns;
        self
    }
}

/// Validation hooks run on every clock read.
///
/// The default methods enforce [`ClockConfig`]. Implementors may wrap them
/// to record metrics, but must return the same outcome.
pub trait ClockChecks: Send + Sync + fmt::Debug {
    fn validate_offset(&self, offset: u64, config: &ClockConfig) -> Result<(), ClockError> {
        if config.max_offset_ns > 0 && offset > config.max_offset_ns {
            warn!(offset, max_offset = config.max_offset_ns, "remote clock too far ahead");
            return Err(ClockError::Offset {
                offset,
                max_offset: config.max_offset_ns,
            });
        }
        Ok(())
    }

    fn validate_forward_jump(&self, jump: u64, config: &ClockConfig) -> Result<(), ClockError> {
        let tolerance = config.tolerated_forward_clock_jump_ns;
        if tolerance > 0 && jump > tolerance {
            warn!(jump, tolerance, "forward clock jump");
            return Err(ClockError::ForwardJump { jump, tolerance });
        }
        Ok(())
    }

    fn validate_wall_time(&self, time: u128, config: &ClockConfig) -> Result<(), ClockError> {
        if time > u64::MAX as u128 {
            return Err(ClockError::WallTimeOverflow {
                time,
                bound: u64::MAX,
            });
        }
        let bound = config.wall_time_upper_bound_ns;
        if bound > 0 && time > bound as u128 {
            warn!(%time, bound, "wall time above upper bound");
            return Err(ClockError::WallTimeOverflow { time, bound });
        }
        Ok(())
    }
}

impl<T: ClockChecks + ?Sized> ClockChecks for Arc<T> {
    fn validate_offset(&self, offset: u64, config: &ClockConfig) -> Result<(), ClockError> {
        (**self).validate_offset(offset, config)
    }

    fn validate_forward_jump(&self, jump: u64, config: &ClockConfig) -> Result<(), ClockError> {
        (**self).validate_forward_jump(jump, config)
    }

    fn validate_wall_time(&self, time: u128, config: &ClockConfig) -> Result<(), ClockError> {
        (**self).validate_wall_time(time, config)
    }
}

/// The stock checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictChecks;

impl ClockChecks for StrictChecks {}

/// Hybrid logical clock.
#[derive(Debug)]
pub struct HybridLogicalClock<W: WallClock = SystemWallClock, C: ClockChecks = StrictChecks> {
    wall_clock: W,
    checks: C,
    config: ClockConfig,
    last: Timestamp,
}

impl HybridLogicalClock {
    /// System-time clock with the stock checks.
    pub fn new(config: ClockConfig) -> Self {
        Self::with_parts(SystemWallClock, StrictChecks, config)
    }
}

impl Default for HybridLogicalClock {
    fn default() -> Self {
        Self::new(ClockConfig::default())
    }
}

impl<W: WallClock, C: ClockChecks> HybridLogicalClock<W, C> {
    pub fn with_parts(wall_clock: W, checks: C, config: ClockConfig) -> Self {
        HybridLogicalClock {
            wall_clock,
            checks,
            config,
            last: Timestamp::ZERO,
        }
    }

    /// Resume from a previously issued timestamp.
    pub fn with_last(mut self, last: Timestamp) -> Self {
        self.last = last;
        self
    }

    /// The last timestamp issued or observed.
    pub fn last(&self) -> Timestamp {
        self.last
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// Issue a timestamp for a local event.
    pub fn now(&mut self) -> Result<Timestamp, ClockError> {
        self.advance(None)
    }

    /// Observe a remote timestamp and issue one greater than both it and
    /// everything issued so far.
    pub fn update(&mut self, remote: &Timestamp) -> Result<Timestamp, ClockError> {
        self.advance(Some(remote))
    }

    fn physical(&self) -> Result<u64, ClockError> {
        let time = self.wall_clock.now_ns();
        self.checks.validate_wall_time(time, &self.config)?;
        u64::try_from(time).map_err(|_| ClockError::WallTimeOverflow {
            time,
            bound: u64::MAX,
        })
    }

    fn advance(&mut self, remote: Option<&Timestamp>) -> Result<Timestamp, ClockError> {
        let physical = self.physical()?;
        let last = self.last;

        if last.wall_time > physical {
            self.checks
                .validate_forward_jump(last.wall_time - physical, &self.config)?;
        }
        if let Some(remote) = remote {
            if remote.wall_time > physical {
                self.checks
                    .validate_offset(remote.wall_time - physical, &self.config)?;
            }
        }

        let remote_wall = remote.map(|r| r.wall_time).unwrap_or(0);
        let wall = physical.max(last.wall_time).max(remote_wall);

        // Only components sitting on the winning wall time carry their
        // logical counter forward.
        let local_logical = (last.wall_time == wall).then_some(last.logical);
        let remote_logical = remote
            .filter(|r| r.wall_time == wall)
            .map(|r| r.logical);

        let next = match local_logical.max(remote_logical) {
            None => Timestamp::new(wall, 0),
            Some(logical) => self.increment(wall, logical)?,
        };

        self.last = next;
        Ok(next)
    }

    fn increment(&self, wall: u64, logical: u32) -> Result<Timestamp, ClockError> {
        if let Some(next) = logical.checked_add(1) {
            return Ok(Timestamp::new(wall, next));
        }
        // Logical overflow rolls into the wall component.
        let rolled = wall as u128 + 1;
        self.checks.validate_wall_time(rolled, &self.config)?;
        let wall = u64::try_from(rolled).map_err(|_| ClockError::WallTimeOverflow {
            time: rolled,
            bound: u64::MAX,
        })?;
        Ok(Timestamp::new(wall, 0))
    }
}
