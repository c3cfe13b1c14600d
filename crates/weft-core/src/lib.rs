//! # weft-core
//!
//! Foundations shared by the Weft replicated log:
//! - [`Lattice`]: the join-semilattice contract replicas merge under
//! - [`HybridLogicalClock`]: causal timestamps combining wall time and a
//!   logical counter, with anomaly detection

pub mod clock;
pub mod lattice;

pub use clock::{
    ClockChecks, ClockConfig, ClockError, HybridLogicalClock, ManualWallClock, StrictChecks,
    SystemWallClock, Timestamp, WallClock,
};
pub use lattice::Lattice;
