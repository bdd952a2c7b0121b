//! svcvm-recovery: what happens when hosting devices or their agents stop
//! responding.
//!
//! [`RecoveryHandler`] unschedules everything a failed device hosted,
//! deletes the device and tells the agent host once. [`BackgroundLoops`]
//! drives the periodic sweeps: dead agents, agent-less devices and the
//! scheduling backlog.

pub mod error;
pub mod handler;
pub mod monitor;

pub use error::{RecoveryError, RecoveryResult};
pub use handler::{RecoveryHandler, SweepReport};
pub use monitor::{BackgroundLoops, LoopIntervals};
