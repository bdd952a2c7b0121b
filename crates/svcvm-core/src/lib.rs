//! svcvm-core: shared configuration and coordination helpers.
//!
//! Holds the `svcvm.toml` configuration model passed explicitly into every
//! component constructor, the named lock scopes used to serialize
//! resolution of cacheable identifiers, and the epoch clock.

pub mod config;
pub mod locks;
pub mod time;

pub use config::ServiceVmConfig;
pub use locks::NamedLocks;
pub use time::epoch_secs;
