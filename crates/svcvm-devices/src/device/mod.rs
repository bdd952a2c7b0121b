//! Hosting device drivers.

mod csr1kv;
mod guest_agent;

pub use csr1kv::Csr1kvDriver;
pub use guest_agent::GuestAgentDriver;
