//! Shared plumbing for the Hive outpost system
//!
//! Everything the central controller and the outpost daemon have in common:
//! - Bus envelope parsing and building (`envelope`)
//! - Blob serialisation with the bus-safe padding substitution (`serial`)
//! - Ini-style configuration files (`conf`)
//! - Per-agent instruction sampling through an external profiler (`sampler`)

pub mod conf;
pub mod envelope;
pub mod sampler;
pub mod serial;

pub use conf::IniFile;
pub use envelope::Envelope;
