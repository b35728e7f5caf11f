//! # tether-agent
//!
//! The administered endpoint: connects out to a tether server,
//! announces its identity, and serves directory listings, chunked file
//! transfers, uploads, and system-information requests. Reconnects
//! automatically when the connection drops.

pub mod config;
pub mod service;
pub mod sysinfo;

pub use config::AgentConfig;
pub use service::{AgentService, DirLister, StdDirLister};
pub use sysinfo::{SysInfoCollector, SysInfoProvider};
