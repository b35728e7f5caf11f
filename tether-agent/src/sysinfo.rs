//! Host information collection.

use async_trait::async_trait;

/// Supplies the strings sent back in a sysinfo response.
#[async_trait]
pub trait SysInfoProvider: Send + Sync {
    async fn collect(&self) -> Vec<String>;
}

/// Default provider backed by the standard library.
#[derive(Debug, Default)]
pub struct SysInfoCollector;

#[async_trait]
impl SysInfoProvider for SysInfoCollector {
    async fn collect(&self) -> Vec<String> {
        vec![
            format!(
                "Hostname: {}",
                hostname().unwrap_or_else(|| "unknown-host".to_string())
            ),
            format!(
                "Operating-System: {} ({})",
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
            format!("Process-ID: {}", std::process::id()),
        ]
    }
}

/// Best-effort host name from the environment.
pub fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .filter(|name| !name.is_empty())
}
