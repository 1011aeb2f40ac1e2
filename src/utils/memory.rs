//! Process RSS sampling for logging and trace records.

use std::io;

/// Resident set size of the current process.
#[derive(Debug, Clone, Copy)]
pub struct MemoryInfo {
    pub rss_bytes: u64,
}

impl MemoryInfo {
    pub fn current() -> io::Result<Self> {
        Ok(Self {
            rss_bytes: current_rss_bytes()?,
        })
    }

    /// Format bytes as human-readable string
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    pub fn rss_formatted(&self) -> String {
        Self::format_bytes(self.rss_bytes)
    }
}

#[cfg(target_os = "linux")]
fn current_rss_bytes() -> io::Result<u64> {
    let status = std::fs::read_to_string("/proc/self/status")?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "unparseable VmRSS line")
                })?;
            return Ok(kb * 1024);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "VmRSS not present in /proc/self/status",
    ))
}

#[cfg(target_os = "macos")]
fn current_rss_bytes() -> io::Result<u64> {
    use std::process::Command;

    let output = Command::new("ps")
        .args(["-o", "rss=", "-p", &std::process::id().to_string()])
        .output()?;

    let kb: u64 = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "unparseable ps rss output"))?;
    Ok(kb * 1024)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn current_rss_bytes() -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "RSS sampling not supported on this platform",
    ))
}

/// Tracks the peak RSS observed across checks.
#[derive(Debug, Default)]
pub struct MemoryMonitor {
    max_rss_bytes: u64,
}

impl MemoryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self) -> io::Result<MemoryInfo> {
        let info = MemoryInfo::current()?;
        self.max_rss_bytes = self.max_rss_bytes.max(info.rss_bytes);
        Ok(info)
    }

    pub fn max_rss_formatted(&self) -> String {
        MemoryInfo::format_bytes(self.max_rss_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_rss_is_nonzero() {
        let info = MemoryInfo::current().unwrap();
        assert!(info.rss_bytes > 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(MemoryInfo::format_bytes(1024), "1.00 KB");
        assert_eq!(MemoryInfo::format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(MemoryInfo::format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_monitor_tracks_peak() {
        let mut monitor = MemoryMonitor::new();
        let info = monitor.check().unwrap();
        assert!(info.rss_bytes > 0);
        assert!(monitor.max_rss_bytes >= info.rss_bytes);
    }
}
