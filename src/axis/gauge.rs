//! Resource backpressure gauge.
//!
//! A single shared gauge carries the most recent RSS and disk usage
//! samples. The worker pool stops claiming while RSS is above its pause
//! threshold; job creation fails while disk usage is above its threshold.
//! Sampling happens in the lifecycle diagnostics loop; on platforms where
//! a probe is unavailable the corresponding reading stays unknown and the
//! pause never engages.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::BackpressureConfig;

/// Sentinel for "no sample yet / unavailable".
const UNKNOWN: u32 = u32::MAX;

/// Shared resource usage readings, in percent.
pub struct ResourceGauge {
    rss_percent: AtomicU32,
    disk_percent: AtomicU32,
    config: BackpressureConfig,
}

impl ResourceGauge {
    /// Create a gauge with no samples yet.
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            rss_percent: AtomicU32::new(UNKNOWN),
            disk_percent: AtomicU32::new(UNKNOWN),
            config,
        }
    }

    /// Record an RSS sample; `None` marks the reading unknown.
    pub fn set_rss_percent(&self, percent: Option<u8>) {
        self.rss_percent
            .store(percent.map_or(UNKNOWN, u32::from), Ordering::Relaxed);
    }

    /// Record a disk usage sample; `None` marks the reading unknown.
    pub fn set_disk_percent(&self, percent: Option<u8>) {
        self.disk_percent
            .store(percent.map_or(UNKNOWN, u32::from), Ordering::Relaxed);
    }

    /// Latest RSS sample.
    pub fn rss_percent(&self) -> Option<u8> {
        checked_sample(self.rss_percent.load(Ordering::Relaxed))
    }

    /// Latest disk sample.
    pub fn disk_percent(&self) -> Option<u8> {
        checked_sample(self.disk_percent.load(Ordering::Relaxed))
    }

    /// Whether workers should stop claiming new jobs.
    pub fn rss_paused(&self) -> bool {
        self.rss_percent()
            .is_some_and(|p| p >= self.config.rss_pause_percent)
    }

    /// Whether job creation should be refused.
    pub fn disk_full(&self) -> bool {
        self.disk_percent()
            .is_some_and(|p| p >= self.config.disk_pause_percent)
    }
}

fn checked_sample(raw: u32) -> Option<u8> {
    if raw == UNKNOWN {
        None
    } else {
        u8::try_from(raw.min(100)).ok()
    }
}

/// Probe resident set size as a percentage of total memory.
///
/// Reads `/proc/self/status` and `/proc/meminfo`; returns `None` anywhere
/// those are unavailable.
pub fn sample_rss_percent() -> Option<u8> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let rss_kb = parse_kb_line(&status, "VmRSS:")?;
    let total_kb = parse_kb_line(&meminfo, "MemTotal:")?;
    if total_kb == 0 {
        return None;
    }
    let percent = rss_kb.saturating_mul(100).checked_div(total_kb)?;
    u8::try_from(percent.min(100)).ok()
}

/// Probe disk usage of the filesystem holding `path`, as a percentage.
#[cfg(unix)]
pub fn sample_disk_percent(path: &Path) -> Option<u8> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    let total = stat.blocks();
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(stat.blocks_available());
    let percent = used.saturating_mul(100).checked_div(total)?;
    u8::try_from(percent.min(100)).ok()
}

/// Disk probe fallback for platforms without statvfs.
#[cfg(not(unix))]
pub fn sample_disk_percent(_path: &Path) -> Option<u8> {
    None
}

fn parse_kb_line(text: &str, prefix: &str) -> Option<u64> {
    text.lines()
        .find(|line| line.starts_with(prefix))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}
