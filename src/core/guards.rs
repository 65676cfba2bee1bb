use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// Per-user submission cooldown.
pub const COOLDOWN: Duration = Duration::from_secs(5);

/// Why a task was refused admission.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardRejection {
    Cooldown,
    TooManyTasks { active: usize, max: usize },
    RamPressure { percent: u64, threshold: u64 },
}

impl std::fmt::Display for GuardRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardRejection::Cooldown => {
                write!(f, "Please wait a few seconds between tasks.")
            }
            GuardRejection::TooManyTasks { active, max } => write!(
                f,
                "Too many concurrent tasks ({active}/{max}). Wait for one to finish or /cancel."
            ),
            GuardRejection::RamPressure { percent, threshold } => write!(
                f,
                "System memory at {percent}% (threshold: {threshold}%). Wait for tasks to finish."
            ),
        }
    }
}

/// Process-wide admission guards: in-flight counter, RAM pressure, and
/// per-user cooldown. Checked before a task record is even created.
pub struct ResourceGuards {
    in_flight: AtomicUsize,
    max_concurrent: usize,
    ram_threshold_percent: u64,
    last_submit: Mutex<HashMap<i64, Instant>>,
}

impl ResourceGuards {
    pub fn new(max_concurrent: usize, ram_threshold_percent: u64) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            max_concurrent,
            ram_threshold_percent,
            last_submit: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Admit a new task for `user_id`, or explain the refusal.
    /// On success the in-flight count is already incremented; the caller
    /// must pair this with `release()` when the task ends.
    pub fn admit(&self, user_id: i64) -> Result<(), GuardRejection> {
        {
            let mut map = self.last_submit.lock().unwrap();
            if let Some(last) = map.get(&user_id) {
                if last.elapsed() < COOLDOWN {
                    return Err(GuardRejection::Cooldown);
                }
            }
            map.insert(user_id, Instant::now());
        }

        if let Some(percent) = ram_used_percent() {
            if percent >= self.ram_threshold_percent {
                return Err(GuardRejection::RamPressure {
                    percent,
                    threshold: self.ram_threshold_percent,
                });
            }
        }

        let active = self.in_flight.fetch_add(1, Ordering::SeqCst);
        if active >= self.max_concurrent {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(GuardRejection::TooManyTasks {
                active,
                max: self.max_concurrent,
            });
        }
        Ok(())
    }

    /// Admission check without the cooldown, for scheduler-originated tasks.
    pub fn admit_scheduled(&self) -> Result<(), GuardRejection> {
        if let Some(percent) = ram_used_percent() {
            if percent >= self.ram_threshold_percent {
                return Err(GuardRejection::RamPressure {
                    percent,
                    threshold: self.ram_threshold_percent,
                });
            }
        }
        let active = self.in_flight.fetch_add(1, Ordering::SeqCst);
        if active >= self.max_concurrent {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(GuardRejection::TooManyTasks {
                active,
                max: self.max_concurrent,
            });
        }
        Ok(())
    }

    pub fn release(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            // Unbalanced release: restore and complain rather than wrap.
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            warn!("guards: release() without matching admit()");
        }
    }
}

/// Current RAM usage percentage from /proc/meminfo, or None if it cannot
/// be determined (non-Linux host); the caller treats None as "no limit".
pub fn ram_used_percent() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_percent(&content)
}

fn parse_meminfo_percent(content: &str) -> Option<u64> {
    let mut total_kb: Option<u64> = None;
    let mut available_kb: Option<u64> = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.trim().split_whitespace().next()?.parse().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.trim().split_whitespace().next()?.parse().ok();
        }
        if total_kb.is_some() && available_kb.is_some() {
            break;
        }
    }
    let total = total_kb?;
    let available = available_kb?;
    if total == 0 {
        return None;
    }
    Some(((total.saturating_sub(available)) * 100) / total)
}

/// Free disk space in bytes for the filesystem containing `path`,
/// via `df -k` (portable across the hosts we run on).
pub fn free_disk_bytes(path: &std::path::Path) -> Option<u64> {
    let output = std::process::Command::new("df")
        .arg("-k")
        .arg(path)
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let line = text.lines().nth(1)?;
    let avail_kb: u64 = line.split_whitespace().nth(3)?.parse().ok()?;
    Some(avail_kb * 1024)
}
