use std::time::{Duration, Instant};

/// Point-in-time usage of the current process.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    /// Resident set size; `None` where the platform does not expose it.
    pub rss_bytes: Option<u64>,
    /// User plus system CPU time consumed so far.
    pub cpu_time: Duration,
    pub taken_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDelta {
    pub rss_bytes: Option<i64>,
    pub cpu_time: Duration,
    pub wall_time: Duration,
}

impl ResourceSnapshot {
    pub fn take() -> Self {
        Self {
            rss_bytes: current_rss_bytes(),
            cpu_time: process_cpu_time(),
            taken_at: Instant::now(),
        }
    }

    pub fn delta_since(&self, earlier: &ResourceSnapshot) -> ResourceDelta {
        let rss_bytes = match (self.rss_bytes, earlier.rss_bytes) {
            (Some(now), Some(then)) => Some(now as i64 - then as i64),
            _ => None,
        };
        ResourceDelta {
            rss_bytes,
            cpu_time: self.cpu_time.saturating_sub(earlier.cpu_time),
            wall_time: self.taken_at.saturating_duration_since(earlier.taken_at),
        }
    }
}

#[cfg(target_os = "linux")]
fn current_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages.saturating_mul(page_size as u64))
}

#[cfg(not(target_os = "linux"))]
fn current_rss_bytes() -> Option<u64> {
    None
}

#[cfg(unix)]
fn process_cpu_time() -> Duration {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return Duration::ZERO;
    }
    timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime)
}

#[cfg(unix)]
fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

#[cfg(not(unix))]
fn process_cpu_time() -> Duration {
    Duration::ZERO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successive_snapshots_move_forward() {
        let before = ResourceSnapshot::take();
        let after = ResourceSnapshot::take();

        let delta = after.delta_since(&before);

        assert!(after.cpu_time >= before.cpu_time);
        assert_eq!(delta.cpu_time, after.cpu_time - before.cpu_time);
        assert_eq!(delta.wall_time, after.taken_at - before.taken_at);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_reports_resident_memory() {
        let snapshot = ResourceSnapshot::take();
        assert!(snapshot.rss_bytes.expect("rss on linux") > 0);
    }

    #[test]
    fn missing_rss_gives_no_delta() {
        let now = Instant::now();
        let a = ResourceSnapshot {
            rss_bytes: None,
            cpu_time: Duration::from_millis(5),
            taken_at: now,
        };
        let b = ResourceSnapshot {
            rss_bytes: Some(4096),
            cpu_time: Duration::from_millis(7),
            taken_at: now + Duration::from_millis(3),
        };

        let delta = b.delta_since(&a);

        assert_eq!(delta.rss_bytes, None);
        assert_eq!(delta.cpu_time, Duration::from_millis(2));
        assert_eq!(delta.wall_time, Duration::from_millis(3));
    }
}
