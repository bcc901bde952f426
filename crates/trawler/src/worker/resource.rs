//! Local resource pressure: the admission gate for new jobs.
//!
//! CPU and memory fractions come from procfs. Samples are cached for a
//! short window because the outer loop polls much faster than the numbers
//! move. Where procfs is unreadable (non-Linux dev machines, restricted
//! containers) the sampler reads zero pressure and the gate stays open.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One observation of local pressure, as fractions in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    pub cpu_fraction: f64,
    pub ram_fraction: f64,
}

pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Counters from one `/proc/stat` cpu line.
#[derive(Debug, Clone, Copy, Default)]
struct CpuCounters {
    idle: u64,
    total: u64,
}

/// procfs-backed sampler. CPU utilization needs two observations, so the
/// first call reports zero.
pub struct ProcSampler {
    last_cpu: Mutex<Option<CpuCounters>>,
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcSampler {
    pub fn new() -> Self {
        Self {
            last_cpu: Mutex::new(None),
        }
    }

    fn read_cpu_counters() -> Option<CpuCounters> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        let line = stat.lines().next()?;
        let mut fields = line.split_whitespace();
        if fields.next()? != "cpu" {
            return None;
        }
        let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
        if values.len() < 4 {
            return None;
        }
        // user nice system idle iowait ...; idle time is idle + iowait.
        let idle = values[3] + values.get(4).copied().unwrap_or(0);
        let total = values.iter().sum();
        Some(CpuCounters { idle, total })
    }

    fn read_ram_fraction() -> Option<f64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let mut total_kb = None;
        let mut available_kb = None;
        for line in meminfo.lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("MemTotal:") => total_kb = parts.next().and_then(|v| v.parse::<u64>().ok()),
                Some("MemAvailable:") => {
                    available_kb = parts.next().and_then(|v| v.parse::<u64>().ok())
                }
                _ => {}
            }
        }
        let total = total_kb? as f64;
        let available = available_kb? as f64;
        if total <= 0.0 {
            return None;
        }
        Some((1.0 - available / total).clamp(0.0, 1.0))
    }
}

impl ResourceSampler for ProcSampler {
    fn sample(&self) -> ResourceSample {
        let ram_fraction = Self::read_ram_fraction().unwrap_or(0.0);

        let cpu_fraction = match Self::read_cpu_counters() {
            Some(current) => {
                let mut last = match self.last_cpu.lock() {
                    Ok(guard) => guard,
                    Err(_) => return ResourceSample { cpu_fraction: 0.0, ram_fraction },
                };
                let fraction = match *last {
                    Some(previous) if current.total > previous.total => {
                        let total_delta = (current.total - previous.total) as f64;
                        let idle_delta = current.idle.saturating_sub(previous.idle) as f64;
                        (1.0 - idle_delta / total_delta).clamp(0.0, 1.0)
                    }
                    _ => 0.0,
                };
                *last = Some(current);
                fraction
            }
            None => 0.0,
        };

        ResourceSample {
            cpu_fraction,
            ram_fraction,
        }
    }
}

/// Cached view over a sampler with the admission thresholds applied.
pub struct ResourceMonitor {
    sampler: Arc<dyn ResourceSampler>,
    max_cpu: f64,
    max_ram: f64,
    cache_window: Duration,
    cache: Mutex<Option<(Instant, ResourceSample)>>,
}

impl ResourceMonitor {
    pub fn new(sampler: Arc<dyn ResourceSampler>, max_cpu: f64, max_ram: f64) -> Self {
        Self {
            sampler,
            max_cpu,
            max_ram,
            cache_window: Duration::from_millis(150),
            cache: Mutex::new(None),
        }
    }

    pub fn current(&self) -> ResourceSample {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(_) => return self.sampler.sample(),
        };
        if let Some((taken_at, sample)) = *cache {
            if taken_at.elapsed() < self.cache_window {
                return sample;
            }
        }
        let sample = self.sampler.sample();
        *cache = Some((Instant::now(), sample));
        sample
    }

    /// True when either ceiling is met; the outer loop then admits
    /// nothing until a later sample falls back below.
    pub fn overloaded(&self) -> bool {
        let sample = self.current();
        sample.cpu_fraction >= self.max_cpu || sample.ram_fraction >= self.max_ram
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedSampler(ResourceSample, AtomicU32);

    impl ResourceSampler for FixedSampler {
        fn sample(&self) -> ResourceSample {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0
        }
    }

    #[test]
    fn thresholds_gate_admission() {
        let hot = ResourceMonitor::new(
            Arc::new(FixedSampler(
                ResourceSample {
                    cpu_fraction: 0.97,
                    ram_fraction: 0.10,
                },
                AtomicU32::new(0),
            )),
            0.95,
            0.95,
        );
        assert!(hot.overloaded());

        let cool = ResourceMonitor::new(
            Arc::new(FixedSampler(
                ResourceSample {
                    cpu_fraction: 0.50,
                    ram_fraction: 0.50,
                },
                AtomicU32::new(0),
            )),
            0.95,
            0.95,
        );
        assert!(!cool.overloaded());
    }

    #[test]
    fn samples_are_cached_within_the_window() {
        let sampler = Arc::new(FixedSampler(ResourceSample::default(), AtomicU32::new(0)));
        let monitor = ResourceMonitor::new(sampler.clone(), 0.95, 0.95);
        monitor.current();
        monitor.current();
        monitor.current();
        assert_eq!(sampler.1.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn proc_sampler_never_panics() {
        let sampler = ProcSampler::new();
        let first = sampler.sample();
        assert!((0.0..=1.0).contains(&first.cpu_fraction));
        assert!((0.0..=1.0).contains(&first.ram_fraction));
        let second = sampler.sample();
        assert!((0.0..=1.0).contains(&second.cpu_fraction));
    }
}
