use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "cli")]
use std::sync::Mutex;
use std::time::{Duration, Instant};
#[cfg(feature = "cli")]
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

#[derive(Debug, Clone)]
pub struct RunStats {
    pub cpu_usage: f32,
    pub memory_usage_mb: u64,
    pub peak_memory_mb: u64,
    pub cars_submitted: u64,
    pub elapsed_time: Duration,
}

impl RunStats {
    pub fn cars_per_second(&self) -> f64 {
        let secs = self.elapsed_time.as_secs_f64();
        if secs > 0.0 {
            self.cars_submitted as f64 / secs
        } else {
            0.0
        }
    }
}

/// Tracks throughput of a local load run and, with the `cli` feature,
/// process CPU and memory.
pub struct RunMonitor {
    #[cfg(feature = "cli")]
    system: Mutex<System>,
    #[cfg(feature = "cli")]
    pid: Option<Pid>,
    start_time: Instant,
    peak_memory_mb: AtomicU64,
    cars_submitted: AtomicU64,
    enabled: bool,
}

impl RunMonitor {
    pub fn new(enabled: bool) -> Self {
        Self {
            #[cfg(feature = "cli")]
            system: Mutex::new(System::new()),
            #[cfg(feature = "cli")]
            pid: sysinfo::get_current_pid().ok(),
            start_time: Instant::now(),
            peak_memory_mb: AtomicU64::new(0),
            cars_submitted: AtomicU64::new(0),
            enabled,
        }
    }

    pub fn record_cars(&self, count: usize) {
        self.cars_submitted
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> Option<RunStats> {
        if !self.enabled {
            return None;
        }

        let (cpu_usage, memory_usage_mb) = self.sample_process();
        let peak = self
            .peak_memory_mb
            .fetch_max(memory_usage_mb, Ordering::Relaxed)
            .max(memory_usage_mb);

        Some(RunStats {
            cpu_usage,
            memory_usage_mb,
            peak_memory_mb: peak,
            cars_submitted: self.cars_submitted.load(Ordering::Relaxed),
            elapsed_time: self.start_time.elapsed(),
        })
    }

    #[cfg(feature = "cli")]
    fn sample_process(&self) -> (f32, u64) {
        let (Some(pid), Ok(mut system)) = (self.pid, self.system.lock()) else {
            return (0.0, 0);
        };
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::everything(),
        );
        system
            .process(pid)
            .map(|p| (p.cpu_usage(), p.memory() / 1024 / 1024))
            .unwrap_or((0.0, 0))
    }

    #[cfg(not(feature = "cli"))]
    fn sample_process(&self) -> (f32, u64) {
        (0.0, 0)
    }

    pub fn log_stats(&self, phase: &str) {
        if let Some(stats) = self.get_stats() {
            tracing::info!(
                "📊 {} - CPU: {:.1}%, Memory: {}MB, Peak: {}MB, Cars: {} ({:.0}/s), Time: {:?}",
                phase,
                stats.cpu_usage,
                stats.memory_usage_mb,
                stats.peak_memory_mb,
                stats.cars_submitted,
                stats.cars_per_second(),
                stats.elapsed_time
            );
        }
    }

    pub fn log_final_stats(&self) {
        if let Some(stats) = self.get_stats() {
            tracing::info!(
                "📊 Final Stats - Total Time: {:?}, Cars: {}, Peak Memory: {}MB",
                stats.elapsed_time,
                stats.cars_submitted,
                stats.peak_memory_mb
            );
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for RunMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}
