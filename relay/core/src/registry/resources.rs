//! Process Resource Telemetry
//!
//! Samples process memory and CPU plus connection-pool saturation, and
//! classifies the result into a pressure band. The registry only reports
//! these samples; reacting to them (for example by degrading the cache) is
//! up to whoever subscribes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Pressure band of a resource sample
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    /// Everything under the warning thresholds
    #[default]
    Normal,
    /// At least one metric in the warning band
    Warning,
    /// At least one metric in the critical band
    Critical,
}

/// Warning and critical bands for each sampled metric
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    /// Process resident memory warning band (MB)
    pub memory_warning_mb: f64,
    /// Process resident memory critical band (MB)
    pub memory_critical_mb: f64,
    /// Process CPU warning band (percent of one core)
    pub cpu_warning_percent: f32,
    /// Process CPU critical band (percent of one core)
    pub cpu_critical_percent: f32,
    /// Connection pool saturation warning band (percent of capacity)
    pub saturation_warning_percent: f64,
    /// Connection pool saturation critical band (percent of capacity)
    pub saturation_critical_percent: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            memory_warning_mb: 6000.0,
            memory_critical_mb: 7000.0,
            cpu_warning_percent: 80.0,
            cpu_critical_percent: 95.0,
            saturation_warning_percent: 80.0,
            saturation_critical_percent: 95.0,
        }
    }
}

impl ResourceThresholds {
    /// Classify a set of readings, returning the worst band and why
    #[must_use]
    pub fn classify(
        &self,
        memory_mb: f64,
        cpu_percent: f32,
        saturation_percent: f64,
    ) -> (PressureLevel, Vec<String>) {
        let mut level = PressureLevel::Normal;
        let mut reasons = Vec::new();

        let mut check = |value: f64, warning: f64, critical: f64, what: &str| {
            let band = if value >= critical {
                PressureLevel::Critical
            } else if value >= warning {
                PressureLevel::Warning
            } else {
                return;
            };
            reasons.push(format!("{what} {value:.1} over {band:?} threshold"));
            level = level.max(band);
        };

        check(
            memory_mb,
            self.memory_warning_mb,
            self.memory_critical_mb,
            "process memory MB",
        );
        check(
            f64::from(cpu_percent),
            f64::from(self.cpu_warning_percent),
            f64::from(self.cpu_critical_percent),
            "process cpu %",
        );
        check(
            saturation_percent,
            self.saturation_warning_percent,
            self.saturation_critical_percent,
            "connection pool saturation %",
        );

        (level, reasons)
    }
}

/// One resource reading
#[derive(Clone, Debug, Serialize)]
pub struct ResourceSample {
    /// Process resident memory (MB)
    pub process_memory_mb: f64,
    /// Process CPU usage since the previous sample (percent of one core)
    pub process_cpu_percent: f32,
    /// System-wide memory in use (percent)
    pub system_memory_percent: f64,
    /// Connections held as a percent of pool capacity
    pub pool_saturation_percent: f64,
    /// Worst band across all metrics
    pub level: PressureLevel,
    /// Which thresholds were crossed
    pub reasons: Vec<String>,
    /// When the sample was taken
    pub taken_at: DateTime<Utc>,
}

/// Samples the current process through `sysinfo`
pub struct ResourceMonitor {
    system: System,
    pid: Option<Pid>,
    thresholds: ResourceThresholds,
}

impl ResourceMonitor {
    /// Create a monitor for the current process
    #[must_use]
    pub fn new(thresholds: ResourceThresholds) -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
            thresholds,
        }
    }

    /// Take a sample, folding in the caller-supplied pool saturation
    pub fn sample(&mut self, pool_saturation_percent: f64) -> ResourceSample {
        self.system.refresh_memory();

        let (process_memory_mb, process_cpu_percent) = match self.pid {
            Some(pid) => {
                let _ = self
                    .system
                    .refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
                self.system.process(pid).map_or((0.0, 0.0), |process| {
                    #[allow(clippy::cast_precision_loss)]
                    let mb = process.memory() as f64 / (1024.0 * 1024.0);
                    (mb, process.cpu_usage())
                })
            }
            None => (0.0, 0.0),
        };

        let total = self.system.total_memory();
        #[allow(clippy::cast_precision_loss)]
        let system_memory_percent = if total > 0 {
            self.system.used_memory() as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let (level, reasons) = self.thresholds.classify(
            process_memory_mb,
            process_cpu_percent,
            pool_saturation_percent,
        );

        ResourceSample {
            process_memory_mb,
            process_cpu_percent,
            system_memory_percent,
            pool_saturation_percent,
            level,
            reasons,
            taken_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_normal() {
        let thresholds = ResourceThresholds::default();
        let (level, reasons) = thresholds.classify(100.0, 5.0, 10.0);
        assert_eq!(level, PressureLevel::Normal);
        assert!(reasons.is_empty());
    }

    #[test]
    fn test_classify_takes_worst_band() {
        let thresholds = ResourceThresholds::default();

        let (level, reasons) = thresholds.classify(6500.0, 5.0, 10.0);
        assert_eq!(level, PressureLevel::Warning);
        assert_eq!(reasons.len(), 1);

        let (level, reasons) = thresholds.classify(6500.0, 5.0, 100.0);
        assert_eq!(level, PressureLevel::Critical);
        assert_eq!(reasons.len(), 2);
    }

    #[test]
    fn test_monitor_samples_current_process() {
        let mut monitor = ResourceMonitor::new(ResourceThresholds::default());
        let sample = monitor.sample(50.0);
        assert!(sample.process_memory_mb >= 0.0);
        assert!((sample.pool_saturation_percent - 50.0).abs() < f64::EPSILON);
    }
}
