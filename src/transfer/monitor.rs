//! Adaptive performance monitoring.
//!
//! Keeps a short window of speed samples per operation and recommends
//! concurrency changes: back off when throughput degrades against the peak,
//! push harder while the trend improves, and probe upward once when a
//! conservative start shows a stable line.

use crate::config::PerformanceConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Samples the trend regression looks at.
const TREND_WINDOW: usize = 5;

/// One timed speed observation.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceSample {
    pub timestamp: Instant,
    pub speed_mbps: f64,
    pub concurrency: usize,
}

/// Direction the recent samples are moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedTrend {
    Increasing,
    Stable,
    Decreasing,
    Volatile,
}

/// Best guess at what is holding throughput back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BottleneckKind {
    /// Running at or near the observed peak
    None,
    /// Well below peak at steady concurrency: the medium is the limit
    Throughput,
    /// Wildly swinging samples: competing I/O or a flaky link
    Contention,
}

fn detect_bottleneck(trend: SpeedTrend, efficiency: f64) -> BottleneckKind {
    if trend == SpeedTrend::Volatile {
        return BottleneckKind::Contention;
    }
    if efficiency < 0.7 {
        return BottleneckKind::Throughput;
    }
    BottleneckKind::None
}

/// Aggregated view over an operation's sample window.
#[derive(Debug, Clone)]
pub struct PerformanceMetrics {
    pub current_mbps: f64,
    pub average_mbps: f64,
    pub peak_mbps: f64,
    pub moving_average_mbps: f64,
    pub trend: SpeedTrend,
    /// current / peak
    pub efficiency_ratio: f64,
    pub bottleneck: BottleneckKind,
    pub concurrency: usize,
    pub adaptation_count: u32,
}

/// Concurrency recommendation.
#[derive(Debug, Clone)]
pub struct Adjustment {
    pub adjust: bool,
    pub new_concurrency: usize,
    pub reason: &'static str,
}

impl Adjustment {
    fn none(current: usize, reason: &'static str) -> Self {
        Self {
            adjust: false,
            new_concurrency: current,
            reason,
        }
    }
}

struct OperationPerf {
    samples: VecDeque<PerformanceSample>,
    peak_mbps: f64,
    concurrency: usize,
    adaptation_count: u32,
    last_adaptation: Option<Instant>,
}

impl OperationPerf {
    fn new(concurrency: usize, sample_window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(sample_window),
            peak_mbps: 0.0,
            concurrency,
            adaptation_count: 0,
            last_adaptation: None,
        }
    }

    fn recent(&self) -> Vec<f64> {
        self.samples
            .iter()
            .rev()
            .take(TREND_WINDOW)
            .rev()
            .map(|s| s.speed_mbps)
            .collect()
    }
}

/// Shared monitor across all workers and the sampler task.
pub struct PerformanceMonitor {
    config: PerformanceConfig,
    operations: RwLock<HashMap<Uuid, Mutex<OperationPerf>>>,
}

impl PerformanceMonitor {
    pub fn new(config: PerformanceConfig) -> Self {
        Self {
            config,
            operations: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, id: Uuid, concurrency: usize) {
        let mut ops = self.operations.write().unwrap_or_else(|e| e.into_inner());
        ops.insert(
            id,
            Mutex::new(OperationPerf::new(concurrency, self.config.sample_window)),
        );
    }

    pub fn remove(&self, id: Uuid) {
        let mut ops = self.operations.write().unwrap_or_else(|e| e.into_inner());
        ops.remove(&id);
    }

    /// Record a speed sample for `id`.
    pub fn record_sample(&self, id: Uuid, speed_mbps: f64, concurrency: usize) {
        let ops = self.operations.read().unwrap_or_else(|e| e.into_inner());
        let Some(op) = ops.get(&id) else { return };
        let mut op = op.lock().unwrap_or_else(|e| e.into_inner());

        while op.samples.len() >= self.config.sample_window.max(1) {
            op.samples.pop_front();
        }
        op.samples.push_back(PerformanceSample {
            timestamp: Instant::now(),
            speed_mbps,
            concurrency,
        });
        op.concurrency = concurrency;
        if speed_mbps > op.peak_mbps {
            op.peak_mbps = speed_mbps;
        }
    }

    /// A granted adjustment is recorded so spacing and the probe rule see it.
    pub fn record_adaptation(&self, id: Uuid, new_concurrency: usize) {
        let ops = self.operations.read().unwrap_or_else(|e| e.into_inner());
        let Some(op) = ops.get(&id) else { return };
        let mut op = op.lock().unwrap_or_else(|e| e.into_inner());

        op.concurrency = new_concurrency;
        op.adaptation_count += 1;
        op.last_adaptation = Some(Instant::now());
    }

    pub fn metrics(&self, id: Uuid) -> Option<PerformanceMetrics> {
        let ops = self.operations.read().unwrap_or_else(|e| e.into_inner());
        let op = ops.get(&id)?;
        let op = op.lock().unwrap_or_else(|e| e.into_inner());

        let speeds: Vec<f64> = op.samples.iter().map(|s| s.speed_mbps).collect();
        let current = speeds.last().copied().unwrap_or(0.0);
        let average = mean(&speeds);
        let recent = op.recent();
        let trend = detect_trend(&recent);
        let efficiency = if op.peak_mbps > 0.0 {
            current / op.peak_mbps
        } else {
            1.0
        };

        Some(PerformanceMetrics {
            current_mbps: current,
            average_mbps: average,
            peak_mbps: op.peak_mbps,
            moving_average_mbps: mean(&recent),
            trend,
            efficiency_ratio: efficiency,
            bottleneck: detect_bottleneck(trend, efficiency),
            concurrency: op.concurrency,
            adaptation_count: op.adaptation_count,
        })
    }

    /// Evaluate the adjustment ladder for `id`.
    pub fn should_adjust(&self, id: Uuid) -> Adjustment {
        let ops = self.operations.read().unwrap_or_else(|e| e.into_inner());
        let Some(op) = ops.get(&id) else {
            return Adjustment::none(1, "unknown operation");
        };
        let op = op.lock().unwrap_or_else(|e| e.into_inner());

        // Need history and spacing before touching anything
        if op.samples.len() < self.config.min_samples {
            return Adjustment::none(op.concurrency, "warming up");
        }
        let spacing = Duration::from_secs(self.config.adaptation_spacing_secs);
        if let Some(last) = op.last_adaptation {
            if last.elapsed() < spacing {
                return Adjustment::none(op.concurrency, "recently adapted");
            }
        }

        let speeds: Vec<f64> = op.samples.iter().map(|s| s.speed_mbps).collect();
        let current = speeds.last().copied().unwrap_or(0.0);
        let average = mean(&speeds);
        let recent = op.recent();
        let trend = detect_trend(&recent);

        let efficiency = if op.peak_mbps > 0.0 {
            current / op.peak_mbps
        } else {
            1.0
        };

        if efficiency < 0.7 && op.concurrency > 1 {
            let reduced = ((op.concurrency as f64 * 0.75).floor() as usize).max(1);
            return Adjustment {
                adjust: true,
                new_concurrency: reduced,
                reason: "degraded",
            };
        }

        if trend == SpeedTrend::Increasing
            && current > average * 1.2
            && op.concurrency < self.config.max_concurrency
        {
            return Adjustment {
                adjust: true,
                new_concurrency: (op.concurrency + 2).min(self.config.max_concurrency),
                reason: "improving",
            };
        }

        if op.concurrency < 4 && trend == SpeedTrend::Stable && op.adaptation_count == 0 {
            return Adjustment {
                adjust: true,
                new_concurrency: (op.concurrency * 2).min(8),
                reason: "probe",
            };
        }

        Adjustment::none(op.concurrency, "optimal")
    }

    #[cfg(test)]
    fn backdate_last_adaptation(&self, id: Uuid, age: Duration) {
        let ops = self.operations.read().unwrap_or_else(|e| e.into_inner());
        if let Some(op) = ops.get(&id) {
            let mut op = op.lock().unwrap_or_else(|e| e.into_inner());
            op.last_adaptation = Instant::now().checked_sub(age);
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Trend over the recent window: coefficient of variation flags volatility,
/// otherwise a least-squares slope against the window mean decides.
fn detect_trend(speeds: &[f64]) -> SpeedTrend {
    if speeds.len() < 2 {
        return SpeedTrend::Stable;
    }

    let avg = mean(speeds);
    if avg <= 0.0 {
        return SpeedTrend::Stable;
    }

    let variance =
        speeds.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / speeds.len() as f64;
    let cov = variance.sqrt() / avg;
    if cov > 0.3 {
        return SpeedTrend::Volatile;
    }

    // Least-squares slope with x = 0..n
    let n = speeds.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, speed) in speeds.iter().enumerate() {
        let dx = i as f64 - x_mean;
        numerator += dx * (speed - avg);
        denominator += dx * dx;
    }
    let slope = if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    };

    if slope > 0.05 * avg {
        SpeedTrend::Increasing
    } else if slope < -0.05 * avg {
        SpeedTrend::Decreasing
    } else {
        SpeedTrend::Stable
    }
}
