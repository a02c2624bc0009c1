//! Opt-in phase timing. Timers are cheap no-ops unless `enable` has been
//! called, so the driver can gate them on an environment variable.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

#[derive(Debug, Default)]
struct Metric {
    name: &'static str,
    count: usize,
    sum_us: u128,
}

impl Metric {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.sum_us += elapsed.as_micros();
    }
}

#[derive(Debug, Default)]
struct Metrics {
    metrics: Vec<Metric>,
}

impl Metrics {
    fn record(&mut self, name: &'static str, elapsed: Duration) {
        match self.metrics.iter_mut().find(|m| m.name == name) {
            Some(m) => m.record(elapsed),
            None => {
                let mut m = Metric {
                    name,
                    ..Default::default()
                };
                m.record(elapsed);
                self.metrics.push(m);
            }
        }
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut name_width = 7; // To fit "metric ".
        for metric in &self.metrics {
            name_width = std::cmp::max(name_width, metric.name.len());
        }
        writeln!(
            f,
            "{:name_width$} {:>6} {:>9} {:>11}",
            "metric ",
            "count",
            "avg (us)",
            "total (us)",
            name_width = name_width
        )?;
        for metric in &self.metrics {
            writeln!(
                f,
                "{:name_width$} {:>6} {:>9.1} {:>11}",
                metric.name,
                metric.count,
                metric.sum_us as f64 / metric.count as f64,
                metric.sum_us,
                name_width = name_width
            )?;
        }
        Ok(())
    }
}

static METRICS: Lazy<Mutex<Metrics>> = Lazy::new(|| Mutex::new(Metrics::default()));
static ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable() {
    ENABLED.store(true, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Records the time from creation to drop under `name`.
pub struct ScopedMetric {
    name: &'static str,
    start: Instant,
}

impl Drop for ScopedMetric {
    fn drop(&mut self) {
        if let Ok(mut metrics) = METRICS.lock() {
            metrics.record(self.name, self.start.elapsed());
        }
    }
}

/// Returns a live timer when metrics are enabled, None otherwise.
pub fn timer(name: &'static str) -> Option<ScopedMetric> {
    if is_enabled() {
        Some(ScopedMetric {
            name,
            start: Instant::now(),
        })
    } else {
        None
    }
}

pub fn dump() {
    if let Ok(metrics) = METRICS.lock() {
        eprintln!("{}", &*metrics);
    }
}

#[macro_export]
macro_rules! scoped_metric {
    ($name:literal) => {
        let _scoped_metric = $crate::timer($name);
    };
}
