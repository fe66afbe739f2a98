//! Shared per-frame statistics.
//!
//! A `StatsCollector` is a cheap cloneable handle. The video source, the
//! tracker and the pipeline each hold a clone and append named samples for
//! the current frame. Once per frame the pipeline closes the frame and hands
//! the resulting `StatsReport` to whoever consumes it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

pub const ROLE_VIDEO: &str = "video";
pub const ROLE_TRACKER: &str = "tracker";
pub const ROLE_PIPELINE: &str = "pipeline";

#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub producer: String,
    pub key: String,
    pub value: f64,
}

/// All samples recorded for one frame, sorted by `(producer, key)`.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsReport {
    pub name: String,
    pub frame: u64,
    pub samples: Vec<Sample>,
}

impl StatsReport {
    pub fn value(&self, producer: &str, key: &str) -> Option<f64> {
        self.samples
            .iter()
            .find(|s| s.producer == producer && s.key == key)
            .map(|s| s.value)
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} frame={}", self.name, self.frame)?;
        for s in &self.samples {
            write!(f, "\n  {}.{}={:.3}", s.producer, s.key, s.value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    frame: u64,
    // (producer, key) -> accumulated value for the open frame
    pending: BTreeMap<(String, String), f64>,
    totals: BTreeMap<String, u64>,
    last_report: Option<StatsReport>,
}

#[derive(Clone, Debug)]
pub struct StatsCollector {
    name: Arc<str>,
    inner: Arc<Mutex<StatsInner>>,
}

impl StatsCollector {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            inner: Arc::new(Mutex::new(StatsInner::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // A panic in one producer must not silence the others.
    fn lock(&self) -> MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open frame `frame`. Samples recorded before this call belong to the
    /// previous frame until it is closed.
    pub fn begin_frame(&self, frame: u64) {
        let mut inner = self.lock();
        inner.frame = frame;
    }

    /// Record a sample for the open frame. Repeated keys within a frame add up.
    pub fn record(&self, producer: &str, key: &str, value: f64) {
        let mut inner = self.lock();
        *inner
            .pending
            .entry((producer.to_string(), key.to_string()))
            .or_insert(0.0) += value;
        *inner.totals.entry(producer.to_string()).or_insert(0) += 1;
    }

    /// Close the open frame and return its report.
    pub fn end_frame(&self) -> StatsReport {
        let mut inner = self.lock();
        let pending = std::mem::take(&mut inner.pending);
        let report = StatsReport {
            name: self.name.to_string(),
            frame: inner.frame,
            samples: pending
                .into_iter()
                .map(|((producer, key), value)| Sample {
                    producer,
                    key,
                    value,
                })
                .collect(),
        };
        inner.last_report = Some(report.clone());
        report
    }

    pub fn last_report(&self) -> Option<StatsReport> {
        self.lock().last_report.clone()
    }

    /// Samples recorded by `producer` since creation.
    pub fn sample_count(&self, producer: &str) -> u64 {
        self.lock().totals.get(producer).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_is_sorted_and_closed_per_frame() {
        let stats = StatsCollector::new("timings");
        let tracker_handle = stats.clone();

        stats.begin_frame(1);
        tracker_handle.record(ROLE_TRACKER, "update_ms", 2.0);
        stats.record(ROLE_VIDEO, "advance_ms", 1.0);
        stats.record(ROLE_VIDEO, "frames_delivered", 1.0);
        stats.record(ROLE_VIDEO, "frames_delivered", 1.0);
        let report = stats.end_frame();

        assert_eq!(report.frame, 1);
        let keys: Vec<_> = report
            .samples
            .iter()
            .map(|s| format!("{}.{}", s.producer, s.key))
            .collect();
        assert_eq!(
            keys,
            vec!["tracker.update_ms", "video.advance_ms", "video.frames_delivered"]
        );
        assert_eq!(report.value(ROLE_VIDEO, "frames_delivered"), Some(2.0));

        stats.begin_frame(2);
        assert!(stats.end_frame().samples.is_empty());
        assert_eq!(stats.sample_count(ROLE_VIDEO), 3);
        assert_eq!(stats.sample_count(ROLE_TRACKER), 1);
    }

    #[test]
    fn display_is_stable() {
        let stats = StatsCollector::new("ar timings");
        stats.begin_frame(7);
        stats.record(ROLE_VIDEO, "advance_ms", 0.5);
        let text = stats.end_frame().to_string();
        assert_eq!(text, "ar timings frame=7\n  video.advance_ms=0.500");
    }
}
