//! Bounded sample windows for in-band quality measurements.
//!
//! Each path keeps several of these: latency, packet validity, QoS record
//! outcomes, and QoS record counts. The window holds a fixed number of the
//! most recent observations and keeps running aggregates so `mean` and
//! `stddev` are O(1).

use std::collections::VecDeque;

/// Fixed-capacity window of f32 samples with O(1) amortized statistics.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    cap: usize,
    buf: VecDeque<f32>,
    sum: f64,
    sum_sq: f64,
}

impl SampleWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            buf: VecDeque::with_capacity(cap.max(1)),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    /// Push a sample, evicting the oldest when the window is full.
    pub fn push(&mut self, sample: f32) {
        if self.buf.len() == self.cap {
            if let Some(old) = self.buf.pop_front() {
                self.sum -= old as f64;
                self.sum_sq -= (old as f64) * (old as f64);
            }
        }
        self.buf.push_back(sample);
        self.sum += sample as f64;
        self.sum_sq += (sample as f64) * (sample as f64);
    }

    /// Push a boolean observation as 1.0 / 0.0.
    pub fn push_bool(&mut self, sample: bool) {
        self.push(if sample { 1.0 } else { 0.0 });
    }

    pub fn count(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Arithmetic mean of the window, 0 when empty.
    pub fn mean(&self) -> f32 {
        if self.buf.is_empty() {
            0.0
        } else {
            (self.sum / self.buf.len() as f64) as f32
        }
    }

    /// Population standard deviation of the window, 0 when empty.
    pub fn stddev(&self) -> f32 {
        if self.buf.is_empty() {
            return 0.0;
        }
        let n = self.buf.len() as f64;
        let mean = self.sum / n;
        let var = (self.sum_sq / n) - mean * mean;
        // Running aggregates can go marginally negative from rounding.
        var.max(0.0).sqrt() as f32
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window() {
        let w = SampleWindow::new(8);
        assert!(w.is_empty());
        assert_eq!(w.count(), 0);
        assert_eq!(w.mean(), 0.0);
        assert_eq!(w.stddev(), 0.0);
    }

    #[test]
    fn test_mean_and_stddev() {
        let mut w = SampleWindow::new(8);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            w.push(v);
        }
        assert_eq!(w.count(), 8);
        assert!((w.mean() - 5.0).abs() < 1e-6);
        assert!((w.stddev() - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_capacity_eviction() {
        let mut w = SampleWindow::new(4);
        for v in 0..100 {
            w.push(v as f32);
        }
        // Only 96..=99 remain.
        assert_eq!(w.count(), 4);
        assert!((w.mean() - 97.5).abs() < 1e-4);
    }

    #[test]
    fn test_push_bool() {
        let mut w = SampleWindow::new(4);
        w.push_bool(true);
        w.push_bool(true);
        w.push_bool(false);
        w.push_bool(true);
        assert!((w.mean() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_constant_samples_have_zero_stddev() {
        let mut w = SampleWindow::new(16);
        for _ in 0..16 {
            w.push(10.0);
        }
        assert!(w.stddev().abs() < 1e-4);
    }
}
