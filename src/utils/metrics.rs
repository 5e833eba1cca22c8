//! Metrics collection utilities
//!
//! This module provides decode throughput metrics and reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Decode performance metrics
#[derive(Debug, Clone)]
pub struct DecodeMetrics {
    /// Start time
    pub start_time: SystemTime,
    /// Frames processed
    frames_processed: Arc<AtomicU64>,
    /// Frames dropped by the capture layer
    frames_dropped: Arc<AtomicU64>,
    /// Header instances decoded
    headers_decoded: Arc<AtomicU64>,
    /// Flows tracked
    flows_tracked: Arc<AtomicU64>,
    /// Bytes processed
    bytes_processed: Arc<AtomicU64>,
    /// Processing time in microseconds
    processing_time_us: Arc<AtomicU64>,
}

impl Default for DecodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeMetrics {
    /// Create new decode metrics
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            frames_processed: Arc::new(AtomicU64::new(0)),
            frames_dropped: Arc::new(AtomicU64::new(0)),
            headers_decoded: Arc::new(AtomicU64::new(0)),
            flows_tracked: Arc::new(AtomicU64::new(0)),
            bytes_processed: Arc::new(AtomicU64::new(0)),
            processing_time_us: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a processed frame
    pub fn record_frame(&self, size: usize, headers: usize, processing_time: Duration) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.headers_decoded
            .fetch_add(headers as u64, Ordering::Relaxed);
        self.bytes_processed
            .fetch_add(size as u64, Ordering::Relaxed);
        self.processing_time_us
            .fetch_add(processing_time.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a dropped frame
    pub fn record_dropped_frame(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Update flow count
    pub fn update_flow_count(&self, count: u64) {
        self.flows_tracked.store(count, Ordering::Relaxed);
    }

    /// Get frames processed
    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    /// Get frames dropped
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Get headers decoded
    pub fn headers_decoded(&self) -> u64 {
        self.headers_decoded.load(Ordering::Relaxed)
    }

    /// Get flows tracked
    pub fn flows_tracked(&self) -> u64 {
        self.flows_tracked.load(Ordering::Relaxed)
    }

    /// Get bytes processed
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }

    /// Get average processing time per frame in microseconds
    pub fn avg_processing_time_us(&self) -> f64 {
        let frames: u64 = self.frames_processed();
        if frames == 0 {
            return 0.0;
        }

        let total_time: u64 = self.processing_time_us.load(Ordering::Relaxed);
        total_time as f64 / frames as f64
    }

    /// Get frames per second
    pub fn frames_per_second(&self) -> f64 {
        let frames: u64 = self.frames_processed();
        match self.start_time.elapsed() {
            Ok(elapsed) => {
                let seconds: f64 = elapsed.as_secs_f64();
                if seconds > 0.0 {
                    frames as f64 / seconds
                } else {
                    0.0
                }
            }
            Err(_) => 0.0,
        }
    }

    /// Get bytes per second
    pub fn bytes_per_second(&self) -> f64 {
        let bytes: u64 = self.bytes_processed();
        match self.start_time.elapsed() {
            Ok(elapsed) => {
                let seconds: f64 = elapsed.as_secs_f64();
                if seconds > 0.0 {
                    bytes as f64 / seconds
                } else {
                    0.0
                }
            }
            Err(_) => 0.0,
        }
    }

    /// Reset metrics
    pub fn reset(&self) {
        self.frames_processed.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.headers_decoded.store(0, Ordering::Relaxed);
        self.flows_tracked.store(0, Ordering::Relaxed);
        self.bytes_processed.store(0, Ordering::Relaxed);
        self.processing_time_us.store(0, Ordering::Relaxed);
    }

    /// Format metrics as a string
    pub fn format(&self) -> String {
        let uptime: String = match self.start_time.elapsed() {
            Ok(elapsed) => format!("{:.2}s", elapsed.as_secs_f64()),
            Err(_) => "unknown".to_string(),
        };

        format!(
            "Uptime: {}\n\
             Frames: {} processed, {} dropped\n\
             Headers: {}\n\
             Flows: {}\n\
             Throughput: {:.2} frames/sec, {:.2} MB/sec\n\
             Avg processing time: {:.2} µs/frame",
            uptime,
            self.frames_processed(),
            self.frames_dropped(),
            self.headers_decoded(),
            self.flows_tracked(),
            self.frames_per_second(),
            self.bytes_per_second() / (1024.0 * 1024.0),
            self.avg_processing_time_us()
        )
    }
}

/// Metric timer for measuring frame processing time
pub struct MetricTimer {
    start: Instant,
    metrics: Arc<DecodeMetrics>,
    frame_size: usize,
    headers: usize,
}

impl MetricTimer {
    /// Create a new metric timer
    pub fn new(metrics: Arc<DecodeMetrics>, frame_size: usize) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            frame_size,
            headers: 0,
        }
    }

    /// Record how many headers the frame decoded into
    pub fn set_headers(&mut self, headers: usize) {
        self.headers = headers;
    }
}

impl Drop for MetricTimer {
    fn drop(&mut self) {
        let duration: Duration = self.start.elapsed();
        self.metrics
            .record_frame(self.frame_size, self.headers, duration);
    }
}
