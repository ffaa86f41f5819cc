//! One progress stream across hashing and upload.
//!
//! Hashing fills the first quarter of the scale; bundling, transmission and
//! archive verification share the remaining three quarters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;

use crate::models::{Phase, ProgressEvent};

pub const HASHING_END: f32 = 25.0;
pub const BUNDLING_END: f32 = 40.0;
pub const UPLOADING_END: f32 = 70.0;
pub const VERIFYING_END: f32 = 100.0;

/// Sends progress events to whoever holds the receiving end.
///
/// Percentages never go backwards; a lower value is raised to the last one
/// sent. A reporter without a receiver silently drops events.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    last_percent: Arc<AtomicU32>,
}

pub fn channel() -> (ProgressReporter, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ProgressReporter {
            tx: Some(tx),
            last_percent: Arc::new(AtomicU32::new(0f32.to_bits())),
        },
        rx,
    )
}

fn scale(start: f32, end: f32, fraction: f64) -> f32 {
    start + (end - start) * fraction.clamp(0.0, 1.0) as f32
}

impl ProgressReporter {
    /// Reporter that discards everything
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn last_percent(&self) -> f32 {
        f32::from_bits(self.last_percent.load(Ordering::SeqCst))
    }

    fn emit(
        &self,
        phase: Phase,
        percent: f32,
        message: String,
        bytes: Option<(u64, u64)>,
    ) {
        let prev = self.last_percent();
        let percent = percent.clamp(prev, 100.0);
        self.last_percent.store(percent.to_bits(), Ordering::SeqCst);

        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressEvent {
                phase,
                percent,
                message,
                bytes_sent: bytes.map(|b| b.0),
                bytes_total: bytes.map(|b| b.1),
            });
        }
    }

    pub fn hashing(&self, bytes_hashed: u64, bytes_total: u64, file_name: &str) {
        let fraction = if bytes_total == 0 {
            1.0
        } else {
            bytes_hashed as f64 / bytes_total as f64
        };
        self.emit(
            Phase::Hashing,
            scale(0.0, HASHING_END, fraction),
            format!("Hashed {}", file_name),
            None,
        );
    }

    pub fn bundling(&self, files_added: usize, files_total: usize) {
        let fraction = if files_total == 0 {
            1.0
        } else {
            files_added as f64 / files_total as f64
        };
        self.emit(
            Phase::Bundling,
            scale(HASHING_END, BUNDLING_END, fraction),
            format!("Bundled {} of {} files", files_added, files_total),
            None,
        );
    }

    pub fn uploading(&self, bytes_sent: u64, bytes_total: u64) {
        let fraction = if bytes_total == 0 {
            1.0
        } else {
            bytes_sent as f64 / bytes_total as f64
        };
        self.emit(
            Phase::Uploading,
            scale(BUNDLING_END, UPLOADING_END, fraction),
            format!("Sent {} of {} bytes", bytes_sent, bytes_total),
            Some((bytes_sent, bytes_total)),
        );
    }

    /// `archive_percent` is the archive's own 0-100 value
    pub fn verifying(&self, archive_percent: f32, message: &str) {
        self.emit(
            Phase::Verifying,
            scale(
                UPLOADING_END,
                VERIFYING_END,
                f64::from(archive_percent) / 100.0,
            ),
            message.to_string(),
            None,
        );
    }

    pub fn complete(&self, message: &str) {
        self.emit(Phase::Complete, 100.0, message.to_string(), None);
    }
}
