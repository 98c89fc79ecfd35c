//! Hand-off of completed sample frames from the sampling peripheral to the
//! cadence.
//!
//! Single producer, single consumer, capacity one. The peripheral is only
//! restarted after the cadence has taken the previous frame, so the slot is
//! normally empty when a new frame arrives; if it is not, the new frame is
//! dropped and counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel as xch;
use thermal_traits::SampleSink;

use crate::frame::RawFrame;

/// Create a connected publisher/bridge pair.
pub fn channel() -> (SamplePublisher, SampleBridge) {
    let (tx, rx) = xch::bounded(1);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        SamplePublisher {
            tx,
            dropped: Arc::clone(&dropped),
        },
        SampleBridge { rx, dropped },
    )
}

/// Producer side, handed to the sampling peripheral.
#[derive(Debug, Clone)]
pub struct SamplePublisher {
    tx: xch::Sender<RawFrame>,
    dropped: Arc<AtomicU64>,
}

impl SampleSink for SamplePublisher {
    fn on_samples(&self, raw: &[u16]) {
        match self.tx.try_send(RawFrame::from_slice(raw)) {
            Ok(()) => {}
            Err(xch::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("frame not consumed yet, dropping new frame");
            }
            Err(xch::TrySendError::Disconnected(_)) => {
                tracing::debug!("sample consumer gone");
            }
        }
    }
}

/// Consumer side, owned by the cadence.
#[derive(Debug)]
pub struct SampleBridge {
    rx: xch::Receiver<RawFrame>,
    dropped: Arc<AtomicU64>,
}

impl SampleBridge {
    /// Take the pending frame, if one has been published.
    pub fn take(&self) -> Option<RawFrame> {
        self.rx.try_recv().ok()
    }

    /// Frames the producer had to drop because the slot was still full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
