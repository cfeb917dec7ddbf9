use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::models::{Recommendation, ScanStatus, ToolKind};

/// Wire shape is `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum HubEvent {
    ScanUpdate {
        scan_id: i64,
        status: ScanStatus,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ToolOutput {
        scan_id: i64,
        tool: ToolKind,
        output: String,
    },
    Recommendations {
        scan_id: i64,
        recommendations: Vec<Recommendation>,
    },
}

impl HubEvent {
    pub fn scan_id(&self) -> i64 {
        match self {
            Self::ScanUpdate { scan_id, .. }
            | Self::ToolOutput { scan_id, .. }
            | Self::Recommendations { scan_id, .. } => *scan_id,
        }
    }

    pub fn scan_update(scan_id: i64, status: ScanStatus, message: impl Into<String>) -> Self {
        Self::ScanUpdate {
            scan_id,
            status,
            message: message.into(),
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubFrame {
    pub sequence: u64,
    pub event: HubEvent,
}

#[derive(Debug)]
pub enum Received {
    Event(HubFrame),
    /// The subscriber fell behind and this many of the oldest events were dropped.
    Missed(u64),
}

/// Fan-out of scan events to live subscribers. Publishing never waits on a
/// subscriber; a slow one loses its oldest buffered events instead.
#[derive(Debug)]
pub struct NotificationHub {
    tx: broadcast::Sender<HubFrame>,
    sequence: AtomicU64,
}

impl NotificationHub {
    pub fn new(subscriber_buffer: usize) -> Self {
        let (tx, _rx) = broadcast::channel(subscriber_buffer.max(1));
        Self {
            tx,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish(&self, event: HubEvent) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        // no subscribers is not an error
        let _ = self.tx.send(HubFrame { sequence, event });
        sequence
    }
}

#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<HubFrame>,
}

impl Subscription {
    /// `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<Received> {
        match self.rx.recv().await {
            Ok(frame) => Some(Received::Event(frame)),
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "hub subscriber lagged");
                Some(Received::Missed(skipped))
            }
            Err(RecvError::Closed) => None,
        }
    }

    /// Next event, skipping over lag notices.
    #[cfg(test)]
    pub async fn next_event(&mut self) -> Option<HubEvent> {
        loop {
            match self.recv().await? {
                Received::Event(frame) => return Some(frame.event),
                Received::Missed(_) => continue,
            }
        }
    }
}
