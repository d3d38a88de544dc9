//! Bounded per-instance message queues.
//!
//! Each queued or active instance owns one FIFO of [`Message`]s. Producers
//! enqueue from their own threads; only the owner dequeues. A second,
//! single-slot channel carries the stop request to an active worker. Once the
//! owner handles that request the queue is closed: every later send, blocked
//! or not, fails with `QueueClosed`.

use crate::port::{Message, PortError};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, error, warn};

pub const DEFAULT_QUEUE_DEPTH: usize = 10;

/// What a producer experiences when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Wait for room.
    #[default]
    Block,
    /// Drop the message and report `QueueFull`.
    Drop,
    /// Report `QueueOverflow`; the deployment treats it as a fault.
    Fatal,
}

/// What an active worker does with pending messages when stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownPolicy {
    #[default]
    Drain,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub depth: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default)]
    pub on_shutdown: ShutdownPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_QUEUE_DEPTH,
            overflow: OverflowPolicy::Block,
            on_shutdown: ShutdownPolicy::Drain,
        }
    }
}

impl QueueConfig {
    pub fn with_depth(depth: usize) -> Self {
        Self {
            depth,
            ..Self::default()
        }
    }

    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }

    pub fn on_shutdown(mut self, policy: ShutdownPolicy) -> Self {
        self.on_shutdown = policy;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub depth: usize,
    pub pending: usize,
    pub high_water: usize,
    pub enqueued: u64,
    pub rejected: u64,
}

#[derive(Debug)]
pub struct MessageQueue {
    owner: String,
    config: QueueConfig,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    /// Dropped on close; blocked senders wake on the disconnect.
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    closed: AtomicBool,
    enqueued: AtomicU64,
    rejected: AtomicU64,
    high_water: AtomicUsize,
}

impl MessageQueue {
    /// A depth of zero is treated as one; configuration validation rejects
    /// it before this point.
    pub fn new(owner: &str, config: QueueConfig) -> Self {
        let (tx, rx) = bounded(config.depth.max(1));
        let (stop_tx, stop_rx) = bounded(1);
        let (close_tx, close_rx) = bounded(0);
        Self {
            owner: owner.to_string(),
            config,
            tx,
            rx,
            stop_tx,
            stop_rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            closed: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            high_water: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuses further messages and releases producers blocked on a full
    /// queue. Messages already queued stay for the owner to drain or discard.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_tx.lock().take();
            debug!(owner = %self.owner, "queue closed");
        }
    }

    fn closed_error(&self) -> PortError {
        PortError::QueueClosed {
            instance: self.owner.clone(),
        }
    }

    pub fn send(&self, message: Message) -> Result<(), PortError> {
        let result = if self.is_closed() {
            Err(self.closed_error())
        } else {
            self.enqueue(message)
        };

        match result {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                self.high_water.fetch_max(self.rx.len(), Ordering::Relaxed);
            }
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn enqueue(&self, message: Message) -> Result<(), PortError> {
        match self.config.overflow {
            OverflowPolicy::Block => select! {
                send(self.tx, message) -> sent => sent.map_err(|_| self.closed_error()),
                recv(self.close_rx) -> _ => {
                    warn!(owner = %self.owner, "queue closed while waiting for room");
                    Err(self.closed_error())
                }
            },
            OverflowPolicy::Drop => match self.tx.try_send(message) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(dropped)) => {
                    warn!(
                        owner = %self.owner,
                        port = dropped.port,
                        "queue full, dropping message"
                    );
                    Err(PortError::QueueFull {
                        instance: self.owner.clone(),
                    })
                }
                Err(TrySendError::Disconnected(_)) => Err(self.closed_error()),
            },
            OverflowPolicy::Fatal => match self.tx.try_send(message) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    error!(owner = %self.owner, depth = self.config.depth, "queue overflow");
                    Err(PortError::QueueOverflow {
                        instance: self.owner.clone(),
                    })
                }
                Err(TrySendError::Disconnected(_)) => Err(self.closed_error()),
            },
        }
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.config.depth,
            pending: self.rx.len(),
            high_water: self.high_water.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn receiver(&self) -> Receiver<Message> {
        self.rx.clone()
    }

    pub(crate) fn stop_receiver(&self) -> Receiver<()> {
        self.stop_rx.clone()
    }

    pub(crate) fn signal_stop(&self) {
        // A pending stop is as good as a second one.
        let _ = self.stop_tx.try_send(());
    }
}
