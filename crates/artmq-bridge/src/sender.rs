//! Trigger-driven send loop
//!
//! Writers call [`SendTrigger::trigger_send`] after changing the store; a single
//! worker turns each trigger into a send of the store's *current* contents.
//! Triggers carry no data, so a burst of them collapses into one send of the
//! latest state.

use artmq_core::{LightingAddress, UniverseStore};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SendPipelineConfig;
use crate::shutdown::Shutdown;
use crate::{BridgeError, LightingTransport, Result};

/// Handle for requesting a send; clone freely
#[derive(Debug, Clone)]
pub struct SendTrigger {
    tx: mpsc::Sender<()>,
}

impl SendTrigger {
    /// Queue a send without blocking.
    ///
    /// Returns `false` if the trigger was dropped: either the queue is full
    /// (a queued trigger will read the same state anyway) or the worker is gone.
    pub fn trigger_send(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                debug!("Send queue full, trigger coalesced");
                false
            }
            Err(TrySendError::Closed(())) => {
                debug!("Send queue closed, trigger dropped");
                false
            }
        }
    }
}

/// Bounded trigger queue plus its background worker
pub struct SendPipeline {
    store: Arc<UniverseStore>,
    transport: Arc<dyn LightingTransport>,
    config: SendPipelineConfig,
    trigger: SendTrigger,
    rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl SendPipeline {
    pub fn new(
        store: Arc<UniverseStore>,
        transport: Arc<dyn LightingTransport>,
        config: SendPipelineConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            store,
            transport,
            config,
            trigger: SendTrigger { tx },
            rx: Mutex::new(Some(rx)),
        }
    }

    /// A new handle onto the trigger queue
    pub fn trigger(&self) -> SendTrigger {
        self.trigger.clone()
    }

    pub fn trigger_send(&self) -> bool {
        self.trigger.trigger_send()
    }

    /// Spawn the worker. It exits when `shutdown` fires or every trigger
    /// handle (including this pipeline) has been dropped and the queue drained.
    pub fn start(&self, shutdown: Shutdown) -> Result<JoinHandle<()>> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| BridgeError::Other("Send pipeline already started".to_string()))?;

        let worker = Worker {
            store: self.store.clone(),
            transport: self.transport.clone(),
            config: self.config,
        };

        Ok(tokio::spawn(worker.run(rx, shutdown)))
    }
}

struct Worker {
    store: Arc<UniverseStore>,
    transport: Arc<dyn LightingTransport>,
    config: SendPipelineConfig,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<()>, mut shutdown: Shutdown) {
        info!(
            "Send worker started (queue {}, min frame interval {:?})",
            self.config.queue_capacity, self.config.min_frame_interval
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                trigger = rx.recv() => {
                    if trigger.is_none() {
                        debug!("Send queue closed");
                        break;
                    }

                    // Everything already queued is satisfied by this send.
                    let mut coalesced = 0usize;
                    while rx.try_recv().is_ok() {
                        coalesced += 1;
                    }
                    if coalesced > 0 {
                        debug!("Coalesced {} send triggers", coalesced);
                    }

                    tokio::select! {
                        biased;
                        _ = shutdown.wait() => break,
                        _ = self.send_snapshot() => {}
                    }

                    if !self.config.min_frame_interval.is_zero() {
                        tokio::select! {
                            biased;
                            _ = shutdown.wait() => break,
                            _ = tokio::time::sleep(self.config.min_frame_interval) => {}
                        }
                    }
                }
            }
        }

        info!("Send worker stopped");
    }

    /// Send every universe currently in the store; returns how many were sent
    async fn send_snapshot(&self) -> usize {
        let snapshot = self.store.get();
        let mut sent = 0;

        for (universe, data) in &snapshot {
            let address = LightingAddress::from(*universe);
            debug!("DMX send to {} (universe {})", address, universe);

            match self.transport.send(address, data).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("DMX send to {} failed: {}", address, e),
            }
        }

        sent
    }
}
