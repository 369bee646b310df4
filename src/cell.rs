//! Async wrapper driving the queue discipline from an event loop: an
//! ingress handle for the upstream, an egress owning the discipline and the
//! probability-update tick, and a control interface for live reconfiguration.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::disc::{DualPi2Config, DualPi2QueueDisc};
use crate::error::Error;
use crate::packet::Packet;

/// State of the downstream transmit queue. A pending-dequeue batch is only
/// pre-staged while the downstream reports itself stopped, i.e. the batch
/// being computed defines the next transmission.
pub trait TxQueueState: Send + Sync {
    fn is_stopped(&self) -> bool;
}

/// Downstream without an aggregation buffer; pending-dequeue calls only
/// refresh the latency estimator samples.
#[derive(Debug, Default)]
pub struct NeverStopped;

impl TxQueueState for NeverStopped {
    fn is_stopped(&self) -> bool {
        false
    }
}

pub trait Ingress<P>: Send + Sync
where
    P: Packet,
{
    fn enqueue(&self, packet: P) -> Result<(), Error>;
}

#[async_trait]
pub trait Egress<P>: Send
where
    P: Packet,
{
    async fn dequeue(&mut self) -> Option<P>;

    fn reset(&mut self) {}
}

pub trait ControlInterface: Send + Sync + 'static {
    type Config: Send;

    fn set_config(&self, config: Self::Config) -> Result<(), Error>;
}

pub struct DualPi2CellIngress<P>
where
    P: Packet,
{
    ingress: mpsc::UnboundedSender<P>,
}

impl<P> Clone for DualPi2CellIngress<P>
where
    P: Packet,
{
    fn clone(&self) -> Self {
        Self {
            ingress: self.ingress.clone(),
        }
    }
}

impl<P> Ingress<P> for DualPi2CellIngress<P>
where
    P: Packet + Send,
{
    fn enqueue(&self, packet: P) -> Result<(), Error> {
        self.ingress
            .send(packet)
            .map_err(|_| Error::ChannelError("Data channel is closed.".to_string()))?;
        Ok(())
    }
}

pub struct DualPi2CellEgress<P>
where
    P: Packet,
{
    egress: mpsc::UnboundedReceiver<P>,
    config_rx: mpsc::UnboundedReceiver<DualPi2Config>,
    disc: DualPi2QueueDisc<P>,
    tx_state: Arc<dyn TxQueueState>,
    next_update: Instant,
}

impl<P> DualPi2CellEgress<P>
where
    P: Packet,
{
    fn set_config(&mut self, config: DualPi2Config) {
        debug!(?config, "Set inner config:");
        if let Err(e) = self.disc.set_config(config) {
            warn!("Rejected config update: {}", e);
        }
    }

    /// Move everything the upstream has sent into the discipline, so the
    /// controller and the scheduler see the full backlog.
    fn drain_ingress(&mut self, now: Instant) {
        while let Ok(packet) = self.egress.try_recv() {
            self.disc.enqueue(packet, now);
        }
        while let Ok(config) = self.config_rx.try_recv() {
            self.set_config(config);
        }
    }

    // Run every update whose deadline has passed, each at its scheduled
    // instant.
    fn catch_up_updates(&mut self, now: Instant) {
        while now >= self.next_update {
            let tick = self.next_update;
            self.disc.update_probability(tick);
            self.next_update += self.disc.config().t_update;
        }
    }

    /// Downstream notification that its transmit queue computed the size of
    /// the next batch. See [`DualPi2QueueDisc::pending_dequeue`].
    pub fn pending_dequeue(&mut self, pending_bytes: usize) {
        let now = Instant::now();
        self.drain_ingress(now);
        self.catch_up_updates(now);
        let stopped = self.tx_state.is_stopped();
        self.disc.pending_dequeue(pending_bytes, stopped, now);
    }

    pub fn queue_disc(&self) -> &DualPi2QueueDisc<P> {
        &self.disc
    }
}

#[async_trait]
impl<P> Egress<P> for DualPi2CellEgress<P>
where
    P: Packet + Send + Sync,
{
    async fn dequeue(&mut self) -> Option<P> {
        loop {
            let now = Instant::now();
            self.drain_ingress(now);
            self.catch_up_updates(now);
            if let Some(packet) = self.disc.dequeue(now) {
                return Some(packet);
            }
            tokio::select! {
                biased;
                Some(config) = self.config_rx.recv() => {
                    self.set_config(config);
                }
                _ = tokio::time::sleep_until(self.next_update) => {}
                packet = self.egress.recv() => {
                    // `packet` can be None only if the channel is closed; the
                    // discipline was empty just above, so nothing is lost.
                    let packet = packet?;
                    self.disc.enqueue(packet, Instant::now());
                }
            }
        }
    }

    // This must be called before any dequeue
    fn reset(&mut self) {
        self.next_update = Instant::now() + self.disc.config().start_time;
    }
}

pub struct DualPi2CellControlInterface {
    config_tx: mpsc::UnboundedSender<DualPi2Config>,
}

impl ControlInterface for DualPi2CellControlInterface {
    type Config = DualPi2Config;

    fn set_config(&self, config: Self::Config) -> Result<(), Error> {
        config.validate()?;
        info!("Setting DualPi2 config");
        self.config_tx
            .send(config)
            .map_err(|_| Error::ConfigError("Control channel is closed.".to_string()))?;
        Ok(())
    }
}

pub struct DualPi2Cell<P>
where
    P: Packet,
{
    ingress: Arc<DualPi2CellIngress<P>>,
    egress: DualPi2CellEgress<P>,
    control_interface: Arc<DualPi2CellControlInterface>,
}

impl<P> DualPi2Cell<P>
where
    P: Packet,
{
    pub fn new(config: DualPi2Config, tx_state: Arc<dyn TxQueueState>) -> Result<Self, Error> {
        debug!("New DualPi2Cell");
        let (rx, tx) = mpsc::unbounded_channel();
        let (config_tx, config_rx) = mpsc::unbounded_channel();
        let start_time = config.start_time;
        let disc = DualPi2QueueDisc::new(config)?;
        Ok(Self {
            ingress: Arc::new(DualPi2CellIngress { ingress: rx }),
            egress: DualPi2CellEgress {
                egress: tx,
                config_rx,
                disc,
                tx_state,
                next_update: Instant::now() + start_time,
            },
            control_interface: Arc::new(DualPi2CellControlInterface { config_tx }),
        })
    }

    pub fn sender(&self) -> Arc<DualPi2CellIngress<P>> {
        self.ingress.clone()
    }

    pub fn receiver(&mut self) -> &mut DualPi2CellEgress<P> {
        &mut self.egress
    }

    pub fn into_receiver(self) -> DualPi2CellEgress<P> {
        self.egress
    }

    pub fn control_interface(&self) -> Arc<DualPi2CellControlInterface> {
        self.control_interface.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::time::{advance, Duration};

    use crate::disc::WIFI_FRAME_OVERHEAD;
    use crate::packet::testing::TestPacket;
    use crate::packet::Ecn;

    use super::*;

    #[derive(Debug, Default)]
    struct StoppableQueue {
        stopped: AtomicBool,
    }

    impl TxQueueState for StoppableQueue {
        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::Acquire)
        }
    }

    fn cell(config: DualPi2Config) -> DualPi2Cell<TestPacket> {
        DualPi2Cell::new(config, Arc::new(NeverStopped)).unwrap()
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn packets_flow_through_the_cell() {
        let cell = cell(DualPi2Config::default());
        let ingress = cell.sender();
        let mut egress = cell.into_receiver();
        egress.reset();

        for size in [1000, 1200, 900] {
            ingress.enqueue(TestPacket::new(size, Ecn::NotEct)).unwrap();
        }
        for size in [1000, 1200, 900] {
            let received = egress.dequeue().await.unwrap();
            assert_eq!(received.size, size);
        }
        assert_eq!(egress.queue_disc().stats().dequeued_packets, 3);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn controller_ticks_while_backlogged() {
        let cell = cell(DualPi2Config::default());
        let ingress = cell.sender();
        let mut egress = cell.into_receiver();
        egress.reset();

        ingress.enqueue(TestPacket::new(1000, Ecn::NotEct)).unwrap();
        ingress.enqueue(TestPacket::new(1000, Ecn::NotEct)).unwrap();
        egress.dequeue().await.unwrap();

        // The second packet now sits in the discipline; a tick 15 ms later
        // sees its sojourn and moves the base probability.
        advance(Duration::from_millis(100)).await;
        egress.dequeue().await.unwrap();
        let probs = egress.queue_disc().probabilities();
        assert!(probs.base_prob > 0.0);
        assert!((probs.p_cl - (2.0 * probs.base_prob).min(1.0)).abs() < 1e-12);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn control_interface_swaps_parameters() {
        let cell = cell(DualPi2Config::default());
        let control = cell.control_interface();
        let ingress = cell.sender();
        let mut egress = cell.into_receiver();
        egress.reset();

        control
            .set_config(DualPi2Config {
                k: 4.0,
                ..Default::default()
            })
            .unwrap();
        // Invalid updates are rejected at the interface.
        assert!(control
            .set_config(DualPi2Config {
                mtu: 10,
                ..Default::default()
            })
            .is_err());

        ingress.enqueue(TestPacket::new(1000, Ecn::NotEct)).unwrap();
        egress.dequeue().await.unwrap();
        assert_eq!(egress.queue_disc().config().k, 4.0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn pending_dequeue_is_gated_on_downstream_state() {
        let tx_state = Arc::new(StoppableQueue::default());
        let cell: DualPi2Cell<TestPacket> =
            DualPi2Cell::new(DualPi2Config::default(), tx_state.clone()).unwrap();
        let ingress = cell.sender();
        let mut egress = cell.into_receiver();
        egress.reset();

        for _ in 0..8 {
            ingress.enqueue(TestPacket::new(1000, Ecn::Ect1)).unwrap();
        }
        let budget = 4 * (1000 + WIFI_FRAME_OVERHEAD);

        // Not stopped: samples only, nothing staged.
        egress.pending_dequeue(budget);
        assert_eq!(egress.queue_disc().staged_packets(), 0);

        tx_state.stopped.store(true, Ordering::Release);
        egress.pending_dequeue(budget);
        assert_eq!(egress.queue_disc().staged_packets(), 4);

        // The staged batch is handed out first, fully marked: four packets
        // remain live, so the top-up marked the whole batch.
        for _ in 0..4 {
            assert_eq!(egress.dequeue().await.unwrap().ecn, Ecn::Ce);
        }
        for _ in 0..4 {
            assert_eq!(egress.dequeue().await.unwrap().ecn, Ecn::Ect1);
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn closed_ingress_finishes_the_egress() {
        let cell = cell(DualPi2Config::default());
        let ingress = cell.sender();
        let mut egress = cell.into_receiver();
        egress.reset();

        ingress.enqueue(TestPacket::new(1000, Ecn::NotEct)).unwrap();
        drop(ingress);
        assert!(egress.dequeue().await.is_some());
        assert!(egress.dequeue().await.is_none());
    }
}
