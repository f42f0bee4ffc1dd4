// queue: dual-pipeline candle buffer (spec §4.3).
//
// Closed candles travel a bounded FIFO that applies backpressure to
// producers: a full queue blocks the offering task up to
// `PRODUCER_BLOCK_TIMEOUT` before the candle is dropped. Open (still
// forming) candles travel a bounded LIFO that never blocks a producer —
// when full it silently evicts the oldest entry, since only the freshest
// open candle is useful to a subscriber. `drain_one` always prefers a
// ready closed candle over an open one.

use candle_protocol::Candle;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::time::timeout;

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub closed_capacity: usize,
    pub open_capacity: usize,
    pub producer_block_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            closed_capacity: 1_000,
            open_capacity: 256,
            producer_block_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub blocking_events_total: AtomicU64,
    pub open_overflow_total: AtomicU64,
    pub closed_dropped_total: AtomicU64,
}

pub struct DualPipelineQueue {
    closed_capacity: usize,
    open_capacity: usize,
    block_timeout: Duration,
    closed_tx: mpsc::Sender<(Candle, Instant)>,
    closed_rx: AsyncMutex<mpsc::Receiver<(Candle, Instant)>>,
    open: StdMutex<VecDeque<(Candle, Instant)>>,
    open_notify: Notify,
    pub metrics: QueueMetrics,
}

impl DualPipelineQueue {
    pub fn new(cfg: QueueConfig) -> Self {
        let (closed_tx, closed_rx) = mpsc::channel(cfg.closed_capacity);
        DualPipelineQueue {
            closed_capacity: cfg.closed_capacity,
            open_capacity: cfg.open_capacity,
            block_timeout: cfg.producer_block_timeout,
            closed_tx,
            closed_rx: AsyncMutex::new(closed_rx),
            open: StdMutex::new(VecDeque::with_capacity(cfg.open_capacity)),
            open_notify: Notify::new(),
            metrics: QueueMetrics::default(),
        }
    }

    /// Offer a candle to the appropriate pipeline. Returns `false` if a
    /// closed candle was dropped after exhausting `PRODUCER_BLOCK_TIMEOUT`.
    pub async fn offer(&self, candle: Candle) -> bool {
        if candle.is_closed {
            self.offer_closed(candle).await
        } else {
            self.offer_open(candle);
            true
        }
    }

    async fn offer_closed(&self, candle: Candle) -> bool {
        let entry = (candle, Instant::now());
        match self.closed_tx.try_send(entry) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(entry)) => {
                self.metrics.blocking_events_total.fetch_add(1, Ordering::Relaxed);
                match timeout(self.block_timeout, self.closed_tx.send(entry)).await {
                    Ok(Ok(())) => true,
                    _ => {
                        self.metrics.closed_dropped_total.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("closed candle dropped: producer block timeout exceeded");
                        false
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn offer_open(&self, candle: Candle) {
        let mut open = self.open.lock().expect("open queue mutex poisoned");
        // A capacity of 0 means unbounded, per CONNECTOR_OPEN_QUEUE_MAXSIZE's
        // documented default; a literal zero-length queue would evict every
        // push, which isn't "unbounded" under any reading.
        if self.open_capacity > 0 && open.len() >= self.open_capacity {
            open.pop_front();
            self.metrics.open_overflow_total.fetch_add(1, Ordering::Relaxed);
        }
        open.push_back((candle, Instant::now()));
        drop(open);
        self.open_notify.notify_one();
    }

    /// Drain the next candle, preferring the closed pipeline. Never
    /// returns `None` while the queue is alive; only a closed `mpsc`
    /// sender side (i.e. the queue being torn down) ends the stream.
    pub async fn drain_one(&self) -> Option<Candle> {
        self.drain_one_timed().await.map(|(candle, _)| candle)
    }

    /// Like [`drain_one`](Self::drain_one), but also returns how long the
    /// candle sat in the queue before being drained — used to observe
    /// `quote_latency_seconds` from enqueue to fan-out.
    pub async fn drain_one_timed(&self) -> Option<(Candle, Duration)> {
        loop {
            if let Some(entry) = self.try_take_closed() {
                return Some(age(entry));
            }
            if let Some(entry) = self.try_take_open() {
                return Some(age(entry));
            }

            let notified = self.open_notify.notified();
            tokio::select! {
                biased;
                entry = async { self.closed_rx.lock().await.recv().await } => return entry.map(age),
                () = notified => continue,
            }
        }
    }

    fn try_take_closed(&self) -> Option<(Candle, Instant)> {
        let mut rx = self.closed_rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    fn try_take_open(&self) -> Option<(Candle, Instant)> {
        self.open.lock().expect("open queue mutex poisoned").pop_back()
    }

    pub fn depth_closed(&self) -> usize {
        self.closed_capacity - self.closed_tx.capacity()
    }

    pub fn depth_open(&self) -> usize {
        self.open.lock().expect("open queue mutex poisoned").len()
    }
}

fn age((candle, enqueued_at): (Candle, Instant)) -> (Candle, Duration) {
    (candle, enqueued_at.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_protocol::Exchange;
    use chrono::Utc;

    fn candle(is_closed: bool) -> Candle {
        Candle::new(Exchange::Binance, "spot", "BTCUSDT", Utc::now(), 1.0, 2.0, 0.5, 1.5, 10.0, 1, is_closed).unwrap()
    }

    #[tokio::test]
    async fn closed_candles_drain_before_open() {
        let q = DualPipelineQueue::new(QueueConfig::default());
        q.offer(candle(false)).await;
        q.offer(candle(true)).await;
        let first = q.drain_one().await.unwrap();
        assert!(first.is_closed);
    }

    #[tokio::test]
    async fn open_pipeline_is_lifo_and_overflow_drops_oldest() {
        let q = DualPipelineQueue::new(QueueConfig {
            closed_capacity: 10,
            open_capacity: 2,
            producer_block_timeout: Duration::from_millis(50),
        });
        for _ in 0..3 {
            q.offer(candle(false)).await;
        }
        assert_eq!(q.metrics.open_overflow_total.load(Ordering::Relaxed), 1);
        assert_eq!(q.depth_open(), 2);
    }

    #[tokio::test]
    async fn open_capacity_zero_never_evicts() {
        let q = DualPipelineQueue::new(QueueConfig {
            closed_capacity: 10,
            open_capacity: 0,
            producer_block_timeout: Duration::from_millis(50),
        });
        for _ in 0..5 {
            q.offer(candle(false)).await;
        }
        assert_eq!(q.metrics.open_overflow_total.load(Ordering::Relaxed), 0);
        assert_eq!(q.depth_open(), 5);
    }

    #[tokio::test]
    async fn drain_one_timed_reports_a_nonzero_age() {
        let q = DualPipelineQueue::new(QueueConfig::default());
        q.offer(candle(true)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (c, age) = q.drain_one_timed().await.unwrap();
        assert!(c.is_closed);
        assert!(age >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn closed_pipeline_drops_after_block_timeout_when_full() {
        let q = DualPipelineQueue::new(QueueConfig {
            closed_capacity: 1,
            open_capacity: 10,
            producer_block_timeout: Duration::from_millis(20),
        });
        assert!(q.offer(candle(true)).await);
        let accepted = q.offer(candle(true)).await;
        assert!(!accepted);
        assert_eq!(q.metrics.blocking_events_total.load(Ordering::Relaxed), 1);
        assert_eq!(q.metrics.closed_dropped_total.load(Ordering::Relaxed), 1);
    }
}
