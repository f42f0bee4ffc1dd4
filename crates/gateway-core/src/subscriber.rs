//! Downstream subscriber outbound buffer (spec §4.8).
//!
//! Each subscriber gets a bounded buffer of outbound frames. On overflow,
//! `DropOldest` discards the stalest queued frame to make room for the
//! newest one; `Close` emits `INTERNAL_QUEUE_BACKPRESSURE` and terminates
//! the connection. The buffer is a plain `VecDeque` behind a `Notify`,
//! mirroring the open-candle lane in the queue crate.

use crate::config::OverflowPolicy;
use crate::metrics::GatewayMetrics;
use candle_protocol::{error_codes, Candle, ErrorFrame, Exchange, QuoteFrame, SubscribedFrame};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

pub type SubscriberId = Uuid;

#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Subscribed(SubscribedFrame),
    Quote(QuoteFrame),
    Error(ErrorFrame),
}

struct Inner {
    queue: VecDeque<OutboundFrame>,
    closed: bool,
}

pub struct Subscriber {
    pub id: SubscriberId,
    pub exchange: Exchange,
    pub contract_type: String,
    /// Total quotes to deliver before the subscription auto-closes; 0 means
    /// unbounded. Counted across the whole subscription, not per symbol.
    pub limit: u64,
    buffer_max: usize,
    overflow_policy: OverflowPolicy,
    sent: AtomicU64,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Subscriber {
    pub fn new(exchange: Exchange, contract_type: String, limit: u64, buffer_max: usize, overflow_policy: OverflowPolicy) -> Self {
        Subscriber {
            id: Uuid::new_v4(),
            exchange,
            contract_type,
            limit,
            buffer_max: buffer_max.max(1),
            overflow_policy,
            sent: AtomicU64::new(0),
            inner: Mutex::new(Inner { queue: VecDeque::new(), closed: false }),
            notify: Notify::new(),
        }
    }

    pub fn limit_reached(&self) -> bool {
        self.limit != 0 && self.sent.load(Ordering::Relaxed) >= self.limit
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("subscriber buffer mutex poisoned").closed
    }

    pub fn send_subscribed(&self, frame: SubscribedFrame) {
        self.push_unconditionally(OutboundFrame::Subscribed(frame), None);
    }

    /// Queue a quote for delivery. A no-op once the subscription's limit
    /// has already been reached or the connection is closing.
    pub fn send_quote(&self, candle: &Candle, metrics: &GatewayMetrics) {
        if self.limit_reached() || self.is_closed() {
            return;
        }
        self.push_unconditionally(OutboundFrame::Quote(QuoteFrame::from_candle(candle, Utc::now())), Some(metrics));
        if self.sent.fetch_add(1, Ordering::Relaxed) + 1 >= self.limit && self.limit != 0 {
            self.close();
        }
    }

    pub fn send_error(&self, frame: ErrorFrame, metrics: &GatewayMetrics) {
        if self.is_closed() {
            return;
        }
        self.push_unconditionally(OutboundFrame::Error(frame), Some(metrics));
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("subscriber buffer mutex poisoned");
        inner.closed = true;
        drop(inner);
        self.notify.notify_one();
    }

    fn push_unconditionally(&self, frame: OutboundFrame, metrics: Option<&GatewayMetrics>) {
        let mut inner = self.inner.lock().expect("subscriber buffer mutex poisoned");
        if inner.closed {
            return;
        }
        if inner.queue.len() >= self.buffer_max {
            match self.overflow_policy {
                OverflowPolicy::DropOldest => {
                    inner.queue.pop_front();
                    if let Some(metrics) = metrics {
                        metrics.subscriber_backpressure_total.with_label_values(&["drop_oldest"]).inc();
                    }
                }
                OverflowPolicy::Close => {
                    if let Some(metrics) = metrics {
                        metrics.subscriber_backpressure_total.with_label_values(&["close"]).inc();
                    }
                    inner.queue.push_back(OutboundFrame::Error(
                        ErrorFrame::new(error_codes::INTERNAL_QUEUE_BACKPRESSURE, "subscriber outbound buffer exceeded capacity"),
                    ));
                    inner.closed = true;
                    drop(inner);
                    self.notify.notify_one();
                    return;
                }
            }
        }
        inner.queue.push_back(frame);
        drop(inner);
        self.notify.notify_one();
    }

    /// Wait for and pop the next outbound frame. Returns `None` once the
    /// subscriber is closed and its buffer has drained.
    pub async fn next_frame(&self) -> Option<OutboundFrame> {
        loop {
            {
                let mut inner = self.inner.lock().expect("subscriber buffer mutex poisoned");
                if let Some(frame) = inner.queue.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle() -> Candle {
        candle_protocol::Candle::new(Exchange::Binance, "spot", "BTCUSDT", Utc::now(), 1.0, 2.0, 0.5, 1.5, 10.0, 1, true).unwrap()
    }

    #[tokio::test]
    async fn closes_after_limit_is_reached() {
        let metrics = GatewayMetrics::new();
        let sub = Subscriber::new(Exchange::Binance, "spot".to_owned(), 1, 10, OverflowPolicy::DropOldest);
        sub.send_quote(&candle(), &metrics);
        assert!(matches!(sub.next_frame().await, Some(OutboundFrame::Quote(_))));
        assert!(sub.next_frame().await.is_none());
        assert!(sub.is_closed());
    }

    #[tokio::test]
    async fn drop_oldest_keeps_buffer_bounded() {
        let metrics = GatewayMetrics::new();
        let sub = Subscriber::new(Exchange::Binance, "spot".to_owned(), 0, 2, OverflowPolicy::DropOldest);
        for _ in 0..3 {
            sub.send_quote(&candle(), &metrics);
        }
        assert_eq!(metrics.subscriber_backpressure_total.with_label_values(&["drop_oldest"]).get(), 1.0);
    }

    #[tokio::test]
    async fn close_policy_terminates_on_overflow() {
        let metrics = GatewayMetrics::new();
        let sub = Subscriber::new(Exchange::Binance, "spot".to_owned(), 0, 1, OverflowPolicy::Close);
        sub.send_quote(&candle(), &metrics);
        sub.send_quote(&candle(), &metrics);
        assert!(matches!(sub.next_frame().await, Some(OutboundFrame::Quote(_))));
        assert!(matches!(sub.next_frame().await, Some(OutboundFrame::Error(_))));
        assert!(sub.next_frame().await.is_none());
    }
}
