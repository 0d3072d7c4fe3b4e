//! Periodic time broadcast.
//!
//! One cycle ("tick") formats the current local time and hands it to
//! `ConnectionRegistry::deliver`, which writes to every active connection
//! and drops the ones whose write fails.
//!
//! Overlap policy:
//! - the timer fires on a fixed period measured from `run` start;
//! - the loop awaits each cycle before taking the next tick; when a cycle
//!   overruns the period the overdue tick fires once as soon as it ends
//!   and any further missed ticks are skipped, not replayed;
//! - `tick` is single-flight, so a manual tick racing the timer waits.
//!
//! Two cycles therefore never write to the same connection concurrently,
//! and tick N's message always reaches a client before tick N+1's.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ticker_core::{BroadcastMessage, DeliveryReport, ServerMessage};
use ticker_protocol::text_codec;

use crate::types::SharedRegistry;

/// Source of the wall-clock time put into each message.
pub type Clock = Arc<dyn Fn() -> NaiveTime + Send + Sync>;

fn local_time() -> NaiveTime {
    Local::now().time()
}

/// Build the broadcast for a given instant.
pub fn time_message(time: NaiveTime) -> BroadcastMessage {
    BroadcastMessage::new(text_codec::encode(&ServerMessage::Time(time)))
}

/// Timer-driven fan-out of the current time.
pub struct Broadcaster {
    registry: SharedRegistry,
    period: Duration,
    write_timeout: Duration,
    clock: Clock,
    in_flight: Mutex<()>,
}

impl Broadcaster {
    pub fn new(registry: SharedRegistry, period: Duration, write_timeout: Duration) -> Self {
        Broadcaster {
            registry,
            period,
            write_timeout,
            clock: Arc::new(local_time),
            in_flight: Mutex::new(()),
        }
    }

    /// Replace the local wall clock.
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveTime + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run one broadcast cycle now.
    pub async fn tick(&self) -> DeliveryReport {
        let _cycle = self.in_flight.lock().await;

        let message = time_message((self.clock)());
        let report = self.registry.deliver(&message, self.write_timeout).await;

        debug!(
            message = %message,
            recipients = report.recipients,
            delivered = report.delivered,
            removed = report.removed.len(),
            "broadcast tick"
        );
        report
    }

    /// Tick every `period` until `shutdown` is cancelled.
    ///
    /// A cycle already in progress when shutdown is requested finishes;
    /// no cycle starts afterwards.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = self.period.as_millis() as u64, "broadcaster started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("broadcaster stopped");
    }

    /// Spawn `run` onto the runtime.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown))
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("period", &self.period)
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use ticker_core::{
        Connection, ConnectionId, ConnectionRegistry, ConnectionState, DeliveryError, MessageSink,
    };

    #[derive(Default)]
    struct SlowSink {
        sent: StdMutex<Vec<String>>,
        delay: Duration,
        broken: AtomicBool,
        writing: AtomicUsize,
        overlapped: AtomicBool,
    }

    #[async_trait]
    impl MessageSink for SlowSink {
        async fn send_text(&self, text: &str) -> Result<(), DeliveryError> {
            if self.writing.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.writing.fetch_sub(1, Ordering::SeqCst);

            if self.broken.load(Ordering::SeqCst) {
                return Err(DeliveryError::Transport("broken pipe".into()));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn close(&self) {}
    }

    fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    async fn register(registry: &SharedRegistry, id: u64, sink: Arc<SlowSink>) {
        let conn = Connection::new(ConnectionId(id), sink);
        conn.transition(ConnectionState::Active).unwrap();
        registry.add(Arc::new(conn)).await.unwrap();
    }

    fn fixed_broadcaster(registry: &SharedRegistry, period: Duration) -> Arc<Broadcaster> {
        Arc::new(
            Broadcaster::new(registry.clone(), period, Duration::from_secs(30))
                .with_clock(|| NaiveTime::from_hms_opt(9, 5, 3).unwrap()),
        )
    }

    #[test]
    fn formats_fixed_instant() {
        assert_eq!(time_message(hms(9, 5, 3)).text(), "The time is now 09:05:03");
        assert_eq!(time_message(hms(21, 0, 59)).text(), "The time is now 21:00:59");
    }

    #[tokio::test]
    async fn tick_without_connections_is_a_noop() {
        let registry: SharedRegistry = Arc::new(ConnectionRegistry::new());
        let broadcaster = fixed_broadcaster(&registry, Duration::from_secs(5));

        assert_eq!(broadcaster.tick().await, DeliveryReport::default());
    }

    #[tokio::test]
    async fn tick_sends_the_same_text_to_everyone() {
        let registry: SharedRegistry = Arc::new(ConnectionRegistry::new());
        let sinks: Vec<_> = (0..3).map(|_| Arc::new(SlowSink::default())).collect();
        for (id, sink) in sinks.iter().enumerate() {
            register(&registry, id as u64, sink.clone()).await;
        }

        let report = fixed_broadcaster(&registry, Duration::from_secs(5)).tick().await;

        assert_eq!(report.delivered, 3);
        for sink in &sinks {
            assert_eq!(
                *sink.sent.lock().unwrap(),
                vec!["The time is now 09:05:03".to_string()]
            );
        }
        assert_eq!(registry.len().await, 3);
    }

    #[tokio::test]
    async fn failed_write_is_gone_before_the_next_tick() {
        let registry: SharedRegistry = Arc::new(ConnectionRegistry::new());
        let healthy = Arc::new(SlowSink::default());
        let broken = Arc::new(SlowSink::default());
        broken.broken.store(true, Ordering::SeqCst);
        register(&registry, 1, healthy.clone()).await;
        register(&registry, 2, broken.clone()).await;
        let broadcaster = fixed_broadcaster(&registry, Duration::from_secs(5));

        let first = broadcaster.tick().await;
        assert_eq!(first.removed, vec![ConnectionId(2)]);
        assert_eq!(registry.len().await, 1);

        let second = broadcaster.tick().await;
        assert_eq!(second.recipients, 1);
        assert_eq!(second.delivered, 1);
        assert_eq!(healthy.sent.lock().unwrap().len(), 2);
        assert!(broken.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_fires_on_period_and_stops_on_shutdown() {
        let registry: SharedRegistry = Arc::new(ConnectionRegistry::new());
        let sink = Arc::new(SlowSink::default());
        register(&registry, 1, sink.clone()).await;

        let shutdown = CancellationToken::new();
        let handle = fixed_broadcaster(&registry, Duration::from_secs(5)).spawn(shutdown.clone());

        // Nothing at start; ticks at 5s and 10s.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sink.sent.lock().unwrap().is_empty());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 2);

        shutdown.cancel();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cycles_skip_ticks_instead_of_overlapping() {
        let registry: SharedRegistry = Arc::new(ConnectionRegistry::new());
        let sink = Arc::new(SlowSink {
            delay: Duration::from_secs(12),
            ..SlowSink::default()
        });
        register(&registry, 1, sink.clone()).await;

        let shutdown = CancellationToken::new();
        let handle = fixed_broadcaster(&registry, Duration::from_secs(5)).spawn(shutdown.clone());

        // Each cycle takes 12s. Cycles start at 5s, 17s and 29s: the overdue
        // tick fires once when the previous cycle ends, the rest are dropped.
        // The 29s cycle is still running at shutdown and is allowed to finish.
        tokio::time::sleep(Duration::from_secs(33)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(sink.sent.lock().unwrap().len(), 3);
        assert!(!sink.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_manual_ticks_are_serialized() {
        let registry: SharedRegistry = Arc::new(ConnectionRegistry::new());
        let sink = Arc::new(SlowSink {
            delay: Duration::from_millis(500),
            ..SlowSink::default()
        });
        register(&registry, 1, sink.clone()).await;
        let broadcaster = fixed_broadcaster(&registry, Duration::from_secs(5));

        let (a, b, c) = tokio::join!(broadcaster.tick(), broadcaster.tick(), broadcaster.tick());

        assert_eq!(a.delivered + b.delivered + c.delivered, 3);
        assert!(!sink.overlapped.load(Ordering::SeqCst));
    }
}
