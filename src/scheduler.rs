//! Periodic driver. Every tick checks connectivity and, when offline, runs
//! one login handshake. A tick that finds the previous one still running is
//! skipped, never queued.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::portal::{ConnectivityCheck, LoginHandshake, PortalApi};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    AlreadyOnline,
    LoggedIn,
    Failed(String),
}

impl TickOutcome {
    /// Process exit status for a one-shot run.
    pub fn exit_code(&self) -> i32 {
        match self {
            TickOutcome::AlreadyOnline | TickOutcome::LoggedIn => 0,
            TickOutcome::Failed(_) => 1,
        }
    }
}

#[async_trait]
pub trait TickHandler: Send + Sync + 'static {
    async fn on_tick(&self) -> TickOutcome;
}

/// Probe first; log in only when offline.
pub struct ReloginTask<C: ConnectivityCheck, P: PortalApi> {
    probe: C,
    handshake: LoginHandshake<P>,
}

impl<C: ConnectivityCheck, P: PortalApi> ReloginTask<C, P> {
    pub fn new(probe: C, handshake: LoginHandshake<P>) -> Self {
        Self { probe, handshake }
    }
}

#[async_trait]
impl<C, P> TickHandler for ReloginTask<C, P>
where
    C: ConnectivityCheck + 'static,
    P: PortalApi + 'static,
{
    async fn on_tick(&self) -> TickOutcome {
        if self.probe.is_online().await {
            info!("network is online, no login needed");
            return TickOutcome::AlreadyOnline;
        }

        info!("network is offline, starting portal login");
        let report = self.handshake.run().await;
        info!(
            "handshake started at {} finished in {:.1}s: {} captcha round(s), {} restart(s)",
            report.started_at.to_rfc3339(),
            report.elapsed.as_secs_f64(),
            report.captcha_rounds,
            report.restarts
        );
        match report.outcome {
            Ok(_) => TickOutcome::LoggedIn,
            Err(e) => TickOutcome::Failed(e.to_string()),
        }
    }
}

/// What a single tick did.
#[derive(Debug)]
pub enum Dispatch {
    Started(JoinHandle<TickOutcome>),
    SkippedBusy,
}

pub struct Scheduler<H: TickHandler> {
    handler: Arc<H>,
    interval: Duration,
    in_flight: Arc<Mutex<()>>,
    skipped: AtomicU64,
}

impl<H: TickHandler> Scheduler<H> {
    pub fn new(handler: Arc<H>, interval: Duration) -> Self {
        Self {
            handler,
            interval,
            in_flight: Arc::new(Mutex::new(())),
            skipped: AtomicU64::new(0),
        }
    }

    /// Ticks dropped because an attempt was still in flight.
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Start one tick on its own task unless another is still running.
    pub fn dispatch(&self) -> Dispatch {
        let guard = match Arc::clone(&self.in_flight).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                self.skipped.fetch_add(1, Ordering::SeqCst);
                warn!("previous login attempt still running, skipping this tick");
                return Dispatch::SkippedBusy;
            }
        };

        let handler = Arc::clone(&self.handler);
        Dispatch::Started(tokio::spawn(async move {
            let _guard = guard;
            let outcome = handler.on_tick().await;
            match &outcome {
                TickOutcome::Failed(reason) => error!("tick failed: {}", reason),
                other => info!("tick finished: {:?}", other),
            }
            outcome
        }))
    }

    /// Tick immediately, then every `interval`, until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            "scheduler started, checking every {}s",
            self.interval.as_secs()
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let _ = self.dispatch();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    struct BlockingHandler {
        calls: AtomicU32,
        release: Notify,
    }

    impl BlockingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                release: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl TickHandler for BlockingHandler {
        async fn on_tick(&self) -> TickOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            TickOutcome::LoggedIn
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TickHandler for FailingHandler {
        async fn on_tick(&self) -> TickOutcome {
            TickOutcome::Failed("location parameters unavailable".into())
        }
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let handler = BlockingHandler::new();
        let scheduler = Scheduler::new(Arc::clone(&handler), Duration::from_secs(60));

        let first = match scheduler.dispatch() {
            Dispatch::Started(h) => h,
            Dispatch::SkippedBusy => panic!("first tick must start"),
        };
        tokio::task::yield_now().await;

        assert!(matches!(scheduler.dispatch(), Dispatch::SkippedBusy));
        assert_eq!(scheduler.skipped_ticks(), 1);

        handler.release.notify_one();
        assert_eq!(first.await.unwrap(), TickOutcome::LoggedIn);

        let third = match scheduler.dispatch() {
            Dispatch::Started(h) => h,
            Dispatch::SkippedBusy => panic!("lock must be free after the attempt"),
        };
        handler.release.notify_one();
        third.await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_tick_does_not_block_next() {
        let scheduler = Scheduler::new(Arc::new(FailingHandler), Duration::from_secs(60));
        for _ in 0..2 {
            match scheduler.dispatch() {
                Dispatch::Started(h) => assert_eq!(h.await.unwrap().exit_code(), 1),
                Dispatch::SkippedBusy => panic!("previous tick already finished"),
            }
        }
        assert_eq!(scheduler.skipped_ticks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_skips_while_attempt_in_flight() {
        let handler = BlockingHandler::new();
        let scheduler = Scheduler::new(Arc::clone(&handler), Duration::from_secs(300));

        // Ticks at t=0, 300, 600, 900; stop before 1200.
        scheduler
            .run_until(tokio::time::sleep(Duration::from_secs(1000)))
            .await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.skipped_ticks(), 3);
        handler.release.notify_one();
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TickOutcome::AlreadyOnline.exit_code(), 0);
        assert_eq!(TickOutcome::LoggedIn.exit_code(), 0);
        assert_eq!(TickOutcome::Failed("x".into()).exit_code(), 1);
    }
}
