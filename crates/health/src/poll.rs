use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use ferry_core::FerryError;
use indicatif::{ProgressBar, ProgressStyle};
use metrics::{counter, histogram};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A point-in-time observation the poller can judge and report on.
pub trait Snapshot: Display {
    /// Terminal predicate.
    fn is_done(&self) -> bool;

    /// `(done, total)` units for progress display. `total` may be 0 until
    /// the first resources show up.
    fn progress(&self) -> (u64, u64);
}

/// Fixed-interval poll bounded by a deadline. One instance per wait.
pub struct Poller {
    what: String,
    timeout: Duration,
    interval: Duration,
    progress: ProgressBar,
}

impl Poller {
    pub fn new(what: impl Into<String>, timeout: Duration) -> Self {
        Self { what: what.into(), timeout, interval: crate::poll_interval(), progress: ProgressBar::hidden() }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Draw a progress bar on stderr while polling.
    pub fn with_progress(mut self, visible: bool) -> Self {
        if visible {
            let pb = ProgressBar::new(0);
            if let Ok(style) = ProgressStyle::default_bar().template("{spinner:.green} {msg} [{bar:30}] {pos}/{len}") {
                pb.set_style(style);
            }
            self.progress = pb;
        }
        self
    }

    pub fn what(&self) -> &str { &self.what }

    pub fn timeout(&self) -> Duration { self.timeout }

    /// Probe every interval until the snapshot is done or the deadline passes.
    ///
    /// The first probe always runs, even with a zero timeout. A probe error
    /// counts as "not yet": it is logged and the next tick probes again. On
    /// timeout the last good snapshot is logged and carried in
    /// [`FerryError::Timeout`]. A timeout too large to represent never expires.
    pub async fn run<S, F, Fut>(&self, mut probe: F) -> Result<S>
    where
        S: Snapshot,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        let started = Instant::now();
        let deadline = started.checked_add(self.timeout);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<S> = None;
        self.progress.set_message(self.what.clone());
        info!(what = %self.what, timeout_secs = self.timeout.as_secs(), "waiting");

        ticker.tick().await;
        loop {
            match probe().await {
                Ok(snap) => {
                    let (done, total) = snap.progress();
                    self.progress.set_length(total);
                    self.progress.set_position(done);
                    debug!(what = %self.what, done, total, "poll tick");
                    if snap.is_done() {
                        self.progress.finish_and_clear();
                        histogram!("wait_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
                        counter!("wait_ok", 1u64);
                        info!(what = %self.what, elapsed_ms = started.elapsed().as_millis() as u64, "{}", snap);
                        return Ok(snap);
                    }
                    last = Some(snap);
                }
                Err(e) => {
                    counter!("wait_transient_errors", 1u64);
                    warn!(what = %self.what, error = %format!("{:#}", e), "lookup failed; polling again");
                }
            }
            let Some(deadline) = deadline else {
                ticker.tick().await;
                continue;
            };
            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => break,
                _ = ticker.tick() => {}
            }
        }

        counter!("wait_timeout", 1u64);
        let last = last.map(|s| s.to_string()).unwrap_or_else(|| "nothing observed".to_string());
        self.progress.abandon();
        warn!(what = %self.what, last = %last, "timed out");
        Err(FerryError::Timeout { what: self.what.clone(), waited: self.timeout, last }.into())
    }
}
