//! Fixed-interval polling loop.
//!
//! Each cycle walks the configured locations in order: fetch observations,
//! resolve the risk series through the gateway, then hand it to that
//! location's notifier. A failing location is logged and skipped; the rest
//! of the cycle carries on. [`PollerHandle::stop`] ends the loop at the next
//! cycle boundary and cuts the inter-cycle sleep short.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::gateway::RiskGateway;
use crate::models::{Location, RiskSeries};
use crate::notify::{DangerTier, Notifier};
use crate::report;
use crate::risk::RiskModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Stopped,
    Running,
}

/// Cloneable stop switch for a running [`Poller`].
#[derive(Debug, Clone)]
pub struct PollerHandle {
    state: Arc<watch::Sender<PollerState>>,
    stop_requested: Arc<AtomicBool>,
}

impl PollerHandle {
    /// Stops the loop at the next cycle boundary. A stop issued before
    /// [`Poller::run`] starts makes `run` return without polling.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.state.send_replace(PollerState::Stopped);
    }

    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub interval: Duration,
    pub horizon_hours: u32,
    pub use_cache: bool,
    pub output_dir: Option<PathBuf>,
}

/// What happened to one location in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationOutcome {
    pub points: usize,
    pub latest_ttf: Option<f64>,
    pub transition: Option<DangerTier>,
    /// Tier tracked for the location after this cycle.
    pub tier: Option<DangerTier>,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub succeeded: Vec<(String, LocationOutcome)>,
    pub failed: Vec<(String, Error)>,
}

struct Monitored {
    location: Location,
    notifier: Notifier,
}

pub struct Poller<F, M> {
    fetcher: F,
    gateway: RiskGateway<M>,
    monitored: Vec<Monitored>,
    settings: PollerSettings,
    handle: PollerHandle,
    cycles: u64,
}

impl<F: Fetcher, M: RiskModel> Poller<F, M> {
    /// `notifier` supplies the broker connection; every location gets its own
    /// tier state derived from it.
    pub fn new(
        fetcher: F,
        gateway: RiskGateway<M>,
        locations: Vec<Location>,
        notifier: &Notifier,
        settings: PollerSettings,
    ) -> Self {
        let monitored = locations
            .into_iter()
            .map(|location| {
                let notifier = notifier.for_location(&location);
                debug!(location = %location.name, topic = notifier.topic(), "monitoring location");
                Monitored { notifier, location }
            })
            .collect();
        let (state, _) = watch::channel(PollerState::Stopped);

        Self {
            fetcher,
            gateway,
            monitored,
            settings,
            handle: PollerHandle {
                state: Arc::new(state),
                stop_requested: Arc::new(AtomicBool::new(false)),
            },
            cycles: 0,
        }
    }

    pub fn handle(&self) -> PollerHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> PollerState {
        self.handle.state()
    }

    fn is_running(&self) -> bool {
        self.state() == PollerState::Running
    }

    /// Runs cycles until stopped. Never fails: cycle errors are logged and
    /// the next cycle is attempted after the usual interval.
    pub async fn run(&mut self) {
        if self.handle.stop_requested.load(Ordering::SeqCst) {
            info!("stop requested before start, not polling");
            return;
        }
        self.handle.state.send_replace(PollerState::Running);
        // A stop racing the line above must win.
        if self.handle.stop_requested.load(Ordering::SeqCst) {
            self.handle.state.send_replace(PollerState::Stopped);
        }
        info!(
            interval_secs = self.settings.interval.as_secs(),
            locations = self.monitored.len(),
            "starting scheduled harvester"
        );

        while self.is_running() {
            self.cycles += 1;
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "error in polling cycle");
            }

            if self.is_running() {
                info!(
                    interval_secs = self.settings.interval.as_secs(),
                    "waiting until next update"
                );
                self.sleep_or_stop().await;
            }
        }

        info!(cycles = self.cycles, "scheduled harvester stopped");
    }

    async fn sleep_or_stop(&self) {
        let state = self.handle.state.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(self.settings.interval) => {}
            _ = stopped(state) => {}
        }
    }

    /// One pass over every location.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        if let Some(dir) = &self.settings.output_dir {
            std::fs::create_dir_all(dir)?;
        }

        info!(locations = self.monitored.len(), "starting data fetch cycle");
        let mut report = CycleReport::default();

        for index in 0..self.monitored.len() {
            let name = self.monitored[index].location.name.clone();
            match self.process_location(index).await {
                Ok(outcome) => report.succeeded.push((name, outcome)),
                Err(e) => {
                    warn!(location = %name, error = %e, "skipping location this cycle");
                    report.failed.push((name, e));
                }
            }
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "completed data fetch cycle"
        );
        Ok(report)
    }

    async fn process_location(&mut self, index: usize) -> Result<LocationOutcome> {
        let location = &self.monitored[index].location;

        let set = self
            .fetcher
            .fetch(location, self.settings.horizon_hours)
            .await?;
        if set.is_empty() {
            return Err(Error::EmptyResult(location.name.clone()));
        }

        let series = self.gateway.compute(&set, self.settings.use_cache).await?;
        log_latest(location, &series);

        if let Some(dir) = &self.settings.output_dir {
            if let Err(e) = report::write_location_outputs(dir, location, &set, &series) {
                warn!(location = %location.name, error = %e, "failed to write CSV output");
            }
        }

        let notifier = &mut self.monitored[index].notifier;
        let transition = notifier.notify(&series).await;

        Ok(LocationOutcome {
            points: set.len(),
            latest_ttf: series.latest().map(|p| p.ttf),
            transition,
            tier: notifier.last_tier(),
        })
    }
}

async fn stopped(mut state: watch::Receiver<PollerState>) {
    let _ = state.wait_for(|s| *s == PollerState::Stopped).await;
}

fn log_latest(location: &Location, series: &RiskSeries) {
    if let Some(latest) = series.latest() {
        info!(
            location = %location.name,
            ttf = latest.ttf,
            tier = %DangerTier::classify(latest.ttf),
            "fire risk updated"
        );
    }
}
