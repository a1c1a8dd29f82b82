//! Instance watchdog cycle.
//!
//! Each cycle checks the next instance in the rotation: find its local
//! processes, probe each one's status endpoint, and kill the ones that stopped
//! answering. The supervising restart script only restarts processes that have
//! exited, so a hung process has to be turned into an exited one.

use crate::config::WatchdogConfig;
use crate::naming::{self, InstanceIdentity, Rotation};
use crate::notify::AlertThrottler;
use crate::probe::Prober;
use crate::process::{self, ProcessError, ProcessTable, Terminator};
use crate::recovery;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Timing state carried from one cycle to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogState {
    /// Set when a cycle completes; gates the next one.
    pub last_check_at: Option<DateTime<Utc>>,
    /// Starts at watchdog startup: an instance is assumed healthy at boot.
    pub last_good_response_at: DateTime<Utc>,
    pub last_observed_api_port: u16,
    pub last_notification_at: Option<DateTime<Utc>>,
}

impl WatchdogState {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            last_check_at: None,
            last_good_response_at: started_at,
            last_observed_api_port: 0,
            last_notification_at: None,
        }
    }
}

/// Resolved settings for the watchdog.
#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    /// Checking is off (disabled in config, or we are a child process).
    pub enabled: bool,
    pub debug: bool,
    pub app_dir: PathBuf,
    pub project_name: String,
    /// Our own log file, absolute.
    pub logfile: PathBuf,
    pub rotation: Rotation,
    pub check_interval: chrono::Duration,
    pub assume_crashed_after: chrono::Duration,
}

impl WatchdogSettings {
    /// `force_monitor` switches on checking in monitor rotation regardless of
    /// config; child processes never check.
    pub fn from_config(config: &WatchdogConfig, force_monitor: bool, is_child: bool) -> Self {
        let app_dir = config.app_dir();
        let rotation = if force_monitor {
            Rotation::Monitor {
                suffix: config.check.monitoring_instance_dir_suffix.clone(),
            }
        } else {
            Rotation::Fleet {
                instance_count: config.check.fleet_instance_count,
            }
        };
        Self {
            enabled: (config.check.enabled || force_monitor) && !is_child,
            debug: config.debug,
            logfile: app_dir.join(&config.instance.logfile),
            app_dir,
            project_name: config.instance.project_name.clone(),
            rotation,
            check_interval: secs(config.check.check_interval_secs),
            assume_crashed_after: secs(config.check.assume_crashed_after_mins.saturating_mul(60)),
        }
    }
}

fn secs(value: u64) -> chrono::Duration {
    let max = i64::MAX / 1000;
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(max).min(max))
}

/// What a cycle did, mainly for logging and tests.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// The cycle did nothing: disabled, or the check interval has not passed.
    pub skipped: bool,
    /// Instance that was checked.
    pub target: Option<String>,
    pub killed: Vec<u32>,
    pub responsive: Vec<u32>,
    pub copied_logs: Vec<PathBuf>,
    /// Delivery tasks of alerts dispatched this cycle.
    pub alerts: Vec<JoinHandle<()>>,
}

/// Checks the next instance of the fleet on every call to [`Watchdog::process`].
///
/// `process` takes `&mut self`, so cycles can never overlap.
pub struct Watchdog {
    settings: WatchdogSettings,
    state: WatchdogState,
    processes: Arc<dyn ProcessTable>,
    terminator: Arc<dyn Terminator>,
    prober: Prober,
    alerts: AlertThrottler,
    own_pid: u32,
    warned_unnamed: bool,
    /// Alert deliveries started by earlier cycles that may still be running.
    pending_alerts: Vec<JoinHandle<()>>,
}

impl Watchdog {
    pub fn new(
        settings: WatchdogSettings,
        processes: Arc<dyn ProcessTable>,
        terminator: Arc<dyn Terminator>,
        prober: Prober,
        alerts: AlertThrottler,
    ) -> Self {
        Self {
            settings,
            state: WatchdogState::new(Utc::now()),
            processes,
            terminator,
            prober,
            alerts,
            own_pid: std::process::id(),
            warned_unnamed: false,
            pending_alerts: Vec::new(),
        }
    }

    /// Replace the initial state (e.g. to backdate startup).
    #[cfg(test)]
    pub fn with_state(mut self, state: WatchdogState) -> Self {
        self.state = state;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> &WatchdogState {
        &self.state
    }

    /// Run one cycle. Never fails: errors end the current cycle and are logged.
    ///
    /// Alerts are delivered in the background; call [`Watchdog::flush_alerts`]
    /// before the runtime shuts down.
    pub async fn process(&mut self) {
        let mut report = self.process_at(Utc::now()).await;
        if !report.skipped {
            debug!(
                instance = ?report.target,
                killed = ?report.killed,
                responsive = ?report.responsive,
                copied_logs = ?report.copied_logs,
                alerts = report.alerts.len(),
                "instance check finished"
            );
        }
        self.pending_alerts.retain(|handle| !handle.is_finished());
        self.pending_alerts.append(&mut report.alerts);
    }

    /// Wait up to `limit` for alert deliveries still in flight.
    pub async fn flush_alerts(&mut self, limit: Duration) {
        let pending = std::mem::take(&mut self.pending_alerts);
        if pending.is_empty() {
            return;
        }
        let count = pending.len();
        let deliveries = async {
            for handle in pending {
                if let Err(e) = handle.await {
                    error!(error = %e, "alert delivery task failed");
                }
            }
        };
        if tokio::time::timeout(limit, deliveries).await.is_err() {
            warn!(count, "gave up waiting for alert delivery");
        }
    }

    pub async fn process_at(&mut self, now: DateTime<Utc>) -> CycleReport {
        if !self.settings.enabled {
            return CycleReport {
                skipped: true,
                ..CycleReport::default()
            };
        }
        match self.check_instances(now).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "error checking instances");
                CycleReport::default()
            }
        }
    }

    async fn check_instances(&mut self, now: DateTime<Utc>) -> Result<CycleReport, ProcessError> {
        if let Some(last) = self.state.last_check_at {
            let too_early = last
                .checked_add_signed(self.settings.check_interval)
                .map_or(true, |next| now < next);
            if too_early {
                return Ok(CycleReport {
                    skipped: true,
                    ..CycleReport::default()
                });
            }
        }

        let mut report = CycleReport::default();
        let Some(own) = self.own_instance() else {
            self.state.last_check_at = Some(now);
            return Ok(report);
        };
        let target = naming::next_instance_name(&own.name, &self.settings.rotation);
        if target.is_empty() {
            debug!(own = %own.name, "no next instance to monitor");
            self.state.last_check_at = Some(now);
            return Ok(report);
        }
        debug!(own = %own.name, role = ?own.role, instance = %target, "next instance to check");

        let target_dir = naming::instance_dir(&own, &target);
        let pids =
            process::find_candidate_pids(self.processes.as_ref(), &target_dir, self.own_pid)
                .await?;
        for pid in pids {
            self.check_pid(&target, pid, now, &mut report).await;
        }

        self.check_last_response(&target, now, &mut report);
        self.state.last_check_at = Some(now);
        report.target = Some(target);
        Ok(report)
    }

    fn own_instance(&mut self) -> Option<InstanceIdentity> {
        let own = naming::own_instance(
            &self.settings.app_dir,
            &self.settings.project_name,
            self.settings.rotation.role(),
        );
        if own.is_none() && !self.warned_unnamed && !self.settings.debug {
            warn!(
                app_dir = %self.settings.app_dir.display(),
                project_name = %self.settings.project_name,
                "unable to get next instance to monitor"
            );
            self.warned_unnamed = true;
        }
        own
    }

    async fn check_pid(
        &mut self,
        target: &str,
        pid: u32,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let outcome = match self.prober.is_responsive(target).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(instance = target, pid, error = %e, "error checking if instance api is responsive");
                return;
            }
        };
        self.state.last_observed_api_port = outcome.port;

        if outcome.responsive {
            debug!(instance = target, pid, "instance is running");
            self.state.last_good_response_at = now;
            report.responsive.push(pid);
            return;
        }

        let msg = format!(
            "Killing possibly stuck process: PID {pid}, last response {}",
            format_elapsed(now - self.state.last_good_response_at)
        );
        warn!(instance = target, pid, port = outcome.port, "{msg}");
        if let Some(handle) = self.alerts.notify_kill(
            &mut self.state.last_notification_at,
            target,
            "is unresponsive",
            &msg,
            now,
        ) {
            report.alerts.push(handle);
        }
        self.terminator.terminate(pid);
        report.killed.push(pid);
        if let Some(copy) =
            recovery::copy_logfile(&self.settings.logfile, &self.settings.project_name, target)
        {
            report.copied_logs.push(copy);
        }
    }

    /// Alert when the target has not answered for too long, even if no process
    /// was found: it may be failing before it ever starts listening.
    fn check_last_response(&mut self, target: &str, now: DateTime<Utc>, report: &mut CycleReport) {
        if self.settings.debug {
            return;
        }
        let silent_for = now - self.state.last_good_response_at;
        if silent_for <= self.settings.assume_crashed_after {
            return;
        }
        let msg = format!(
            "Last response: {}\nPort: {}",
            format_elapsed(silent_for),
            self.state.last_observed_api_port
        );
        info!(instance = target, "instance has not responded for too long");
        if let Some(handle) = self.alerts.notify_kill(
            &mut self.state.last_notification_at,
            target,
            "is not starting",
            &msg,
            now,
        ) {
            report.alerts.push(handle);
        }
    }
}

/// Human-readable elapsed time, two most significant units (e.g. `2 h 5 min`).
pub fn format_elapsed(elapsed: chrono::Duration) -> String {
    let total = elapsed.num_seconds().max(0);
    let (days, hours, mins, secs) = (
        total / 86_400,
        total % 86_400 / 3_600,
        total % 3_600 / 60,
        total % 60,
    );
    if days > 0 {
        format!("{days} d {hours} h")
    } else if hours > 0 {
        format!("{hours} h {mins} min")
    } else if mins > 0 {
        format!("{mins} min {secs} sec")
    } else {
        format!("{secs} sec")
    }
}
