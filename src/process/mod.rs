//! Encoder process supervision
//!
//! Each channel gets at most one encoder task. The task owns the child
//! process: it retries failed launches, starts the stderr scanner, waits for
//! exit and records how the process ended. Exits are only recorded and
//! reported here; deciding what to do about them belongs to the registry.

pub mod command;
pub mod diagnostics;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{DIAGNOSTIC_TAIL_LINES, STOP_JOIN_SLACK};
use crate::error::LaunchError;
pub use command::{ProcessCommand, encoder_command};
use diagnostics::{FatalPatternMatcher, scan_stderr};

/// Launch retry budget: `attempts` retries after the first failure, `delay` apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// Graceful terminate window before the child is killed
    pub stop_grace: Duration,
    /// How long stderr is classified after launch
    pub diagnostic_warmup: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            diagnostic_warmup: Duration::from_secs(5),
        }
    }
}

/// How an encoder ended
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitRecord {
    pub code: Option<i32>,
    /// Stop was requested by the user
    pub expected: bool,
    pub exited_at: DateTime<Utc>,
    /// Last diagnostic lines before the exit
    pub diagnostics: Vec<String>,
}

/// Encoder side of the facts the state machine works from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderFacts {
    Idle,
    Launching { attempt: u32 },
    Running { pid: Option<u32>, diagnostic_fault: bool },
    /// Exit recorded, not yet consumed by reconciliation
    Exited,
}

/// Asynchronous outcomes sent to the registry
#[derive(Debug, Clone)]
pub enum ProcessReport {
    Launched { channel: String, pid: Option<u32>, attempts: u32 },
    LaunchRetry { channel: String, attempt: u32, max: u32, error: String },
    LaunchFailed { channel: String, attempts: u32, error: String },
    DiagnosticFault { channel: String, line: String },
    Exited { channel: String, code: Option<i32>, expected: bool },
}

#[derive(Debug, Clone, Default)]
enum Phase {
    #[default]
    Launching,
    Retrying(u32),
    Running(Option<u32>),
    Exited(ExitRecord),
    /// Launch budget exhausted or cancelled before a process existed
    Abandoned,
}

#[derive(Default)]
pub(crate) struct EncoderShared {
    phase: Mutex<Phase>,
    user_initiated: AtomicBool,
    fault: Mutex<Option<String>>,
    tail: Mutex<VecDeque<String>>,
}

impl EncoderShared {
    fn set_phase(&self, phase: Phase) {
        *lock(&self.phase) = phase;
    }

    fn phase(&self) -> Phase {
        lock(&self.phase).clone()
    }

    pub(crate) fn push_diagnostic(&self, line: &str) {
        let mut tail = lock(&self.tail);
        if tail.len() == DIAGNOSTIC_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }

    pub(crate) fn diagnostics(&self) -> Vec<String> {
        lock(&self.tail).iter().cloned().collect()
    }

    pub(crate) fn set_fault(&self, line: &str) {
        lock(&self.fault).get_or_insert_with(|| line.to_string());
    }

    pub(crate) fn fault(&self) -> Option<String> {
        lock(&self.fault).clone()
    }
}

struct EncoderEntry {
    shared: Arc<EncoderShared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// A stop owns this entry; reconciliation must leave it alone
    stopping: bool,
}

type EncoderMap = Arc<Mutex<HashMap<String, EncoderEntry>>>;

pub struct ProcessSupervisor {
    encoders: EncoderMap,
    reports: UnboundedSender<ProcessReport>,
    settings: SupervisorSettings,
    matcher: Arc<FatalPatternMatcher>,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings, reports: UnboundedSender<ProcessReport>) -> Self {
        Self {
            encoders: Arc::new(Mutex::new(HashMap::new())),
            reports,
            settings,
            matcher: Arc::new(FatalPatternMatcher::default()),
        }
    }

    /// Spawn the encoder task for `channel`; the outcome arrives as [`ProcessReport`]s.
    /// A previous exit that was never collected is discarded.
    pub fn start(
        &self,
        channel: &str,
        command: ProcessCommand,
        retry: RetryPolicy,
    ) -> Result<(), LaunchError> {
        let mut encoders = lock(&self.encoders);
        if let Some(existing) = encoders.get(channel) {
            match existing.shared.phase() {
                Phase::Exited(_) | Phase::Abandoned if !existing.stopping => {
                    debug!(channel, "discarding uncollected encoder exit");
                }
                _ => return Err(LaunchError::AlreadyActive(channel.to_string())),
            }
        }

        let shared = Arc::new(EncoderShared::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_encoder(EncoderTask {
            channel: channel.to_string(),
            command,
            retry,
            settings: self.settings,
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
            matcher: Arc::clone(&self.matcher),
            reports: self.reports.clone(),
            encoders: Arc::clone(&self.encoders),
        }));
        encoders.insert(
            channel.to_string(),
            EncoderEntry {
                shared,
                cancel,
                task: Some(task),
                stopping: false,
            },
        );
        Ok(())
    }

    /// Terminate the encoder and release its handle. The intent flag is set before
    /// the terminate signal so the exit is recorded as expected when `user_initiated`.
    /// Returns how the process ended, `None` if nothing was tracked for `channel`.
    pub async fn stop(&self, channel: &str, user_initiated: bool) -> Option<ExitRecord> {
        let (shared, cancel, task) = {
            let mut encoders = lock(&self.encoders);
            let entry = encoders.get_mut(channel)?;
            entry.stopping = true;
            entry.shared.user_initiated.store(user_initiated, Ordering::SeqCst);
            (Arc::clone(&entry.shared), entry.cancel.clone(), entry.task.take())
        };
        info!(channel, user_initiated, "stopping encoder");
        cancel.cancel();

        if let Some(mut task) = task {
            let bound = self.settings.stop_grace + STOP_JOIN_SLACK;
            if timeout(bound, &mut task).await.is_err() {
                warn!(channel, "encoder task did not finish within {bound:?}, aborting");
                task.abort();
                let _ = task.await;
            }
        }
        remove_entry(&self.encoders, channel, &shared);

        match shared.phase() {
            Phase::Exited(record) => Some(record),
            _ => Some(ExitRecord {
                code: None,
                expected: user_initiated,
                exited_at: Utc::now(),
                diagnostics: shared.diagnostics(),
            }),
        }
    }

    pub async fn stop_all(&self, user_initiated: bool) {
        for channel in self.channels() {
            self.stop(&channel, user_initiated).await;
        }
    }

    /// Hand over an exit that no stop is waiting for. Each exit is returned once.
    pub fn take_exit(&self, channel: &str) -> Option<ExitRecord> {
        let mut encoders = lock(&self.encoders);
        let record = encoders
            .get(channel)
            .filter(|entry| !entry.stopping)
            .and_then(|entry| match entry.shared.phase() {
                Phase::Exited(record) => Some(record),
                _ => None,
            })?;
        encoders.remove(channel);
        Some(record)
    }

    /// Record an exit for every task that ended without recording one (panicked
    /// or aborted). Returns the affected channels.
    pub fn sweep(&self) -> Vec<String> {
        let encoders = lock(&self.encoders);
        let mut swept = Vec::new();
        for (channel, entry) in encoders.iter() {
            let finished = entry.task.as_ref().is_some_and(|task| task.is_finished());
            if !finished || entry.stopping {
                continue;
            }
            if matches!(entry.shared.phase(), Phase::Launching | Phase::Retrying(_) | Phase::Running(_)) {
                error!(channel = %channel, "encoder task ended without recording an exit");
                entry.shared.set_phase(Phase::Exited(ExitRecord {
                    code: None,
                    expected: false,
                    exited_at: Utc::now(),
                    diagnostics: entry.shared.diagnostics(),
                }));
                swept.push(channel.clone());
            }
        }
        swept
    }

    pub fn facts(&self, channel: &str) -> EncoderFacts {
        let encoders = lock(&self.encoders);
        let Some(entry) = encoders.get(channel) else {
            return EncoderFacts::Idle;
        };
        match entry.shared.phase() {
            Phase::Launching => EncoderFacts::Launching { attempt: 0 },
            Phase::Retrying(attempt) => EncoderFacts::Launching { attempt },
            Phase::Running(pid) => EncoderFacts::Running {
                pid,
                diagnostic_fault: entry.shared.fault().is_some(),
            },
            Phase::Exited(_) => EncoderFacts::Exited,
            Phase::Abandoned => EncoderFacts::Idle,
        }
    }

    pub fn is_running(&self, channel: &str) -> bool {
        matches!(self.facts(channel), EncoderFacts::Running { .. })
    }

    /// Launching or running
    pub fn is_active(&self, channel: &str) -> bool {
        matches!(
            self.facts(channel),
            EncoderFacts::Launching { .. } | EncoderFacts::Running { .. }
        )
    }

    pub fn diagnostic_fault(&self, channel: &str) -> Option<String> {
        lock(&self.encoders).get(channel).and_then(|entry| entry.shared.fault())
    }

    pub fn channels(&self) -> Vec<String> {
        lock(&self.encoders).keys().cloned().collect()
    }
}

struct EncoderTask {
    channel: String,
    command: ProcessCommand,
    retry: RetryPolicy,
    settings: SupervisorSettings,
    shared: Arc<EncoderShared>,
    cancel: CancellationToken,
    matcher: Arc<FatalPatternMatcher>,
    reports: UnboundedSender<ProcessReport>,
    encoders: EncoderMap,
}

async fn run_encoder(task: EncoderTask) {
    let EncoderTask {
        channel,
        command,
        retry,
        settings,
        shared,
        cancel,
        matcher,
        reports,
        encoders,
    } = task;

    let mut retries = 0u32;
    let mut child = loop {
        info!(
            channel = %channel,
            attempt = retries + 1,
            of = retry.attempts + 1,
            "starting encoder: {command}"
        );
        match command.to_command().spawn() {
            Ok(child) => break child,
            Err(err) => {
                let err = LaunchError::from_spawn(&command.program, err);
                if retries >= retry.attempts {
                    error!(
                        channel = %channel,
                        error = %err,
                        "ALARM: encoder failed to start after {} attempts, manual intervention required",
                        retries + 1
                    );
                    shared.set_phase(Phase::Abandoned);
                    remove_entry(&encoders, &channel, &shared);
                    let _ = reports.send(ProcessReport::LaunchFailed {
                        channel,
                        attempts: retries + 1,
                        error: err.to_string(),
                    });
                    return;
                }
                retries += 1;
                warn!(
                    channel = %channel,
                    error = %err,
                    "encoder launch failed, retry {retries}/{} in {:?}",
                    retry.attempts,
                    retry.delay
                );
                shared.set_phase(Phase::Retrying(retries));
                let _ = reports.send(ProcessReport::LaunchRetry {
                    channel: channel.clone(),
                    attempt: retries,
                    max: retry.attempts,
                    error: err.to_string(),
                });
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(channel = %channel, "launch retry cancelled");
                        shared.set_phase(Phase::Abandoned);
                        return;
                    }
                    _ = sleep(retry.delay) => {}
                }
            }
        }
    };

    let pid = child.id();
    shared.set_phase(Phase::Running(pid));
    info!(channel = %channel, pid = ?pid, "encoder running");
    let _ = reports.send(ProcessReport::Launched {
        channel: channel.clone(),
        pid,
        attempts: retries + 1,
    });

    let scanner = child.stderr.take().map(|stderr| {
        tokio::spawn(scan_stderr(
            channel.clone(),
            stderr,
            settings.diagnostic_warmup,
            matcher,
            Arc::clone(&shared),
            reports.clone(),
        ))
    });

    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => terminate(&mut child, settings.stop_grace, &channel).await,
    };

    // stderr hits EOF once the process is gone unless a grandchild still holds it
    if let Some(mut scanner) = scanner {
        if timeout(Duration::from_secs(1), &mut scanner).await.is_err() {
            scanner.abort();
        }
    }

    let code = match &status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(channel = %channel, error = %err, "failed to collect encoder exit status");
            None
        }
    };
    let expected = shared.user_initiated.load(Ordering::SeqCst);
    if expected {
        info!(channel = %channel, code = ?code, "encoder stopped");
    } else {
        warn!(channel = %channel, code = ?code, "encoder exited unexpectedly");
    }
    shared.set_phase(Phase::Exited(ExitRecord {
        code,
        expected,
        exited_at: Utc::now(),
        diagnostics: shared.diagnostics(),
    }));
    let _ = reports.send(ProcessReport::Exited {
        channel,
        code,
        expected,
    });
}

/// Graceful terminate, then kill once `grace` has passed
pub(crate) async fn terminate(
    child: &mut Child,
    grace: Duration,
    channel: &str,
) -> io::Result<ExitStatus> {
    request_terminate(child);
    match timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(channel, "process did not exit within {grace:?}, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn request_terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        let _ = child.start_kill();
        return;
    };
    // SAFETY: `pid` is our own child and has not been reaped (`id()` returned Some)
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

/// Remove `channel` only if the entry still belongs to `shared`
fn remove_entry(encoders: &EncoderMap, channel: &str, shared: &Arc<EncoderShared>) {
    let mut encoders = lock(encoders);
    if encoders
        .get(channel)
        .is_some_and(|entry| Arc::ptr_eq(&entry.shared, shared))
    {
        encoders.remove(channel);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    fn supervisor(grace: Duration) -> (ProcessSupervisor, UnboundedReceiver<ProcessReport>) {
        let (tx, rx) = unbounded_channel();
        let settings = SupervisorSettings {
            stop_grace: grace,
            diagnostic_warmup: Duration::from_secs(5),
        };
        (ProcessSupervisor::new(settings, tx), rx)
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 0,
            delay: Duration::ZERO,
        }
    }

    #[cfg(unix)]
    fn shell(script: &str) -> ProcessCommand {
        ProcessCommand::new("sh").arg("-c").arg(script)
    }

    async fn next_report(rx: &mut UnboundedReceiver<ProcessReport>) -> ProcessReport {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("report within 10s")
            .expect("report channel open")
    }

    #[tokio::test]
    async fn launch_retries_then_fails_once() {
        let (supervisor, mut rx) = supervisor(Duration::from_secs(1));
        let started = Instant::now();
        supervisor
            .start(
                "ch1",
                ProcessCommand::new("/nonexistent/encoder-binary"),
                RetryPolicy {
                    attempts: 2,
                    delay: Duration::from_millis(50),
                },
            )
            .unwrap();

        let mut retries = Vec::new();
        let failed = loop {
            match next_report(&mut rx).await {
                ProcessReport::LaunchRetry { attempt, max, .. } => {
                    assert_eq!(max, 2);
                    retries.push(attempt);
                }
                ProcessReport::LaunchFailed { channel, attempts, error } => {
                    assert_eq!(channel, "ch1");
                    assert!(error.contains("not found"), "{error}");
                    break attempts;
                }
                other => panic!("unexpected report {other:?}"),
            }
        };
        assert_eq!(retries, vec![1, 2]);
        assert_eq!(failed, 3);
        assert!(started.elapsed() >= Duration::from_millis(100));

        assert!(!supervisor.is_active("ch1"));
        assert_eq!(supervisor.facts("ch1"), EncoderFacts::Idle);
        sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_start_is_rejected_while_active() {
        let (supervisor, mut rx) = supervisor(Duration::from_secs(1));
        supervisor.start("ch1", shell("exec sleep 30"), no_retry()).unwrap();
        assert!(matches!(next_report(&mut rx).await, ProcessReport::Launched { .. }));

        let err = supervisor.start("ch1", shell("exec sleep 30"), no_retry()).unwrap_err();
        assert!(matches!(err, LaunchError::AlreadyActive(name) if name == "ch1"));
        supervisor.stop("ch1", true).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn user_stop_is_recorded_as_expected() {
        let (supervisor, mut rx) = supervisor(Duration::from_secs(2));
        supervisor.start("ch1", shell("exec sleep 30"), no_retry()).unwrap();
        match next_report(&mut rx).await {
            ProcessReport::Launched { pid, attempts, .. } => {
                assert!(pid.is_some());
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected report {other:?}"),
        }
        assert!(supervisor.is_running("ch1"));

        let started = Instant::now();
        let record = supervisor.stop("ch1", true).await.expect("record");
        assert!(record.expected);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!supervisor.is_running("ch1"));
        assert!(supervisor.channels().is_empty());
        // the stop consumed the exit, reconciliation sees nothing
        assert_eq!(supervisor.take_exit("ch1"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stubborn_process_is_killed_after_grace() {
        let (supervisor, mut rx) = supervisor(Duration::from_millis(200));
        supervisor
            .start("ch1", shell("trap '' TERM; exec sleep 30"), no_retry())
            .unwrap();
        assert!(matches!(next_report(&mut rx).await, ProcessReport::Launched { .. }));

        let started = Instant::now();
        let record = supervisor.stop("ch1", true).await.expect("record");
        assert!(record.expected);
        assert_eq!(record.code, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unexpected_exit_is_taken_once() {
        let (supervisor, mut rx) = supervisor(Duration::from_secs(1));
        supervisor
            .start("ch1", shell("echo 'muxer gave up' >&2; exit 3"), no_retry())
            .unwrap();

        loop {
            if let ProcessReport::Exited { code, expected, .. } = next_report(&mut rx).await {
                assert_eq!(code, Some(3));
                assert!(!expected);
                break;
            }
        }
        assert_eq!(supervisor.facts("ch1"), EncoderFacts::Exited);

        let record = supervisor.take_exit("ch1").expect("exit recorded");
        assert_eq!(record.code, Some(3));
        assert!(!record.expected);
        assert_eq!(record.diagnostics, vec!["muxer gave up".to_string()]);
        assert_eq!(supervisor.take_exit("ch1"), None);
        assert_eq!(supervisor.facts("ch1"), EncoderFacts::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fatal_diagnostic_marks_running_encoder() {
        let (supervisor, mut rx) = supervisor(Duration::from_secs(1));
        supervisor
            .start(
                "ch1",
                shell("echo 'udp://@239.1.1.1:1234: Connection refused' >&2; exec sleep 30"),
                no_retry(),
            )
            .unwrap();

        loop {
            if let ProcessReport::DiagnosticFault { line, .. } = next_report(&mut rx).await {
                assert!(line.contains("Connection refused"));
                break;
            }
        }
        assert!(matches!(
            supervisor.facts("ch1"),
            EncoderFacts::Running { diagnostic_fault: true, .. }
        ));
        assert!(supervisor.diagnostic_fault("ch1").is_some());
        supervisor.stop("ch1", true).await;
    }

    #[tokio::test]
    async fn stop_without_encoder_is_none() {
        let (supervisor, _rx) = supervisor(Duration::from_secs(1));
        assert_eq!(supervisor.stop("ghost", true).await, None);
    }
}
