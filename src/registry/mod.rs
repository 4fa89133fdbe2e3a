//! Channel registry and reconciliation
//!
//! The registry owns every channel and is the only place that publishes
//! status. Per channel there are three locks:
//!
//! * `state`: the record, the published status and the raw flags. Held only
//!   for short, non-blocking sections; status is evaluated and published
//!   under it, which gives a total order of status events per channel.
//! * `ops`: serialises user commands (start, stop, scan, preview, edit).
//! * `port`: exclusive use of the channel's UDP input port, taken by scans
//!   and input previews while the listener is down.
//!
//! Encoder exits are only collected in [`SupervisorRegistry::reconcile`],
//! which runs under its own lock, so a crash leads to at most one restart.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock};
use std::time::Instant;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ChannelStore, RestartPolicy};
use crate::constants::{PREVIEW_TERMINATE_GRACE, STOP_JOIN_SLACK, TASK_SHUTDOWN_TIMEOUT};
use crate::error::{ConfigError, SupervisorError};
use crate::events::{EventBus, Severity, SupervisorEvent};
use crate::preview::{PortGuard, PreviewEndReason, PreviewEnded, PreviewManager, preview_command};
use crate::probe::ProbeRunner;
use crate::process::{
    EncoderFacts, ExitRecord, ProcessReport, ProcessSupervisor, RetryPolicy, SupervisorSettings,
    encoder_command,
};
use crate::resolver::UrlResolver;
use crate::state::{ChannelFacts, ChannelStateMachine, Fault, StatusPolicy, Transition};
use crate::types::{Channel, ChannelSnapshot, InputConfig, InputType, PreviewKind, StreamStatus};
use crate::watcher::{ListenerReading, UdpWatcher};

struct ChannelState {
    channel: Channel,
    machine: ChannelStateMachine,
    probe_in_flight: bool,
    start_pending: bool,
    /// Crash restart scheduled, not launched yet
    restart_pending: bool,
    /// Automatic restarts since the last user start
    restarts: u32,
    /// Encoder being stopped because its UDP input went silent
    input_loss_stop: bool,
    /// Exit of that stop, collected by the next reconciliation
    stopped_exit: Option<ExitRecord>,
    fault: Option<Fault>,
    last_scan_ok: Option<Instant>,
    removed: bool,
}

impl ChannelState {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            machine: ChannelStateMachine::new(),
            probe_in_flight: false,
            start_pending: false,
            restart_pending: false,
            restarts: 0,
            input_loss_stop: false,
            stopped_exit: None,
            fault: None,
            last_scan_ok: None,
            removed: false,
        }
    }
}

struct ChannelSlot {
    state: Mutex<ChannelState>,
    ops: Mutex<()>,
    port: Arc<Mutex<()>>,
}

impl ChannelSlot {
    fn new(channel: Channel) -> Self {
        Self {
            state: Mutex::new(ChannelState::new(channel)),
            ops: Mutex::new(()),
            port: Arc::new(Mutex::new(())),
        }
    }
}

type Receivers = (UnboundedReceiver<ProcessReport>, UnboundedReceiver<PreviewEnded>);

pub struct SupervisorRegistry {
    config: AppConfig,
    policy: StatusPolicy,
    store_path: Option<PathBuf>,
    channels: RwLock<BTreeMap<String, Arc<ChannelSlot>>>,
    watcher: UdpWatcher,
    processes: ProcessSupervisor,
    prober: ProbeRunner,
    resolver: UrlResolver,
    preview: PreviewManager,
    events: EventBus,
    wake: Notify,
    reconcile_lock: Mutex<()>,
    persist_lock: Mutex<()>,
    shutdown: CancellationToken,
    receivers: StdMutex<Option<Receivers>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SupervisorRegistry {
    /// Nothing runs until [`start`](Self::start); channels are persisted to
    /// `store_path` when one is given.
    pub fn new(config: AppConfig, store: ChannelStore, store_path: Option<PathBuf>) -> Arc<Self> {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (preview_tx, preview_rx) = mpsc::unbounded_channel();
        let settings = SupervisorSettings {
            stop_grace: config.stop_grace(),
            diagnostic_warmup: config.diagnostic_warmup(),
        };
        let channels = store
            .into_channels()
            .into_iter()
            .map(|channel| (channel.name.clone(), Arc::new(ChannelSlot::new(channel))))
            .collect();

        Arc::new(Self {
            policy: StatusPolicy {
                udp_packet_timeout: config.udp_packet_timeout(),
            },
            store_path,
            channels: RwLock::new(channels),
            watcher: UdpWatcher::new(),
            processes: ProcessSupervisor::new(settings, report_tx),
            prober: ProbeRunner::new(&config.ffprobe_path),
            resolver: UrlResolver::new(&config.resolver_path),
            preview: PreviewManager::new(config.preview_auto_stop(), preview_tx),
            events: EventBus::default(),
            wake: Notify::new(),
            reconcile_lock: Mutex::new(()),
            persist_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            receivers: StdMutex::new(Some((report_rx, preview_rx))),
            tasks: StdMutex::new(Vec::new()),
            config,
        })
    }

    /// Load both configuration files, creating them with defaults when absent
    pub fn load(config_path: &Path, channels_path: &Path) -> Result<Arc<Self>, ConfigError> {
        let config = AppConfig::load_or_init(config_path)?;
        let store = ChannelStore::load_or_init(channels_path, config.default_channels_count)?;
        Ok(Self::new(config, store, Some(channels_path.to_path_buf())))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Bind listeners for every UDP channel, start the background loops and
    /// resume channels that were streaming when the state was last saved.
    pub async fn start(self: &Arc<Self>) {
        let Some((reports, previews)) = lock(&self.receivers).take() else {
            warn!("supervisor already started");
            return;
        };
        info!(channels = self.slots().len(), "starting supervisor");

        for (name, slot) in self.slots() {
            let mut state = slot.state.lock().await;
            self.ensure_listener(&name, &mut state);
            self.publish_status(&name, &mut state);
        }

        let tasks = vec![
            tokio::spawn(Arc::clone(self).reconcile_loop()),
            tokio::spawn(Arc::clone(self).liveness_loop()),
            tokio::spawn(Arc::clone(self).pump(reports, previews)),
        ];
        lock(&self.tasks).extend(tasks);

        for (name, slot) in self.slots() {
            let resume = slot.state.lock().await.channel.last_known_streaming_state;
            if !resume {
                continue;
            }
            info!(channel = %name, "resuming channel that was streaming before");
            match self.start_channel(&name).await {
                Ok(()) => self
                    .events
                    .notify(Some(name.as_str()), Severity::Info, "resuming stream from the previous session"),
                Err(err) => {
                    warn!(channel = %name, error = %err, "auto-resume failed");
                    self.events
                        .notify(Some(name.as_str()), Severity::Warning, format!("auto-resume failed: {err}"));
                }
            }
        }
    }

    /// Persist, stop every encoder, every listener and the preview, in that
    /// order. Each step runs regardless of earlier failures.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("shutting down supervisor");
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for mut task in tasks {
            if timeout(TASK_SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }

        for (name, slot) in self.slots() {
            let mut state = slot.state.lock().await;
            let live = self.processes.is_active(&name) || state.start_pending || state.restart_pending;
            state.channel.last_known_streaming_state = live && !state.removed;
        }
        if let Err(err) = self.save_config().await {
            error!(error = %err, "failed to persist channels during shutdown");
        }
        self.processes.stop_all(true).await;
        self.watcher.stop_all().await;
        self.preview.stop().await;
        info!("supervisor stopped");
    }

    pub async fn add_channel(&self, mut channel: Channel) -> Result<(), SupervisorError> {
        self.ensure_running()?;
        if channel.display_name.trim().is_empty() {
            channel.display_name = channel.name.clone();
        }
        channel.status = StreamStatus::Unknown;
        let name = channel.name.clone();

        let slot = {
            let mut channels = write(&self.channels);
            if channels.contains_key(&name) {
                return Err(SupervisorError::DuplicateChannel(name));
            }
            let slot = Arc::new(ChannelSlot::new(channel));
            channels.insert(name.clone(), Arc::clone(&slot));
            slot
        };
        info!(channel = %name, "channel added");

        if self.is_started() {
            let mut state = slot.state.lock().await;
            self.ensure_listener(&name, &mut state);
            self.publish_status(&name, &mut state);
        }
        self.persist().await;
        Ok(())
    }

    /// Force-stop everything the channel owns, then forget it
    pub async fn remove_channel(&self, name: &str) -> Result<(), SupervisorError> {
        let slot = self.slot(name)?;
        let _ops = slot.ops.lock().await;
        {
            let mut state = slot.state.lock().await;
            state.removed = true;
            state.start_pending = false;
            state.restart_pending = false;
        }

        if self.preview.active().await.is_some_and(|(active, _)| active == name) {
            self.preview.stop().await;
        }
        if let Some(record) = self.processes.stop(name, true).await {
            self.publish_exit(name, &record);
        }
        self.watcher.stop(name).await;
        write(&self.channels).remove(name);
        info!(channel = name, "channel removed");
        self.persist().await;
        Ok(())
    }

    /// Commit an edited copy of a channel. The listener follows UDP
    /// addressing changes, and a UDP input whose address changed is rescanned.
    pub async fn update_channel(self: &Arc<Self>, name: &str, edit: Channel) -> Result<(), SupervisorError> {
        self.ensure_running()?;
        let slot = self.slot(name)?;
        let rescan = {
            let _ops = slot.ops.lock().await;
            let (before, after) = {
                let mut state = slot.state.lock().await;
                let before = state.channel.input.clone();
                if !edit.display_name.trim().is_empty() {
                    state.channel.display_name = edit.display_name;
                }
                state.channel.input = edit.input;
                state.channel.output = edit.output;
                state.fault = None;
                (before, state.channel.input.clone())
            };
            let changed = before.listener_differs(&after);
            info!(channel = name, listener_changed = changed, "channel configuration saved");

            // a scan or preview holding the port restores the listener itself
            let port_free = slot.port.try_lock().is_ok();
            let manage_listener = self.is_started() && port_free;
            if manage_listener && before.input_type == InputType::Udp && (changed || after.input_type != InputType::Udp) {
                self.watcher.stop(name).await;
            }
            let mut state = slot.state.lock().await;
            if manage_listener {
                self.ensure_listener(name, &mut state);
            }
            self.publish_status(name, &mut state);

            manage_listener
                && changed
                && after.input_type == InputType::Udp
                && after.has_usable_source()
                && !self.processes.is_active(name)
        };
        self.persist().await;

        if rescan {
            if let Err(err) = self.scan_channel(name).await {
                debug!(channel = name, error = %err, "rescan after edit skipped");
            }
        }
        Ok(())
    }

    /// Write every channel to the store file
    pub async fn save_config(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };
        let _write = self.persist_lock.lock().await;
        let mut channels = Vec::new();
        for (_, slot) in self.slots() {
            channels.push(slot.state.lock().await.channel.clone());
        }
        ChannelStore::from_channels(channels).save(path)
    }

    /// Accept a start: the channel shows `starting` at once while the input
    /// is resolved and the encoder launched in the background.
    pub async fn start_channel(self: &Arc<Self>, name: &str) -> Result<(), SupervisorError> {
        self.ensure_running()?;
        let slot = self.slot(name)?;
        let _ops = slot.ops.lock().await;

        let input = slot.state.lock().await.channel.input.clone();
        if let Some((ip, port)) = input.udp_endpoint() {
            if let Some(other) = self.udp_owner(name, ip, port).await {
                warn!(channel = name, other = %other, "UDP input {ip}:{port} already in use");
                return Err(SupervisorError::ConfigConflict {
                    ip: ip.to_string(),
                    port,
                    other,
                });
            }
        }
        if self.processes.is_active(name) {
            return Err(SupervisorError::AlreadyActive(name.to_string()));
        }

        let mut state = slot.state.lock().await;
        if state.probe_in_flight {
            return Err(SupervisorError::ChannelBusy(name.to_string()));
        }
        if state.start_pending {
            return Err(SupervisorError::AlreadyActive(name.to_string()));
        }
        if !state.channel.input.has_usable_source() {
            return Err(SupervisorError::MissingInput(name.to_string()));
        }
        if state.channel.output.url().is_empty() {
            return Err(SupervisorError::MissingOutput(name.to_string()));
        }
        if self.processes.take_exit(name).is_some() {
            debug!(channel = name, "dropping encoder exit superseded by a new start");
        }

        state.fault = None;
        state.start_pending = true;
        state.restart_pending = false;
        state.stopped_exit = None;
        state.restarts = 0;
        self.publish_status(name, &mut state);
        drop(state);

        info!(channel = name, "start requested");
        let this = Arc::clone(self);
        let channel = name.to_string();
        self.spawn_guarded(name, "launch", async move { this.launch_encoder(&channel).await });
        Ok(())
    }

    /// Stop the encoder on user request. The listener keeps running.
    pub async fn stop_channel(&self, name: &str) -> Result<(), SupervisorError> {
        let slot = self.slot(name)?;
        let _ops = slot.ops.lock().await;
        {
            let mut state = slot.state.lock().await;
            state.start_pending = false;
            state.restart_pending = false;
            state.stopped_exit = None;
            state.fault = None;
            state.channel.last_known_streaming_state = false;
        }
        match self.processes.stop(name, true).await {
            Some(record) => self.publish_exit(name, &record),
            None => debug!(channel = name, "no encoder to stop"),
        }
        self.refresh(name).await;
        self.persist().await;
        Ok(())
    }

    /// Probe the channel's input for programs. The channel shows `scanning`
    /// until the probe completes; a UDP listener is parked for the duration.
    pub async fn scan_channel(self: &Arc<Self>, name: &str) -> Result<(), SupervisorError> {
        self.ensure_running()?;
        let slot = self.slot(name)?;
        let _ops = slot.ops.lock().await;
        if self.processes.is_active(name) {
            return Err(SupervisorError::AlreadyActive(name.to_string()));
        }

        let mut state = slot.state.lock().await;
        if state.probe_in_flight {
            return Err(SupervisorError::ChannelBusy(name.to_string()));
        }
        if !state.channel.input.has_usable_source() {
            return Err(SupervisorError::MissingInput(name.to_string()));
        }
        let port = if state.channel.input.input_type == InputType::Udp {
            let guard = Arc::clone(&slot.port)
                .try_lock_owned()
                .map_err(|_| SupervisorError::PortBusy(name.to_string()))?;
            Some(guard)
        } else {
            None
        };
        state.probe_in_flight = true;
        state.fault = None;
        self.publish_status(name, &mut state);
        let input = state.channel.input.clone();
        drop(state);

        if port.is_some() {
            self.watcher.stop(name).await;
        }
        info!(channel = name, url = %input.url(), "scanning input for services");
        let this = Arc::clone(self);
        let channel = name.to_string();
        self.spawn_guarded(name, "scan", async move { this.run_scan(&channel, input, port).await });
        Ok(())
    }

    /// Open the preview player on one side of a channel, replacing any running preview
    pub async fn start_preview(&self, name: &str, kind: PreviewKind) -> Result<(), SupervisorError> {
        self.ensure_running()?;
        let slot = self.slot(name)?;
        let _ops = slot.ops.lock().await;
        let (channel, probing) = {
            let state = slot.state.lock().await;
            (state.channel.clone(), state.probe_in_flight)
        };

        let url = match kind {
            PreviewKind::Input => {
                if probing {
                    return Err(SupervisorError::ChannelBusy(name.to_string()));
                }
                let source = channel.input.url();
                if source.is_empty() {
                    return Err(SupervisorError::MissingInput(name.to_string()));
                }
                if channel.input.input_type == InputType::YouTube {
                    self.resolver.resolve(&source, self.config.resolver_timeout()).await?
                } else {
                    source
                }
            }
            PreviewKind::Output => {
                let url = channel.output.url();
                if url.is_empty() {
                    return Err(SupervisorError::MissingOutput(name.to_string()));
                }
                url
            }
        };

        let silent = kind == PreviewKind::Input && channel.selected_program().is_some_and(|p| !p.has_video);
        if let Some(program) = channel.selected_program().filter(|_| silent) {
            self.events.notify(
                Some(name),
                Severity::Warning,
                format!("service '{}' carries no video stream, the preview may show no picture", program.service_name),
            );
        }

        let port = if kind == PreviewKind::Input && channel.input.input_type == InputType::Udp {
            if self.preview.active().await.is_some_and(|(active, _)| active == name) {
                self.preview.stop().await;
            }
            let guard = timeout(PREVIEW_TERMINATE_GRACE + STOP_JOIN_SLACK, Arc::clone(&slot.port).lock_owned())
                .await
                .map_err(|_| SupervisorError::PortBusy(name.to_string()))?;
            self.watcher.stop(name).await;
            self.refresh(name).await;
            Some(guard)
        } else {
            None
        };

        let command = preview_command(&channel, kind, &url, &self.config);
        self.events.publish(SupervisorEvent::PreviewStarted {
            channel: name.to_string(),
            kind,
        });
        self.preview.start(name, kind, command, port).await?;
        Ok(())
    }

    pub async fn stop_preview(&self) -> Result<(), SupervisorError> {
        if self.preview.stop().await {
            Ok(())
        } else {
            Err(SupervisorError::PreviewNotRunning)
        }
    }

    /// One reconciliation pass: collect encoder exits, decide restarts,
    /// publish status changes and persist the streaming flags that changed.
    pub async fn reconcile(self: &Arc<Self>) {
        let _pass = self.reconcile_lock.lock().await;
        let mut dirty = false;

        for (name, slot) in self.slots() {
            let exit = self.processes.take_exit(&name);
            let mut state = slot.state.lock().await;
            if state.removed {
                continue;
            }
            let exit = exit.or_else(|| state.stopped_exit.take());
            if exit.is_none() && !state.input_loss_stop && self.input_lost(&name) {
                state.input_loss_stop = true;
                self.stop_lost_input(&name);
            }

            let streaming_flag = state.channel.last_known_streaming_state;
            let restart = exit.and_then(|record| self.handle_exit(&name, &mut state, record));
            self.publish_status(&name, &mut state);
            if state.machine.status() == StreamStatus::Streaming {
                state.channel.last_known_streaming_state = true;
            }
            dirty |= state.channel.last_known_streaming_state != streaming_flag;
            drop(state);

            if let Some(attempt) = restart {
                self.schedule_restart(&name, attempt);
            }
        }

        if dirty {
            self.persist().await;
        }
    }

    pub async fn snapshot(&self) -> Vec<ChannelSnapshot> {
        let now = Instant::now();
        let mut snapshots = Vec::new();
        for (name, slot) in self.slots() {
            let state = slot.state.lock().await;
            let stats = self.watcher.stats(&name);
            let encoder = self.processes.facts(&name);
            snapshots.push(ChannelSnapshot {
                display_name: state.channel.display_name.clone(),
                status: state.machine.status(),
                input_type: state.channel.input.input_type,
                input_url: state.channel.input.url(),
                output_url: state.channel.output.url(),
                encoder_running: matches!(encoder, EncoderFacts::Running { .. }),
                encoder_pid: match encoder {
                    EncoderFacts::Running { pid, .. } => pid,
                    _ => None,
                },
                last_packet_age_ms: stats
                    .as_ref()
                    .and_then(|s| s.last_packet_age(now))
                    .map(|age| u64::try_from(age.as_millis()).unwrap_or(u64::MAX)),
                input_bitrate_kbps: stats.as_ref().and_then(|s| s.bitrate_kbps(now)),
                fault: state
                    .fault
                    .as_ref()
                    .map(ToString::to_string)
                    .or_else(|| self.processes.diagnostic_fault(&name)),
                programs: state.channel.programs.clone(),
                last_known_streaming_state: state.channel.last_known_streaming_state,
                name,
            });
        }
        snapshots
    }

    pub async fn status(&self, name: &str) -> Result<StreamStatus, SupervisorError> {
        let slot = self.slot(name)?;
        let status = slot.state.lock().await.machine.status();
        Ok(status)
    }

    pub async fn channel(&self, name: &str) -> Result<Channel, SupervisorError> {
        let slot = self.slot(name)?;
        let channel = slot.state.lock().await.channel.clone();
        Ok(channel)
    }

    pub fn channel_names(&self) -> Vec<String> {
        read(&self.channels).keys().cloned().collect()
    }

    pub fn is_encoder_active(&self, name: &str) -> bool {
        self.processes.is_active(name)
    }

    async fn reconcile_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.status_refresh_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            self.reconcile().await;
        }
        debug!("reconciliation loop stopped");
    }

    /// Deep health check: encoder tasks that died without recording an exit
    /// and listeners whose receive loop failed
    async fn liveness_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.process_monitor_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.processes.sweep().is_empty() {
                self.wake.notify_one();
            }
            for (name, slot) in self.slots() {
                let ListenerReading::Failed(reason) = self.watcher.reading(&name) else {
                    continue;
                };
                let mut state = slot.state.lock().await;
                if state.fault.is_none() && !state.removed {
                    self.events
                        .notify(Some(name.as_str()), Severity::Error, format!("input listener failed: {reason}"));
                    state.fault = Some(Fault::ListenerFailed(reason));
                    self.publish_status(&name, &mut state);
                }
            }
        }
        debug!("liveness sweep stopped");
    }

    async fn pump(self: Arc<Self>, mut reports: UnboundedReceiver<ProcessReport>, mut previews: UnboundedReceiver<PreviewEnded>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(report) = reports.recv() => self.handle_report(report).await,
                Some(ended) = previews.recv() => self.handle_preview_end(ended).await,
            }
        }
        debug!("report pump stopped");
    }

    async fn handle_report(&self, report: ProcessReport) {
        match report {
            ProcessReport::Launched { channel, pid, attempts } => {
                debug!(channel = %channel, pid = ?pid, attempts, "encoder launch confirmed");
                let Ok(slot) = self.slot(&channel) else {
                    return;
                };
                let mut state = slot.state.lock().await;
                // the exit may already have been collected; leave its fault alone
                if !self.processes.is_running(&channel) {
                    return;
                }
                state.start_pending = false;
                self.publish_status(&channel, &mut state);
            }
            ProcessReport::LaunchRetry { channel, attempt, max, error } => {
                self.events.notify(
                    Some(channel.as_str()),
                    Severity::Warning,
                    format!("encoder launch failed ({error}), retry {attempt}/{max}"),
                );
            }
            ProcessReport::LaunchFailed { channel, attempts, error } => {
                if let Ok(slot) = self.slot(&channel) {
                    let mut state = slot.state.lock().await;
                    state.start_pending = false;
                    state.fault = Some(Fault::LaunchExhausted(error.clone()));
                    self.publish_status(&channel, &mut state);
                }
                self.events.notify(
                    Some(channel.as_str()),
                    Severity::Fatal,
                    format!("encoder failed to start after {attempts} attempts: {error}; manual intervention required"),
                );
            }
            ProcessReport::DiagnosticFault { channel, line } => {
                self.events
                    .notify(Some(channel.as_str()), Severity::Error, format!("critical input error: {line}"));
                self.refresh(&channel).await;
            }
            ProcessReport::Exited { .. } => self.wake.notify_one(),
        }
    }

    async fn handle_preview_end(&self, ended: PreviewEnded) {
        let PreviewEnded {
            channel,
            kind,
            reason,
            port,
        } = ended;
        if port.is_some() && !self.shutdown.is_cancelled() {
            if let Ok(slot) = self.slot(&channel) {
                let mut state = slot.state.lock().await;
                if !state.removed {
                    self.ensure_listener(&channel, &mut state);
                    self.publish_status(&channel, &mut state);
                }
            }
        }
        drop(port);

        match reason {
            PreviewEndReason::LaunchFailed(error) => self.events.notify(
                Some(channel.as_str()),
                Severity::Error,
                format!("{} preview could not start: {error}", kind.title()),
            ),
            reason => debug!(channel = %channel, ?reason, "preview ended"),
        }
        self.events.publish(SupervisorEvent::PreviewStopped { channel });
    }

    async fn launch_encoder(&self, name: &str) {
        let Ok(slot) = self.slot(name) else {
            return;
        };
        let channel = slot.state.lock().await.channel.clone();
        let source = channel.input.url();
        let input_url = if channel.input.input_type == InputType::YouTube {
            info!(channel = name, "looking up media URL for platform link");
            match self.resolver.resolve(&source, self.config.resolver_timeout()).await {
                Ok(url) => url,
                Err(err) => {
                    error!(channel = name, error = %err, "failed to resolve input link");
                    let mut state = slot.state.lock().await;
                    if state.start_pending {
                        state.start_pending = false;
                        state.fault = Some(Fault::ResolveFailed(err.to_string()));
                        self.publish_status(name, &mut state);
                    }
                    drop(state);
                    self.events
                        .notify(Some(name), Severity::Error, format!("could not resolve input link: {err}"));
                    return;
                }
            }
        } else {
            source
        };

        let command = encoder_command(&channel, &input_url, &channel.output.url(), &self.config);
        let mut state = slot.state.lock().await;
        if !state.start_pending || state.removed || self.shutdown.is_cancelled() {
            debug!(channel = name, "start withdrawn before launch");
            return;
        }
        let retry = RetryPolicy {
            attempts: self.config.retry_attempts,
            delay: self.config.retry_delay(),
        };
        state.fault = None;
        if let Err(err) = self.processes.start(name, command, retry) {
            warn!(channel = name, error = %err, "encoder not launched");
            state.start_pending = false;
        }
        self.publish_status(name, &mut state);
    }

    async fn run_scan(&self, name: &str, input: InputConfig, port: Option<PortGuard>) {
        let limit = self.config.probe_timeout();
        let outcome = match input.input_type {
            InputType::YouTube => match self.resolver.resolve(&input.url(), self.config.resolver_timeout()).await {
                Ok(url) => self.prober.scan(&url, limit).await.map_err(|err| Fault::ProbeFailed(err.to_string())),
                Err(err) => Err(Fault::ResolveFailed(err.to_string())),
            },
            _ => self
                .prober
                .scan(&input.url(), limit)
                .await
                .map_err(|err| Fault::ProbeFailed(err.to_string())),
        };

        let Ok(slot) = self.slot(name) else {
            return;
        };
        let mut state = slot.state.lock().await;
        state.probe_in_flight = false;
        if state.removed {
            return;
        }
        if port.is_some() && !self.shutdown.is_cancelled() {
            self.ensure_listener(name, &mut state);
        }

        let result = match outcome {
            Ok(programs) if programs.is_empty() => {
                warn!(channel = name, "scan found no services");
                state.channel.replace_programs(Vec::new());
                state.fault = Some(Fault::NoPrograms);
                self.events.notify(Some(name), Severity::Warning, "scan found no services");
                Ok(programs)
            }
            Ok(programs) => {
                info!(channel = name, count = programs.len(), "services found");
                state.channel.replace_programs(programs.clone());
                state.last_scan_ok = Some(Instant::now());
                if !state.fault.as_ref().is_some_and(Fault::is_listener_fault) {
                    state.fault = None;
                }
                Ok(programs)
            }
            Err(fault) => {
                error!(channel = name, error = %fault, "scan failed");
                let message = fault.to_string();
                self.events.notify(Some(name), Severity::Error, message.clone());
                state.fault = Some(fault);
                Err(message)
            }
        };
        self.events.publish(SupervisorEvent::ProbeCompleted {
            channel: name.to_string(),
            result,
        });
        self.publish_status(name, &mut state);
        drop(state);
        drop(port);
        self.persist().await;
    }

    /// Classify an exit and decide whether to restart. Returns the restart attempt.
    fn handle_exit(&self, name: &str, state: &mut ChannelState, record: ExitRecord) -> Option<u32> {
        state.start_pending = false;
        self.publish_exit(name, &record);
        if record.expected {
            return None;
        }

        let fault = Fault::Crashed(record.code);
        let context = record
            .diagnostics
            .last()
            .map(|line| format!(" (last output: {line})"))
            .unwrap_or_default();
        error!(channel = name, code = ?record.code, "encoder exited unexpectedly");
        self.events
            .notify(Some(name), Severity::Error, format!("{fault}{context}"));
        state.fault = Some(fault);

        if self.shutdown.is_cancelled() {
            return None;
        }
        let allowed = match self.config.auto_restart {
            RestartPolicy::Never => false,
            RestartPolicy::WithinBudget => state.restarts < self.config.max_auto_restarts,
            RestartPolicy::Always => true,
        };
        if !allowed {
            state.channel.last_known_streaming_state = false;
            if self.config.auto_restart == RestartPolicy::WithinBudget {
                self.events.notify(
                    Some(name),
                    Severity::Fatal,
                    format!("encoder crashed {} times, automatic restarts exhausted", state.restarts + 1),
                );
            }
            return None;
        }

        state.restarts += 1;
        state.restart_pending = true;
        info!(channel = name, attempt = state.restarts, "restart scheduled in {:?}", self.config.retry_delay());
        self.events.publish(SupervisorEvent::RestartScheduled {
            channel: name.to_string(),
            attempt: state.restarts,
        });
        Some(state.restarts)
    }

    fn schedule_restart(self: &Arc<Self>, name: &str, attempt: u32) {
        let this = Arc::clone(self);
        let channel = name.to_string();
        self.spawn_guarded(name, "restart", async move {
            tokio::select! {
                _ = this.shutdown.cancelled() => return,
                _ = sleep(this.config.retry_delay()) => {}
            }
            let Ok(slot) = this.slot(&channel) else {
                return;
            };
            {
                let mut state = slot.state.lock().await;
                if !state.restart_pending || state.removed {
                    debug!(channel = %channel, "restart withdrawn");
                    return;
                }
                state.restart_pending = false;
                state.start_pending = true;
                this.publish_status(&channel, &mut state);
            }
            info!(channel = %channel, attempt, "restarting encoder");
            this.launch_encoder(&channel).await;
        });
    }

    /// Stop an encoder whose input went silent. The exit is parked on the
    /// channel for the next reconciliation to classify.
    fn stop_lost_input(self: &Arc<Self>, name: &str) {
        let this = Arc::clone(self);
        let channel = name.to_string();
        self.spawn_guarded(name, "input-loss stop", async move {
            let Ok(slot) = this.slot(&channel) else {
                return;
            };
            let record = {
                let _ops = slot.ops.lock().await;
                if this.input_lost(&channel) {
                    warn!(channel = %channel, "UDP input lost while encoding, stopping encoder");
                    this.processes.stop(&channel, false).await
                } else {
                    None
                }
            };
            let mut state = slot.state.lock().await;
            state.input_loss_stop = false;
            if !state.removed {
                state.stopped_exit = record;
            }
            drop(state);
            this.wake.notify_one();
        });
    }

    /// Spawn a channel task; a panic in it leaves the channel `unavailable`
    /// instead of stuck in whatever it was doing
    fn spawn_guarded<F>(self: &Arc<Self>, name: &str, what: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = tokio::spawn(task);
        let this = Arc::clone(self);
        let channel = name.to_string();
        tokio::spawn(async move {
            if let Err(err) = inner.await {
                if err.is_panic() {
                    error!(channel = %channel, task = what, "background task panicked");
                    this.force_unavailable(&channel, format!("{what} task failed")).await;
                }
            }
        });
    }

    async fn force_unavailable(&self, name: &str, reason: String) {
        let Ok(slot) = self.slot(name) else {
            return;
        };
        let mut state = slot.state.lock().await;
        if state.removed {
            return;
        }
        state.probe_in_flight = false;
        state.start_pending = false;
        state.restart_pending = false;
        state.input_loss_stop = false;
        state.fault = Some(Fault::TaskFailed(reason));
        if !self.shutdown.is_cancelled() && slot.port.try_lock().is_ok() {
            self.ensure_listener(name, &mut state);
        }
        self.publish_status(name, &mut state);
    }

    /// Bind the listener of a UDP channel; a bind failure becomes a sticky fault
    fn ensure_listener(&self, name: &str, state: &mut ChannelState) {
        let input = &state.channel.input;
        if input.input_type != InputType::Udp || !input.has_usable_source() {
            return;
        }
        match self
            .watcher
            .start(name, input.bind_address(), input.port, input.multicast_group())
        {
            Ok(_) => {
                if state.fault.as_ref().is_some_and(Fault::is_listener_fault) {
                    state.fault = None;
                }
            }
            Err(err) => {
                error!(channel = name, error = %err, "failed to start UDP listener");
                self.events
                    .notify(Some(name), Severity::Error, format!("input listener unavailable: {err}"));
                state.fault = Some(Fault::BindFailed(err.to_string()));
            }
        }
    }

    fn facts(&self, name: &str, state: &ChannelState) -> ChannelFacts {
        let input = &state.channel.input;
        let listener = if input.input_type == InputType::Udp {
            self.watcher.reading(name)
        } else {
            ListenerReading::NotRunning
        };
        ChannelFacts {
            input_type: input.input_type,
            input_configured: input.has_usable_source(),
            encoder: self.processes.facts(name),
            listener,
            probe_in_flight: state.probe_in_flight,
            start_pending: state.start_pending,
            fault: state.fault.clone(),
            last_scan_ok_age: state.last_scan_ok.map(|at| at.elapsed()),
        }
    }

    /// Re-derive status from current facts and notify observers on change
    fn publish_status(&self, name: &str, state: &mut ChannelState) {
        let facts = self.facts(name, state);
        if let Some(Transition { old, new }) = state.machine.evaluate(&facts, &self.policy) {
            state.channel.status = new;
            info!(channel = name, from = %old, to = %new, "status changed");
            self.events.publish(SupervisorEvent::StatusChanged {
                channel: name.to_string(),
                old,
                new,
            });
        }
    }

    fn publish_exit(&self, name: &str, record: &ExitRecord) {
        self.events.publish(SupervisorEvent::ProcessExited {
            channel: name.to_string(),
            expected: record.expected,
            code: record.code,
        });
    }

    async fn refresh(&self, name: &str) {
        if let Ok(slot) = self.slot(name) {
            let mut state = slot.state.lock().await;
            self.publish_status(name, &mut state);
        }
    }

    async fn persist(&self) {
        if let Err(err) = self.save_config().await {
            warn!(error = %err, "failed to persist channels");
        }
    }

    /// Running or pending channel other than `name` that uses UDP input `ip:port`
    async fn udp_owner(&self, name: &str, ip: &str, port: u16) -> Option<String> {
        for (other, slot) in self.slots() {
            if other == name {
                continue;
            }
            let state = slot.state.lock().await;
            let busy = state.start_pending || state.restart_pending || self.processes.is_active(&other);
            if busy && state.channel.input.udp_endpoint() == Some((ip, port)) {
                return Some(other);
            }
        }
        None
    }

    fn input_lost(&self, name: &str) -> bool {
        self.config.restart_on_input_loss
            && self.processes.is_running(name)
            && matches!(
                self.watcher.reading(name),
                ListenerReading::Active { last_packet_age: Some(age) } if age > self.policy.udp_packet_timeout
            )
    }

    fn ensure_running(&self) -> Result<(), SupervisorError> {
        if self.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        lock(&self.receivers).is_none()
    }

    fn slot(&self, name: &str) -> Result<Arc<ChannelSlot>, SupervisorError> {
        read(&self.channels)
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownChannel(name.to_string()))
    }

    /// Consistent listing; no lock is held afterwards
    fn slots(&self) -> Vec<(String, Arc<ChannelSlot>)> {
        read(&self.channels)
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
