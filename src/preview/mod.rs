//! The preview player
//!
//! At most one player runs at a time across all channels. Every accepted
//! start ends with exactly one [`PreviewEnded`], which hands back the port
//! guard so the owner can restore the channel's listener.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::OwnedMutexGuard;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::constants::{PREVIEW_TERMINATE_GRACE, PREVIEW_WINDOW_HEIGHT, PREVIEW_WINDOW_WIDTH, STOP_JOIN_SLACK};
use crate::error::LaunchError;
use crate::process::{ProcessCommand, terminate};
use crate::types::{Channel, OutputType, PreviewKind};

/// Exclusive use of a channel's input port
pub type PortGuard = OwnedMutexGuard<()>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewEndReason {
    Stopped,
    AutoStopped,
    PlayerExited(Option<i32>),
    LaunchFailed(String),
    /// Player task did not finish in time and was aborted
    Aborted,
}

#[derive(Debug)]
pub struct PreviewEnded {
    pub channel: String,
    pub kind: PreviewKind,
    pub reason: PreviewEndReason,
    /// Held for input previews of UDP channels
    pub port: Option<PortGuard>,
}

/// Player invocation for one side of `channel`
pub fn preview_command(channel: &Channel, kind: PreviewKind, url: &str, config: &AppConfig) -> ProcessCommand {
    let mut cmd = ProcessCommand::new(&config.ffplay_path)
        .arg("-window_title")
        .arg(format!("Live Preview: {} ({})", channel.display_name, kind.title()))
        .args(["-i", url, "-autoexit"])
        .args(["-x".to_string(), PREVIEW_WINDOW_WIDTH.to_string()])
        .args(["-y".to_string(), PREVIEW_WINDOW_HEIGHT.to_string()]);
    match kind {
        PreviewKind::Input => {
            let input = &channel.input;
            for (flag, value) in [("-analyzeduration", &input.analyzeduration), ("-probesize", &input.probesize)] {
                let value = value.trim();
                if !value.is_empty() && value != "0" {
                    cmd = cmd.args([flag, value]);
                }
            }
        }
        PreviewKind::Output if channel.output.output_type == OutputType::Rtp => {
            cmd = cmd.args(["-rtp_payload_type".to_string(), channel.output.rtp_payload_type.to_string()]);
        }
        PreviewKind::Output => {}
    }
    cmd
}

/// Sends the one [`PreviewEnded`] of a preview, whoever gets there first
struct EndNotice {
    channel: String,
    kind: PreviewKind,
    pending: Mutex<Option<Option<PortGuard>>>,
    ended: UnboundedSender<PreviewEnded>,
}

impl EndNotice {
    fn new(channel: &str, kind: PreviewKind, port: Option<PortGuard>, ended: UnboundedSender<PreviewEnded>) -> Self {
        Self {
            channel: channel.to_string(),
            kind,
            pending: Mutex::new(Some(port)),
            ended,
        }
    }

    fn send(&self, reason: PreviewEndReason) {
        let Some(port) = lock(&self.pending).take() else {
            return;
        };
        let _ = self.ended.send(PreviewEnded {
            channel: self.channel.clone(),
            kind: self.kind,
            reason,
            port,
        });
    }
}

struct ActivePreview {
    channel: String,
    kind: PreviewKind,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    notice: Arc<EndNotice>,
}

pub struct PreviewManager {
    active: tokio::sync::Mutex<Option<ActivePreview>>,
    ended: UnboundedSender<PreviewEnded>,
    auto_stop: Duration,
}

impl PreviewManager {
    /// `auto_stop` of zero disables the timer
    pub fn new(auto_stop: Duration, ended: UnboundedSender<PreviewEnded>) -> Self {
        Self {
            active: tokio::sync::Mutex::new(None),
            ended,
            auto_stop,
        }
    }

    /// Stop whatever is playing, then launch `command`
    pub async fn start(
        &self,
        channel: &str,
        kind: PreviewKind,
        command: ProcessCommand,
        port: Option<PortGuard>,
    ) -> Result<(), LaunchError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            shutdown(previous).await;
        }

        info!(channel, kind = kind.title(), "starting preview: {command}");
        let mut child = match command.to_command().spawn() {
            Ok(child) => child,
            Err(err) => {
                let err = LaunchError::from_spawn(&command.program, err);
                warn!(channel, error = %err, "preview player failed to start");
                EndNotice::new(channel, kind, port, self.ended.clone())
                    .send(PreviewEndReason::LaunchFailed(err.to_string()));
                return Err(err);
            }
        };

        if let Some(stderr) = child.stderr.take() {
            let channel = channel.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(channel = %channel, "[preview] {}", line.trim());
                }
            });
        }

        let cancel = CancellationToken::new();
        let notice = Arc::new(EndNotice::new(channel, kind, port, self.ended.clone()));
        let task = tokio::spawn(run_player(PlayerTask {
            channel: channel.to_string(),
            child,
            cancel: cancel.clone(),
            auto_stop: self.auto_stop,
            notice: Arc::clone(&notice),
        }));
        *active = Some(ActivePreview {
            channel: channel.to_string(),
            kind,
            cancel,
            task,
            notice,
        });
        Ok(())
    }

    /// Returns whether a player was still running
    pub async fn stop(&self) -> bool {
        let Some(previous) = self.active.lock().await.take() else {
            return false;
        };
        let was_running = !previous.task.is_finished();
        shutdown(previous).await;
        was_running
    }

    /// Channel and side currently playing
    pub async fn active(&self) -> Option<(String, PreviewKind)> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|p| !p.task.is_finished())
            .map(|p| (p.channel.clone(), p.kind))
    }
}

async fn shutdown(preview: ActivePreview) {
    preview.cancel.cancel();
    let mut task = preview.task;
    if timeout(PREVIEW_TERMINATE_GRACE + STOP_JOIN_SLACK, &mut task).await.is_err() {
        warn!(channel = %preview.channel, "preview task did not finish, aborting");
        task.abort();
        let _ = task.await;
        preview.notice.send(PreviewEndReason::Aborted);
    }
}

struct PlayerTask {
    channel: String,
    child: Child,
    cancel: CancellationToken,
    auto_stop: Duration,
    notice: Arc<EndNotice>,
}

async fn run_player(task: PlayerTask) {
    let PlayerTask {
        channel,
        mut child,
        cancel,
        auto_stop,
        notice,
    } = task;

    let timer = async {
        if auto_stop.is_zero() {
            std::future::pending::<()>().await;
        } else {
            sleep(auto_stop).await;
        }
    };

    let reason = tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            info!(channel = %channel, code = ?code, "preview player exited");
            PreviewEndReason::PlayerExited(code)
        }
        _ = cancel.cancelled() => {
            let _ = terminate(&mut child, PREVIEW_TERMINATE_GRACE, &channel).await;
            info!(channel = %channel, "preview stopped");
            PreviewEndReason::Stopped
        }
        _ = timer => {
            info!(channel = %channel, "preview auto-stopped after {auto_stop:?}");
            let _ = terminate(&mut child, PREVIEW_TERMINATE_GRACE, &channel).await;
            PreviewEndReason::AutoStopped
        }
    };

    notice.send(reason);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
