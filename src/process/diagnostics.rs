//! Encoder stderr scanning
//!
//! During a warm-up window after launch every diagnostic line is checked
//! against a fixed list of fatal substrings. The first hit classifies the
//! channel unavailable and matching stops; the stream keeps being drained so
//! the encoder never blocks on a full pipe.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::{EncoderShared, ProcessReport};
use crate::constants::FATAL_DIAGNOSTIC_PATTERNS;

#[derive(Debug, Clone)]
pub struct FatalPatternMatcher {
    patterns: Vec<(String, &'static str)>, // (lowercased, original)
}

impl FatalPatternMatcher {
    pub fn new(patterns: &[&'static str]) -> Self {
        Self {
            patterns: patterns.iter().map(|p| (p.to_lowercase(), *p)).collect(),
        }
    }

    /// The pattern `line` matches, if any
    pub fn find(&self, line: &str) -> Option<&'static str> {
        let line = line.to_lowercase();
        self.patterns
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, original)| *original)
    }
}

impl Default for FatalPatternMatcher {
    fn default() -> Self {
        Self::new(FATAL_DIAGNOSTIC_PATTERNS)
    }
}

pub(crate) async fn scan_stderr<R>(
    channel: String,
    stderr: R,
    warmup: Duration,
    matcher: Arc<FatalPatternMatcher>,
    shared: Arc<EncoderShared>,
    reports: UnboundedSender<ProcessReport>,
) where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + warmup;
    let mut watching = true;
    let mut lines = BufReader::new(stderr).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!(channel = %channel, error = %err, "encoder stderr read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        shared.push_diagnostic(line);

        if watching && Instant::now() >= deadline {
            watching = false;
        }
        if !watching {
            debug!(channel = %channel, "[encoder] {line}");
            continue;
        }

        warn!(channel = %channel, "[encoder] {line}");
        if let Some(pattern) = matcher.find(line) {
            error!(
                channel = %channel,
                pattern,
                "encoder reported a critical input error; check input address, network path and permissions"
            );
            shared.set_fault(line);
            let _ = reports.send(ProcessReport::DiagnosticFault {
                channel: channel.clone(),
                line: line.to_string(),
            });
            watching = false;
        }
    }
    debug!(channel = %channel, "encoder stderr closed");
}
