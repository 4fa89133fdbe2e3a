//! Channel status derivation
//!
//! Status is never set by hand. [`derive_status`] computes it from a snapshot
//! of raw facts and [`ChannelStateMachine`] publishes only actual changes, so
//! evaluating the same facts any number of times notifies observers at most once.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::process::EncoderFacts;
use crate::types::{InputType, StreamStatus};
use crate::watcher::ListenerReading;

/// Sticky failure classification; cleared by a user command or by a
/// successful launch or scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Fault {
    BindFailed(String),
    ListenerFailed(String),
    LaunchExhausted(String),
    Crashed(Option<i32>),
    ProbeFailed(String),
    NoPrograms,
    ResolveFailed(String),
    /// A background task for the channel panicked
    TaskFailed(String),
}

impl Fault {
    /// Faults a successful listener restore makes obsolete
    pub fn is_listener_fault(&self) -> bool {
        matches!(self, Fault::BindFailed(_) | Fault::ListenerFailed(_))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::BindFailed(reason) => write!(f, "listener bind failed: {reason}"),
            Fault::ListenerFailed(reason) => write!(f, "listener failed: {reason}"),
            Fault::LaunchExhausted(reason) => write!(f, "encoder could not be started: {reason}"),
            Fault::Crashed(Some(code)) => write!(f, "encoder exited with code {code}"),
            Fault::Crashed(None) => f.write_str("encoder terminated abnormally"),
            Fault::ProbeFailed(reason) => write!(f, "scan failed: {reason}"),
            Fault::NoPrograms => f.write_str("scan found no services"),
            Fault::ResolveFailed(reason) => write!(f, "input link could not be resolved: {reason}"),
            Fault::TaskFailed(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPolicy {
    /// Packet recency threshold for UDP inputs
    pub udp_packet_timeout: Duration,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            udp_packet_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything status depends on, read at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFacts {
    pub input_type: InputType,
    /// A usable input URL or address is configured
    pub input_configured: bool,
    pub encoder: EncoderFacts,
    pub listener: ListenerReading,
    pub probe_in_flight: bool,
    /// Start accepted, encoder launch not settled yet
    pub start_pending: bool,
    pub fault: Option<Fault>,
    /// Time since the last scan that found programs
    pub last_scan_ok_age: Option<Duration>,
}

impl ChannelFacts {
    pub fn idle(input_type: InputType, input_configured: bool) -> Self {
        Self {
            input_type,
            input_configured,
            encoder: EncoderFacts::Idle,
            listener: ListenerReading::NotRunning,
            probe_in_flight: false,
            start_pending: false,
            fault: None,
            last_scan_ok_age: None,
        }
    }
}

pub fn derive_status(facts: &ChannelFacts, policy: &StatusPolicy) -> StreamStatus {
    let recent = |age: Option<Duration>| age.is_some_and(|age| age <= policy.udp_packet_timeout);

    if let EncoderFacts::Running { diagnostic_fault, .. } = facts.encoder {
        if diagnostic_fault {
            return StreamStatus::Unavailable;
        }
        if facts.input_type != InputType::Udp {
            return StreamStatus::Streaming;
        }
        return match &facts.listener {
            ListenerReading::Active { last_packet_age } if recent(*last_packet_age) => {
                StreamStatus::Streaming
            }
            _ => StreamStatus::Unavailable,
        };
    }

    if facts.probe_in_flight {
        return StreamStatus::Scanning;
    }
    if facts.fault.is_some() {
        return StreamStatus::Unavailable;
    }
    if facts.start_pending || matches!(facts.encoder, EncoderFacts::Launching { .. }) {
        return StreamStatus::Starting;
    }

    match facts.input_type {
        InputType::Udp => match &facts.listener {
            ListenerReading::Failed(_) => StreamStatus::Unavailable,
            ListenerReading::NotRunning => StreamStatus::Unknown,
            ListenerReading::Active { last_packet_age } => {
                if recent(*last_packet_age) || recent(facts.last_scan_ok_age) {
                    StreamStatus::Available
                } else {
                    StreamStatus::Starting
                }
            }
        },
        _ if facts.input_configured => StreamStatus::Available,
        _ => StreamStatus::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub old: StreamStatus,
    pub new: StreamStatus,
}

/// Last published status of one channel
#[derive(Debug, Clone, Default)]
pub struct ChannelStateMachine {
    status: StreamStatus,
}

impl ChannelStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    /// Record `new`; a transition is returned only when it differs
    pub fn apply(&mut self, new: StreamStatus) -> Option<Transition> {
        if new == self.status {
            return None;
        }
        let old = std::mem::replace(&mut self.status, new);
        Some(Transition { old, new })
    }

    pub fn evaluate(&mut self, facts: &ChannelFacts, policy: &StatusPolicy) -> Option<Transition> {
        self.apply(derive_status(facts, policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    fn policy() -> StatusPolicy {
        StatusPolicy {
            udp_packet_timeout: Duration::from_secs(10),
        }
    }

    fn udp() -> ChannelFacts {
        ChannelFacts::idle(InputType::Udp, true)
    }

    fn active(age: Option<Duration>) -> ListenerReading {
        ListenerReading::Active { last_packet_age: age }
    }

    fn running(diagnostic_fault: bool) -> EncoderFacts {
        EncoderFacts::Running {
            pid: Some(4242),
            diagnostic_fault,
        }
    }

    #[test]
    fn udp_listener_lifecycle() {
        let mut machine = ChannelStateMachine::new();
        let mut facts = udp();
        assert_eq!(machine.evaluate(&facts, &policy()), None);
        assert_eq!(machine.status(), StreamStatus::Unknown);

        facts.listener = active(None);
        assert_eq!(
            machine.evaluate(&facts, &policy()),
            Some(Transition {
                old: StreamStatus::Unknown,
                new: StreamStatus::Starting
            })
        );

        facts.listener = active(Some(Duration::from_millis(5)));
        assert_eq!(
            machine.evaluate(&facts, &policy()).map(|t| t.new),
            Some(StreamStatus::Available)
        );

        facts.listener = ListenerReading::Failed("socket closed".to_string());
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Unavailable);
    }

    #[test]
    fn silent_udp_input_while_encoding_is_unavailable() {
        let mut facts = udp();
        facts.encoder = running(false);
        facts.listener = active(Some(2 * SECOND));
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Streaming);

        facts.listener = active(Some(10 * SECOND));
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Streaming);

        facts.listener = active(Some(11 * SECOND));
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Unavailable);

        facts.listener = ListenerReading::NotRunning;
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Unavailable);
    }

    #[test]
    fn non_udp_encoder_streams_unless_diagnostics_fail() {
        let mut facts = ChannelFacts::idle(InputType::Hls, true);
        facts.encoder = running(false);
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Streaming);
        facts.encoder = running(true);
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Unavailable);

        let mut udp_facts = udp();
        udp_facts.encoder = running(true);
        udp_facts.listener = active(Some(SECOND));
        assert_eq!(derive_status(&udp_facts, &policy()), StreamStatus::Unavailable);
    }

    #[test]
    fn scanning_overrides_everything_but_a_running_encoder() {
        let mut facts = udp();
        facts.probe_in_flight = true;
        facts.fault = Some(Fault::NoPrograms);
        facts.start_pending = true;
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Scanning);

        facts.encoder = running(false);
        facts.listener = active(Some(SECOND));
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Streaming);
    }

    #[test]
    fn faults_stick_until_cleared() {
        let mut facts = udp();
        facts.listener = active(Some(SECOND));
        facts.fault = Some(Fault::Crashed(Some(1)));
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Unavailable);
        facts.fault = None;
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Available);
    }

    #[test]
    fn pending_start_and_launch_retries_show_starting() {
        let mut facts = ChannelFacts::idle(InputType::Srt, true);
        facts.start_pending = true;
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Starting);

        facts.start_pending = false;
        facts.encoder = EncoderFacts::Launching { attempt: 2 };
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Starting);

        facts.encoder = EncoderFacts::Idle;
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Available);
    }

    #[test]
    fn recent_scan_counts_as_input_evidence() {
        let mut facts = udp();
        facts.listener = active(None);
        facts.last_scan_ok_age = Some(3 * SECOND);
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Available);
        facts.last_scan_ok_age = Some(30 * SECOND);
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Starting);
    }

    #[test]
    fn unconfigured_inputs_are_unknown() {
        let facts = ChannelFacts::idle(InputType::YouTube, false);
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Unknown);
        let facts = ChannelFacts::idle(InputType::YouTube, true);
        assert_eq!(derive_status(&facts, &policy()), StreamStatus::Available);
    }

    #[test]
    fn same_facts_publish_once() {
        let listeners = [
            ListenerReading::NotRunning,
            ListenerReading::Failed("gone".to_string()),
            active(None),
            active(Some(SECOND)),
            active(Some(60 * SECOND)),
        ];
        let encoders = [
            EncoderFacts::Idle,
            EncoderFacts::Launching { attempt: 0 },
            running(false),
            running(true),
            EncoderFacts::Exited,
        ];
        for input_type in [InputType::Udp, InputType::Srt, InputType::Hls] {
            for listener in &listeners {
                for encoder in encoders {
                    for probe_in_flight in [false, true] {
                        let facts = ChannelFacts {
                            encoder,
                            listener: listener.clone(),
                            probe_in_flight,
                            ..ChannelFacts::idle(input_type, true)
                        };
                        let mut machine = ChannelStateMachine::new();
                        let first = machine.evaluate(&facts, &policy());
                        let status = machine.status();
                        assert_eq!(machine.evaluate(&facts, &policy()), None);
                        assert_eq!(machine.status(), status);
                        assert_eq!(first.is_some(), status != StreamStatus::Unknown);
                    }
                }
            }
        }
    }
}
