//! Status reports for the CLI and API consumers

use serde::Serialize;

use crate::types::{ChannelSnapshot, StreamStatus};

/// Per-status channel counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub streaming: usize,
    pub available: usize,
    pub unavailable: usize,
    pub other: usize,
}

impl StatusSummary {
    fn count(channels: &[ChannelSnapshot]) -> Self {
        let mut summary = Self {
            total: channels.len(),
            ..Self::default()
        };
        for channel in channels {
            match channel.status {
                StreamStatus::Streaming => summary.streaming += 1,
                StreamStatus::Available => summary.available += 1,
                StreamStatus::Unavailable => summary.unavailable += 1,
                _ => summary.other += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorReport {
    pub timestamp: String,
    pub summary: StatusSummary,
    pub channels: Vec<ChannelSnapshot>,
}

/// Report generator for supervisor snapshots
pub struct Reporter;

impl Reporter {
    pub fn create_report(channels: Vec<ChannelSnapshot>) -> SupervisorReport {
        SupervisorReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            summary: StatusSummary::count(&channels),
            channels,
        }
    }

    /// Pretty-printed JSON for CLI output
    pub fn generate_json_report(channels: Vec<ChannelSnapshot>) -> String {
        let report = Self::create_report(channels);
        serde_json::to_string_pretty(&report)
            .unwrap_or_else(|_| "{\"error\": \"JSON serialization failed\"}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InputType, ProgramDescriptor};

    fn snapshot(name: &str, status: StreamStatus) -> ChannelSnapshot {
        ChannelSnapshot {
            name: name.to_string(),
            display_name: name.to_string(),
            status,
            input_type: InputType::Udp,
            input_url: "udp://@239.1.1.1:1234".to_string(),
            output_url: "udp://@239.2.2.2:5678".to_string(),
            encoder_running: status == StreamStatus::Streaming,
            encoder_pid: None,
            last_packet_age_ms: Some(120),
            input_bitrate_kbps: None,
            fault: None,
            programs: vec![ProgramDescriptor {
                program_id: 1,
                service_name: "News".to_string(),
                has_video: true,
            }],
            last_known_streaming_state: false,
        }
    }

    #[test]
    fn summary_counts_statuses() {
        let report = Reporter::create_report(vec![
            snapshot("a", StreamStatus::Streaming),
            snapshot("b", StreamStatus::Streaming),
            snapshot("c", StreamStatus::Unavailable),
            snapshot("d", StreamStatus::Scanning),
        ]);
        assert_eq!(
            report.summary,
            StatusSummary {
                total: 4,
                streaming: 2,
                available: 0,
                unavailable: 1,
                other: 1,
            }
        );
        assert!(chrono::DateTime::parse_from_rfc3339(&report.timestamp).is_ok());
    }

    #[test]
    fn json_report_omits_unknown_fields() {
        let json = Reporter::generate_json_report(vec![snapshot("a", StreamStatus::Available)]);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let channel = &value["channels"][0];
        assert_eq!(channel["status"], "available");
        assert_eq!(channel["input_type"], "UDP");
        assert_eq!(channel["last_packet_age_ms"], 120);
        assert!(channel.get("encoder_pid").is_none());
        assert!(channel.get("fault").is_none());
        assert_eq!(value["summary"]["available"], 1);
    }
}
