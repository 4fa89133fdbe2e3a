use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

use crate::constants::{ANY_INTERFACE, AUTO_INTERFACE};

/// Published status of a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// No signal either way
    #[default]
    Unknown,
    /// Probe in flight
    Scanning,
    /// Input present, not encoding
    Available,
    /// Listener active or launch in progress, nothing confirmed yet
    Starting,
    /// Encoder running and input healthy
    Streaming,
    /// Input missing, encoder crashed or startup failed
    Unavailable,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Unknown => "unknown",
            StreamStatus::Scanning => "scanning",
            StreamStatus::Available => "available",
            StreamStatus::Starting => "starting",
            StreamStatus::Streaming => "streaming",
            StreamStatus::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputType {
    #[default]
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "SRT")]
    Srt,
    #[serde(rename = "HLS (M3U8)", alias = "HLS")]
    Hls,
    #[serde(rename = "YouTube")]
    YouTube,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputType {
    #[default]
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "SRT")]
    Srt,
    #[serde(rename = "RTMP")]
    Rtmp,
    #[serde(rename = "RTP")]
    Rtp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrtMode {
    Listener,
    Caller,
    Rendezvous,
}

impl SrtMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SrtMode::Listener => "listener",
            SrtMode::Caller => "caller",
            SrtMode::Rendezvous => "rendezvous",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtpProtocol {
    #[default]
    Udp,
    Tcp,
}

/// Input side of a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub input_type: InputType,
    pub ip: String,
    pub port: u16,
    /// HLS playlist or platform link
    pub url: String,
    pub srt_mode: SrtMode,
    /// Local interface address, or `Auto`
    pub bind_interface: String,
    /// Program selected from the last scan
    pub program_id: Option<u32>,
    pub probesize: String,
    pub analyzeduration: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            input_type: InputType::Udp,
            ip: String::new(),
            port: 0,
            url: String::new(),
            srt_mode: SrtMode::Listener,
            bind_interface: AUTO_INTERFACE.to_string(),
            program_id: None,
            probesize: "10M".to_string(),
            analyzeduration: "10M".to_string(),
        }
    }
}

impl InputConfig {
    /// Encoder-facing input URL; empty when nothing usable is configured
    pub fn url(&self) -> String {
        match self.input_type {
            InputType::Hls | InputType::YouTube => self.url.trim().to_string(),
            InputType::Udp if !self.ip.is_empty() && self.port != 0 => {
                format!("udp://@{}:{}", self.ip, self.port)
            }
            InputType::Srt if !self.ip.is_empty() && self.port != 0 => {
                format!("srt://{}:{}?mode={}", self.ip, self.port, self.srt_mode.as_str())
            }
            _ => String::new(),
        }
    }

    pub fn has_usable_source(&self) -> bool {
        !self.url().is_empty()
    }

    /// Address the listener binds to (`Auto` means every interface)
    pub fn bind_address(&self) -> &str {
        let iface = self.bind_interface.trim();
        if iface.is_empty() || iface.eq_ignore_ascii_case(AUTO_INTERFACE) {
            ANY_INTERFACE
        } else {
            iface
        }
    }

    /// Explicit interface for the encoder's `-bind_address`, if any
    pub fn explicit_interface(&self) -> Option<&str> {
        let iface = self.bind_interface.trim();
        (!iface.is_empty() && !iface.eq_ignore_ascii_case(AUTO_INTERFACE)).then_some(iface)
    }

    /// `(ip, port)` identity of a UDP input, used by the duplicate-port guard
    pub fn udp_endpoint(&self) -> Option<(&str, u16)> {
        (self.input_type == InputType::Udp).then_some((self.ip.as_str(), self.port))
    }

    /// Multicast group to join, when the input address is in 224.0.0.0/4
    pub fn multicast_group(&self) -> Option<Ipv4Addr> {
        self.ip.parse::<Ipv4Addr>().ok().filter(|ip| ip.is_multicast())
    }

    /// Whether a saved edit changes what the UDP listener is bound to
    pub fn listener_differs(&self, other: &InputConfig) -> bool {
        self.input_type != other.input_type
            || self.ip != other.ip
            || self.port != other.port
            || self.bind_interface != other.bind_interface
    }
}

/// Output side of a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub output_type: OutputType,
    pub ip: String,
    pub port: u16,
    /// RTMP target
    pub url: String,
    /// Video bitrate in kbit/s
    pub video_bitrate: u32,
    pub srt_mode: SrtMode,
    pub srt_latency: u32,
    pub srt_maxbw: u64,
    pub srt_tsbpdmode: bool,
    pub srt_sndbuf: u64,
    pub srt_rcvbuf: u64,
    pub udp_pkt_size: u32,
    pub rtp_protocol: RtpProtocol,
    pub rtp_payload_type: u8,
    /// Demux delay in microseconds, 0 for the encoder default
    pub max_delay: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_type: OutputType::Udp,
            ip: String::new(),
            port: 0,
            url: String::new(),
            video_bitrate: 2000,
            srt_mode: SrtMode::Caller,
            srt_latency: 5000,
            srt_maxbw: 0,
            srt_tsbpdmode: true,
            srt_sndbuf: 8_000_000,
            srt_rcvbuf: 8_000_000,
            udp_pkt_size: 1316,
            rtp_protocol: RtpProtocol::Udp,
            rtp_payload_type: 96,
            max_delay: 0,
        }
    }
}

impl OutputConfig {
    /// Encoder-facing output URL; empty when nothing usable is configured
    pub fn url(&self) -> String {
        match self.output_type {
            OutputType::Rtmp => self.url.trim().to_string(),
            _ if self.port == 0 => String::new(),
            OutputType::Udp if !self.ip.is_empty() => format!("udp://@{}:{}", self.ip, self.port),
            OutputType::Rtp if !self.ip.is_empty() => {
                let proto = match self.rtp_protocol {
                    RtpProtocol::Udp => "udp",
                    RtpProtocol::Tcp => "tcp",
                };
                format!("{proto}://{}:{}", self.ip, self.port)
            }
            OutputType::Srt => {
                let ip = match (self.srt_mode, self.ip.is_empty()) {
                    (SrtMode::Listener, true) => ANY_INTERFACE,
                    (_, true) => return String::new(),
                    _ => self.ip.as_str(),
                };
                let mut params = vec![format!("mode={}", self.srt_mode.as_str())];
                if self.srt_latency != 0 {
                    params.push(format!("latency={}", self.srt_latency));
                }
                if self.srt_maxbw != 0 {
                    params.push(format!("maxbw={}", self.srt_maxbw));
                }
                params.push(format!("tsbpdmode={}", self.srt_tsbpdmode));
                if self.srt_sndbuf != 0 {
                    params.push(format!("sndbuf={}", self.srt_sndbuf));
                }
                if self.srt_rcvbuf != 0 {
                    params.push(format!("rcvbuf={}", self.srt_rcvbuf));
                }
                format!("srt://{ip}:{}?{}", self.port, params.join("&"))
            }
            _ => String::new(),
        }
    }
}

/// One selectable program found by a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramDescriptor {
    pub program_id: u32,
    pub service_name: String,
    pub has_video: bool,
}

/// One configured input→output pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Channel {
    /// Stable key; persisted as the map key, not inside the record
    #[serde(skip)]
    pub name: String,
    pub display_name: String,
    pub input: InputConfig,
    pub output: OutputConfig,
    /// Volatile, meaningless on reload
    pub status: StreamStatus,
    pub last_known_streaming_state: bool,
    pub programs: Vec<ProgramDescriptor>,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            name: String::new(),
            display_name: String::new(),
            input: InputConfig::default(),
            output: OutputConfig::default(),
            status: StreamStatus::Unknown,
            last_known_streaming_state: false,
            programs: Vec::new(),
        }
    }
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            ..Self::default()
        }
    }

    /// Program the encoder and preview should use, if the last scan found it
    pub fn selected_program(&self) -> Option<&ProgramDescriptor> {
        let id = self.input.program_id?;
        self.programs.iter().find(|p| p.program_id == id)
    }

    /// Replace the program list wholesale and re-derive the selection:
    /// keep the previous id if still present, else fall back to the first entry
    pub fn replace_programs(&mut self, programs: Vec<ProgramDescriptor>) {
        let keep = self
            .input
            .program_id
            .filter(|id| programs.iter().any(|p| p.program_id == *id));
        self.input.program_id = keep.or_else(|| programs.first().map(|p| p.program_id));
        self.programs = programs;
    }
}

/// Which side of a channel the preview player shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewKind {
    Input,
    Output,
}

impl PreviewKind {
    pub fn title(&self) -> &'static str {
        match self {
            PreviewKind::Input => "Input",
            PreviewKind::Output => "Output",
        }
    }
}

/// Point-in-time view of one channel for observers and reports
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub name: String,
    pub display_name: String,
    pub status: StreamStatus,
    pub input_type: InputType,
    pub input_url: String,
    pub output_url: String,
    pub encoder_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoder_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_packet_age_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_bitrate_kbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
    pub programs: Vec<ProgramDescriptor>,
    pub last_known_streaming_state: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_input(ip: &str, port: u16) -> InputConfig {
        InputConfig {
            ip: ip.to_string(),
            port,
            ..InputConfig::default()
        }
    }

    #[test]
    fn input_urls_follow_transport() {
        assert_eq!(udp_input("239.1.1.1", 1234).url(), "udp://@239.1.1.1:1234");
        assert_eq!(udp_input("239.1.1.1", 0).url(), "");

        let srt = InputConfig {
            input_type: InputType::Srt,
            ..udp_input("10.0.0.5", 9000)
        };
        assert_eq!(srt.url(), "srt://10.0.0.5:9000?mode=listener");

        let hls = InputConfig {
            input_type: InputType::Hls,
            url: "  https://cdn.example/live.m3u8 ".to_string(),
            ..InputConfig::default()
        };
        assert_eq!(hls.url(), "https://cdn.example/live.m3u8");
        assert!(!InputConfig { input_type: InputType::YouTube, ..InputConfig::default() }.has_usable_source());
    }

    #[test]
    fn srt_output_skips_zero_parameters() {
        let out = OutputConfig {
            output_type: OutputType::Srt,
            srt_mode: SrtMode::Listener,
            port: 7000,
            srt_sndbuf: 0,
            ..OutputConfig::default()
        };
        assert_eq!(
            out.url(),
            "srt://0.0.0.0:7000?mode=listener&latency=5000&tsbpdmode=true&rcvbuf=8000000"
        );

        let caller_without_ip = OutputConfig {
            output_type: OutputType::Srt,
            port: 7000,
            ..OutputConfig::default()
        };
        assert_eq!(caller_without_ip.url(), "");
    }

    #[test]
    fn rtp_and_rtmp_outputs() {
        let rtp = OutputConfig {
            output_type: OutputType::Rtp,
            ip: "10.1.1.1".to_string(),
            port: 5004,
            rtp_protocol: RtpProtocol::Tcp,
            ..OutputConfig::default()
        };
        assert_eq!(rtp.url(), "tcp://10.1.1.1:5004");

        let rtmp = OutputConfig {
            output_type: OutputType::Rtmp,
            url: "rtmp://live.example/app/key".to_string(),
            ..OutputConfig::default()
        };
        assert_eq!(rtmp.url(), "rtmp://live.example/app/key");
    }

    #[test]
    fn multicast_detection_and_bind_address() {
        assert_eq!(udp_input("239.1.1.1", 1).multicast_group(), Some(Ipv4Addr::new(239, 1, 1, 1)));
        assert_eq!(udp_input("224.0.0.1", 1).multicast_group(), Some(Ipv4Addr::new(224, 0, 0, 1)));
        assert_eq!(udp_input("192.168.1.10", 1).multicast_group(), None);

        let mut input = udp_input("239.1.1.1", 1234);
        assert_eq!(input.bind_address(), "0.0.0.0");
        assert_eq!(input.explicit_interface(), None);
        input.bind_interface = "192.168.1.20".to_string();
        assert_eq!(input.bind_address(), "192.168.1.20");
        assert_eq!(input.explicit_interface(), Some("192.168.1.20"));
    }

    #[test]
    fn replacing_programs_rederives_selection() {
        let programs = |ids: &[u32]| {
            ids.iter()
                .map(|id| ProgramDescriptor {
                    program_id: *id,
                    service_name: format!("svc {id}"),
                    has_video: true,
                })
                .collect::<Vec<_>>()
        };

        let mut channel = Channel::new("Channel 1");
        channel.input.program_id = Some(2);
        channel.replace_programs(programs(&[1, 2, 3]));
        assert_eq!(channel.input.program_id, Some(2));

        channel.replace_programs(programs(&[7, 8]));
        assert_eq!(channel.input.program_id, Some(7));
        assert_eq!(channel.programs.len(), 2);

        channel.replace_programs(Vec::new());
        assert_eq!(channel.input.program_id, None);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&StreamStatus::Unavailable).unwrap();
        assert_eq!(json, "\"unavailable\"");
        let back: InputType = serde_json::from_str("\"HLS (M3U8)\"").unwrap();
        assert_eq!(back, InputType::Hls);
    }
}
