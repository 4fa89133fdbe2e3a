//! Constants for channel supervision, listener liveness and external tools

use std::time::Duration;

/// UDP listener constants
pub const UDP_RECV_BUFFER_SIZE: usize = 65_536; // largest UDP datagram
pub const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(1);
pub const ANY_INTERFACE: &str = "0.0.0.0";
pub const AUTO_INTERFACE: &str = "Auto";

/// Encoder process constants
pub const DIAGNOSTIC_TAIL_LINES: usize = 32;
pub const STOP_JOIN_SLACK: Duration = Duration::from_secs(2);

/// Preview player constants
pub const PREVIEW_TERMINATE_GRACE: Duration = Duration::from_secs(2);
pub const PREVIEW_WINDOW_WIDTH: u32 = 640;
pub const PREVIEW_WINDOW_HEIGHT: u32 = 360;

/// Background task shutdown bound
pub const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Capacity of the observer event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Encoder stderr substrings that classify the input as unusable (case-insensitive)
pub const FATAL_DIAGNOSTIC_PATTERNS: &[&str] = &[
    "Input/output error",
    "No such file or directory",
    "Connection refused",
    "Network is unreachable",
    "Failed to open",
    "Protocol not found",
    "Permission denied",
    "Invalid data found when processing input",
    "non-existing PPS", // missing decode reference
];

/// Default addressing for generated channels
pub const DEFAULT_INPUT_GROUP: &str = "239.1.1.1";
pub const DEFAULT_INPUT_PORT_BASE: u16 = 1233;
pub const DEFAULT_OUTPUT_GROUP: &str = "239.2.2.2";
pub const DEFAULT_OUTPUT_PORT_BASE: u16 = 5677;

/// Default tool names, resolved through PATH
pub const DEFAULT_FFMPEG: &str = "ffmpeg";
pub const DEFAULT_FFPROBE: &str = "ffprobe";
pub const DEFAULT_FFPLAY: &str = "ffplay";
pub const DEFAULT_RESOLVER: &str = "yt-dlp";
