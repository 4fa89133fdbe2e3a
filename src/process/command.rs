//! External process command lines

use std::fmt;
use std::process::Stdio;

use tokio::process::Command;

use crate::config::AppConfig;
use crate::types::{Channel, InputType, OutputType};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Program plus argument vector, built once and spawned on every attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// stdin and stdout discarded, stderr piped for diagnostics;
    /// the child is killed if its handle is dropped
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);
        cmd
    }

    /// For one-shot tools whose stdout is the result
    pub fn to_capturing_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);
        cmd
    }
}

impl fmt::Display for ProcessCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

fn non_zero(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty() && value != "0").then_some(value)
}

/// Encoder invocation for `channel`. `input_url` is passed separately since
/// platform links are resolved to a media URL just before launch.
pub fn encoder_command(
    channel: &Channel,
    input_url: &str,
    output_url: &str,
    config: &AppConfig,
) -> ProcessCommand {
    let input = &channel.input;
    let output = &channel.output;
    let mut cmd = ProcessCommand::new(&config.ffmpeg_path).args(["-loglevel", config.ffmpeg_loglevel.as_str()]);

    if let Some(duration) = non_zero(&input.analyzeduration) {
        cmd = cmd.args(["-analyzeduration", duration]);
    }
    if let Some(size) = non_zero(&input.probesize) {
        cmd = cmd.args(["-probesize", size]);
    }
    if matches!(input.input_type, InputType::Udp | InputType::Srt) {
        if let Some(iface) = input.explicit_interface() {
            cmd = cmd.args(["-bind_address", iface]);
        }
    }
    cmd = cmd.args(["-i", input_url]);

    match (input.input_type, input.program_id) {
        (InputType::Udp, Some(id)) => cmd = cmd.args(["-map".to_string(), format!("0:p:{id}")]),
        _ => cmd = cmd.args(["-map", "0:v:0?", "-map", "0:a:0?"]),
    }

    cmd = cmd
        .args(["-c:v", "libx264", "-pix_fmt", "yuv420p"])
        .args(["-b:v".to_string(), format!("{}k", output.video_bitrate)])
        .args(["-c:a", "copy", "-flags", "+global_header", "-g", "50"])
        .args(["-bsf:v", "h264_mp4toannexb"]);

    let format = match output.output_type {
        OutputType::Udp | OutputType::Srt => "mpegts",
        OutputType::Rtmp => "flv",
        OutputType::Rtp => {
            cmd = cmd.args(["-payload_type".to_string(), output.rtp_payload_type.to_string()]);
            "rtp"
        }
    };
    if output.max_delay != 0 {
        cmd = cmd.args(["-max_delay".to_string(), output.max_delay.to_string()]);
    }
    if output.output_type == OutputType::Udp && output.udp_pkt_size != 0 {
        cmd = cmd.args(["-pkt_size".to_string(), output.udp_pkt_size.to_string()]);
    }
    cmd.args(["-f", format, output_url])
}
