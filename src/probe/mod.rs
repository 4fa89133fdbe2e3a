//! Structural input probing
//!
//! Runs the prober once against an input URL and turns its JSON program
//! listing into [`ProgramDescriptor`]s, in the order the prober reports them.

use std::io;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::ProbeError;
use crate::process::ProcessCommand;
use crate::types::ProgramDescriptor;

#[derive(Debug, Default, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    programs: Vec<RawProgram>,
    #[serde(default)]
    streams: Vec<RawStream>,
}

#[derive(Debug, Deserialize)]
struct RawProgram {
    program_id: u32,
    #[serde(default)]
    tags: RawTags,
    streams: Option<Vec<RawStream>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTags {
    service_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawStream {
    codec_type: Option<String>,
    program_id: Option<u32>,
}

impl RawStream {
    fn is_video(&self) -> bool {
        self.codec_type.as_deref() == Some("video")
    }
}

/// Parse `-show_programs -show_streams` JSON. Programs listed without their
/// own streams borrow the top-level streams tagged with their id.
pub fn parse_programs(json: &str) -> Result<Vec<ProgramDescriptor>, ProbeError> {
    let output: ProbeOutput = serde_json::from_str(json)?;
    let programs = output
        .programs
        .into_iter()
        .map(|program| {
            let has_video = match &program.streams {
                Some(streams) => streams.iter().any(RawStream::is_video),
                None => output
                    .streams
                    .iter()
                    .filter(|s| s.program_id == Some(program.program_id))
                    .any(RawStream::is_video),
            };
            ProgramDescriptor {
                program_id: program.program_id,
                service_name: program
                    .tags
                    .service_name
                    .unwrap_or_else(|| "Unknown".to_string()),
                has_video,
            }
        })
        .collect();
    Ok(programs)
}

#[derive(Debug, Clone)]
pub struct ProbeRunner {
    program: String,
}

impl ProbeRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn command(&self, url: &str) -> ProcessCommand {
        ProcessCommand::new(&self.program)
            .args(["-v", "quiet", "-print_format", "json"])
            .args(["-show_programs", "-show_streams", url])
    }

    /// Probe `url`, giving up after `limit`. An input without programs is an
    /// empty list, not an error.
    pub async fn scan(&self, url: &str, limit: Duration) -> Result<Vec<ProgramDescriptor>, ProbeError> {
        let command = self.command(url);
        debug!("probing: {command}");
        let output = match timeout(limit, command.to_capturing_command().output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ProbeError::ExecutableNotFound {
                    program: self.program.clone(),
                });
            }
            Ok(Err(err)) => return Err(ProbeError::Io(err)),
            // dropping the output future kills the prober
            Err(_) => return Err(ProbeError::Timeout(limit)),
        };

        if !output.status.success() {
            return Err(ProbeError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let programs = parse_programs(&String::from_utf8_lossy(&output.stdout))?;
        info!(url, count = programs.len(), "probe finished");
        Ok(programs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_PROGRAMS: &str = r#"{
        "programs": [
            {
                "program_id": 101,
                "program_num": 1,
                "tags": { "service_provider": "Acme", "service_name": "News HD" },
                "streams": [
                    { "index": 0, "codec_type": "video", "codec_name": "h264" },
                    { "index": 1, "codec_type": "audio", "codec_name": "mp2" }
                ]
            },
            {
                "program_id": 102,
                "tags": { "service_name": "Radio One" },
                "streams": [ { "index": 2, "codec_type": "audio" } ]
            }
        ],
        "streams": []
    }"#;

    #[test]
    fn video_and_audio_only_programs_keep_source_order() {
        let programs = parse_programs(TWO_PROGRAMS).unwrap();
        assert_eq!(
            programs,
            vec![
                ProgramDescriptor {
                    program_id: 101,
                    service_name: "News HD".to_string(),
                    has_video: true,
                },
                ProgramDescriptor {
                    program_id: 102,
                    service_name: "Radio One".to_string(),
                    has_video: false,
                },
            ]
        );
    }

    #[test]
    fn programs_without_streams_use_tagged_global_streams() {
        let json = r#"{
            "programs": [ { "program_id": 5 }, { "program_id": 6, "tags": {} } ],
            "streams": [
                { "codec_type": "audio", "program_id": 5 },
                { "codec_type": "video", "program_id": 6 },
                { "codec_type": "video" }
            ]
        }"#;
        let programs = parse_programs(json).unwrap();
        assert_eq!(programs.len(), 2);
        assert!(!programs[0].has_video);
        assert!(programs[1].has_video);
        assert_eq!(programs[0].service_name, "Unknown");
    }

    #[test]
    fn empty_listing_is_not_an_error() {
        assert!(parse_programs("{}").unwrap().is_empty());
        assert!(matches!(parse_programs(""), Err(ProbeError::Malformed(_))));
        assert!(matches!(
            parse_programs(r#"{ "programs": [ { "tags": {} } ] }"#),
            Err(ProbeError::Malformed(_))
        ));
    }

    #[test]
    fn command_requests_programs_and_streams() {
        let cmd = ProbeRunner::new("ffprobe").command("udp://@239.1.1.1:1234");
        assert_eq!(
            cmd.to_string(),
            "ffprobe -v quiet -print_format json -show_programs -show_streams udp://@239.1.1.1:1234"
        );
    }

    #[tokio::test]
    async fn missing_prober_is_reported() {
        let runner = ProbeRunner::new("/nonexistent/ffprobe");
        let err = runner.scan("udp://@239.1.1.1:1234", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ProbeError::ExecutableNotFound { .. }));
    }

    #[cfg(unix)]
    mod with_stand_in {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;
        use tempfile::TempDir;

        fn script(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("ffprobe");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn parses_prober_stdout() {
            let dir = tempfile::tempdir().unwrap();
            let path = script(&dir, &format!("cat <<'EOF'\n{TWO_PROGRAMS}\nEOF"));
            let runner = ProbeRunner::new(path.to_string_lossy());

            let programs = runner.scan("udp://@239.1.1.1:1234", Duration::from_secs(5)).await.unwrap();
            assert_eq!(programs.len(), 2);
            assert!(programs[0].has_video);
        }

        #[tokio::test]
        async fn failing_prober_carries_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let path = script(&dir, "echo 'Connection timed out' >&2; exit 1");
            let runner = ProbeRunner::new(path.to_string_lossy());

            match runner.scan("srt://10.0.0.1:9000", Duration::from_secs(5)).await {
                Err(ProbeError::Failed { code, stderr }) => {
                    assert_eq!(code, Some(1));
                    assert_eq!(stderr, "Connection timed out");
                }
                other => panic!("unexpected result {other:?}"),
            }
        }

        #[tokio::test]
        async fn slow_prober_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let path = script(&dir, "exec sleep 30");
            let runner = ProbeRunner::new(path.to_string_lossy());

            let err = runner
                .scan("udp://@239.1.1.1:1234", Duration::from_millis(200))
                .await
                .unwrap_err();
            assert!(matches!(err, ProbeError::Timeout(d) if d == Duration::from_millis(200)));
        }
    }
}
