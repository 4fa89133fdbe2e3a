//! Indirect platform links → direct media URLs

use std::io;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::ResolveError;
use crate::process::ProcessCommand;

#[derive(Debug, Clone)]
pub struct UrlResolver {
    program: String,
}

impl UrlResolver {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn command(&self, url: &str) -> ProcessCommand {
        ProcessCommand::new(&self.program).args(["-g", "-f", "best", url])
    }

    /// First non-empty line the resolver prints
    pub async fn resolve(&self, url: &str, limit: Duration) -> Result<String, ResolveError> {
        let command = self.command(url);
        debug!("resolving: {command}");
        let output = match timeout(limit, command.to_capturing_command().output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ResolveError::ExecutableNotFound {
                    program: self.program.clone(),
                });
            }
            Ok(Err(err)) => return Err(ResolveError::Io(err)),
            Err(_) => return Err(ResolveError::Timeout(limit)),
        };
        if !output.status.success() {
            return Err(ResolveError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let media = stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or(ResolveError::EmptyUrl)?;
        info!(source = url, "resolved platform link to a media URL");
        Ok(media.to_string())
    }
}
