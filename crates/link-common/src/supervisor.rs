/// Lifecycle of a locally spawned embedding service.
///
/// The supervisor only starts, health-checks and stops the process. Retrying requests is
/// the embedding client's job; it calls `ensure_running` after a connection failure.
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::CommonError;

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub health_url: String,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
}

impl SupervisorConfig {
    /// Build a config from a whitespace-separated command line such as
    /// `python3 scripts/embedding_service.py --port 8765`. `None` for an empty command.
    pub fn from_command_line(command: &str, base_url: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;

        let startup_timeout = std::env::var("EMBEDDING_STARTUP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(60));

        Some(Self {
            program,
            args: parts.collect(),
            health_url: format!("{}/health", base_url.trim_end_matches('/')),
            startup_timeout,
            poll_interval: Duration::from_millis(500),
        })
    }
}

pub struct ServiceSupervisor {
    config: SupervisorConfig,
    http: reqwest::Client,
    child: Mutex<Option<Child>>,
}

impl ServiceSupervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self, CommonError> {
        let http = reqwest::Client::builder()
            .user_agent("link-pipeline/supervisor")
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            config,
            http,
            child: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Whether the service answers its health endpoint with a success status.
    pub async fn health_check(&self) -> bool {
        match self.http.get(&self.config.health_url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(url = %self.config.health_url, error = %e, "health check failed");
                false
            }
        }
    }

    /// Spawn the service process if this supervisor does not already own a live one.
    pub async fn start(&self) -> Result<(), CommonError> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => warn!(%status, "embedding service exited, restarting"),
                Err(e) => warn!(error = %e, "could not query embedding service status"),
            }
        }

        info!(program = %self.config.program, args = ?self.config.args, "starting embedding service");
        let child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CommonError::ServiceUnavailable {
                attempts: 0,
                message: format!("failed to spawn {}: {e}", self.config.program),
            })?;
        *guard = Some(child);
        Ok(())
    }

    /// Poll the health endpoint until it succeeds or the startup timeout elapses.
    pub async fn wait_healthy(&self) -> Result<(), CommonError> {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;
        let mut polls: u32 = 0;
        loop {
            polls += 1;
            if self.health_check().await {
                info!(polls, "embedding service healthy");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CommonError::ServiceUnavailable {
                    attempts: polls,
                    message: format!(
                        "no healthy response from {} within {:?}",
                        self.config.health_url, self.config.startup_timeout
                    ),
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Make sure a healthy service is reachable, starting one if needed.
    pub async fn ensure_running(&self) -> Result<(), CommonError> {
        if self.health_check().await {
            return Ok(());
        }
        self.start().await?;
        self.wait_healthy().await
    }

    /// Stop the owned service process, if any.
    pub async fn stop(&self) -> Result<(), CommonError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to stop embedding service");
        }
        info!("embedding service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_is_split_into_program_and_args() {
        let config =
            SupervisorConfig::from_command_line("python3 service.py --port 8765", "http://127.0.0.1:8765/")
                .unwrap();
        assert_eq!(config.program, "python3");
        assert_eq!(config.args, vec!["service.py", "--port", "8765"]);
        assert_eq!(config.health_url, "http://127.0.0.1:8765/health");
        assert!(SupervisorConfig::from_command_line("   ", "http://x").is_none());
    }

    #[tokio::test]
    async fn unreachable_service_fails_health_wait() {
        let config = SupervisorConfig {
            program: "true".to_string(),
            args: Vec::new(),
            // Port 9 (discard) on loopback is not expected to serve HTTP.
            health_url: "http://127.0.0.1:9/health".to_string(),
            startup_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
        };
        let supervisor = ServiceSupervisor::new(config).unwrap();
        assert!(!supervisor.health_check().await);
        let err = supervisor.wait_healthy().await.unwrap_err();
        assert!(matches!(err, CommonError::ServiceUnavailable { .. }));
        supervisor.stop().await.unwrap();
    }
}
