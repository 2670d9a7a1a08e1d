// plexbackup/src/backup/service.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

/// Stops and starts the service whose data is being backed up.
#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn stop(&self, service: &str) -> Result<()>;
    async fn start(&self, service: &str) -> Result<()>;
}

/// Controls a systemd unit through `systemctl`, optionally via `sudo`.
#[derive(Debug, Clone)]
pub struct Systemctl {
    use_sudo: bool,
}

impl Systemctl {
    pub fn new(use_sudo: bool) -> Self {
        Systemctl { use_sudo }
    }

    fn command(&self, verb: &str, service: &str) -> Command {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("systemctl");
            cmd
        } else {
            Command::new("systemctl")
        };
        cmd.arg(verb)
            .arg(service)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, verb: &str, service: &str) -> Result<()> {
        let output = self
            .command(verb, service)
            .output()
            .await
            .with_context(|| format!("Failed to execute systemctl {} {}", verb, service))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "systemctl {} {} exited with {}: {}",
                verb,
                service,
                output.status,
                stderr.trim()
            );
        }
        tracing::info!(service, action = verb, "service state changed");
        Ok(())
    }
}

#[async_trait]
impl ServiceController for Systemctl {
    async fn stop(&self, service: &str) -> Result<()> {
        self.run("stop", service).await
    }

    async fn start(&self, service: &str) -> Result<()> {
        self.run("start", service).await
    }
}
