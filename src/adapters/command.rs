//! Subprocess collaborators.
//!
//! Sensors and launchers are external programs. A sensor prints one
//! opportunity JSON object per line on stdout. A launcher receives the
//! opportunity JSON on stdin and prints the artifact (URL, path, id) on
//! stdout; empty output means "nothing produced".

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{Launcher, Sensor};
use crate::config::{LauncherConfig, SensorConfig};
use crate::core::OpportunityMachine;
use crate::domain::{NewOpportunity, Opportunity};

/// Spawn `program args...`, feed `input` on stdin, return stdout
async fn run_command(
    program: &str,
    args: &[String],
    input: Option<&str>,
    limit: Duration,
) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", program))?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin
            .write_all(input.as_bytes())
            .await
            .with_context(|| format!("Failed to write to '{}' stdin", program))?;
        // Dropping stdin signals EOF
    }

    let output = timeout(limit, child.wait_with_output())
        .await
        .with_context(|| format!("'{}' timed out after {:?}", program, limit))?
        .with_context(|| format!("Failed to wait for '{}'", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        anyhow::bail!(
            "'{}' failed with exit code {}: {}",
            program,
            exit_code,
            stderr.trim()
        );
    }

    String::from_utf8(output.stdout).with_context(|| format!("'{}' output is not valid UTF-8", program))
}

/// Sensor backed by an external command
pub struct CommandSensor {
    config: SensorConfig,
    machine: OpportunityMachine,
}

impl CommandSensor {
    pub fn new(config: SensorConfig, machine: OpportunityMachine) -> Self {
        Self { config, machine }
    }
}

#[async_trait]
impl Sensor for CommandSensor {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn sense(&self) -> Result<()> {
        let stdout = run_command(
            &self.config.command,
            &self.config.args,
            None,
            Duration::from_secs(self.config.timeout_secs),
        )
        .await?;

        let mut inserted = 0usize;
        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match serde_json::from_str::<NewOpportunity>(line) {
                Ok(new) => {
                    self.machine.insert(new).await?;
                    inserted += 1;
                }
                Err(e) => warn!(sensor = %self.config.name, error = %e, "Skipping malformed line"),
            }
        }

        debug!(sensor = %self.config.name, inserted, "Sensor finished");
        Ok(())
    }
}

/// Launcher backed by an external command.
///
/// Invoked as `command args... validate` or `command args... build`.
pub struct CommandLauncher {
    config: LauncherConfig,
}

impl CommandLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    async fn invoke(&self, phase: &str, opportunity: &Opportunity) -> Result<Option<String>> {
        let input = serde_json::to_string(opportunity).context("Failed to serialize opportunity")?;
        let mut args = self.config.args.clone();
        args.push(phase.to_string());

        let stdout = run_command(
            &self.config.command,
            &args,
            Some(&input),
            Duration::from_secs(self.config.timeout_secs),
        )
        .await?;

        let artifact = stdout.trim();
        Ok((!artifact.is_empty()).then(|| artifact.to_string()))
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch_validation(&self, opportunity: &Opportunity) -> Result<Option<String>> {
        self.invoke("validate", opportunity).await
    }

    async fn build_final(&self, opportunity: &Opportunity) -> Result<Option<String>> {
        self.invoke("build", opportunity).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::OpportunityStatus;
    use crate::policy::Policy;
    use crate::store::Store;

    fn sh(script: &str) -> (String, Vec<String>) {
        ("sh".to_string(), vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_sensor_inserts_each_line() {
        let store = Store::open_in_memory().unwrap();
        let machine = OpportunityMachine::new(store, Policy::in_memory());

        let (command, args) = sh(
            r#"echo '{"title":"Invoice OCR","source":"hn","scores":{"viability":62}}'
               echo 'not json'
               echo '{"title":"Churn alerts","source":"reddit"}'"#,
        );
        let sensor = CommandSensor::new(
            SensorConfig {
                name: "test".to_string(),
                command,
                args,
                timeout_secs: 10,
            },
            machine.clone(),
        );

        sensor.sense().await.unwrap();
        let new = machine.list(OpportunityStatus::New).await.unwrap();
        assert_eq!(new.len(), 2);
        assert_eq!(new[0].title, "Invoice OCR");
    }

    #[tokio::test]
    async fn test_launcher_reads_artifact_and_phase() {
        let (command, args) = sh(r#"cat > /dev/null; echo "https://example.com/$0""#);
        let launcher = CommandLauncher::new(LauncherConfig {
            command,
            args,
            timeout_secs: 10,
        });

        let store = Store::open_in_memory().unwrap();
        let machine = OpportunityMachine::new(store, Policy::in_memory());
        let opp = machine
            .insert(NewOpportunity::new("Invoice OCR", "hn"))
            .await
            .unwrap();

        let artifact = launcher.launch_validation(&opp).await.unwrap();
        assert_eq!(artifact.as_deref(), Some("https://example.com/validate"));
    }

    #[tokio::test]
    async fn test_empty_output_is_none_and_failure_is_error() {
        let store = Store::open_in_memory().unwrap();
        let machine = OpportunityMachine::new(store, Policy::in_memory());
        let opp = machine
            .insert(NewOpportunity::new("Invoice OCR", "hn"))
            .await
            .unwrap();

        let (command, args) = sh("cat > /dev/null");
        let quiet = CommandLauncher::new(LauncherConfig {
            command,
            args,
            timeout_secs: 10,
        });
        assert!(quiet.build_final(&opp).await.unwrap().is_none());

        let (command, args) = sh("cat > /dev/null; echo boom >&2; exit 3");
        let failing = CommandLauncher::new(LauncherConfig {
            command,
            args,
            timeout_secs: 10,
        });
        let err = failing.build_final(&opp).await.unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
    }
}
