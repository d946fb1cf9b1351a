//! SSH command execution against remote nodes.
//!
//! Used by the node pool to open socket-forwarding tunnels and by the
//! provisioner to bootstrap fresh instances. Connection parameters are
//! validated up front so nothing shell-hostile ever reaches the command
//! line; the remote command itself is escaped as a single argument.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use shell_escape::escape;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Result, RuntimeError};

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// A validated SSH destination.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
}

impl SshTarget {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let host = host.into();
        let user = user.into();
        validate_hostname(&host)?;
        validate_username(&user)?;
        if port == 0 {
            return Err(RuntimeError::Ssh {
                host,
                reason: "port 0 is not dialable".to_string(),
            });
        }
        Ok(Self {
            host,
            port,
            user,
            key_path: key_path.into(),
        })
    }

    /// Options common to every invocation. Host keys are accepted on first
    /// contact: freshly provisioned instances are never in `known_hosts`.
    fn base_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"),
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-p".to_string(),
            self.port.to_string(),
            format!("{}@{}", self.user, self.host),
        ]
    }

    /// Run one remote command, capturing stdout. The command is passed as a
    /// single escaped argument to the remote shell.
    pub async fn run(&self, command: &str, deadline: Duration) -> Result<String> {
        let escaped: Cow<'_, str> = escape(command.into());
        let mut cmd = Command::new("ssh");
        cmd.args(self.base_args())
            .arg("--")
            .arg("sh")
            .arg("-c")
            .arg(escaped.as_ref())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(host = %self.host, %command, "running remote command");
        let output = timeout(deadline, cmd.output())
            .await
            .map_err(|_| RuntimeError::Timeout {
                operation: format!("ssh {}", self.host),
                seconds: deadline.as_secs(),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::Ssh {
                host: self.host.clone(),
                reason: format!(
                    "exit {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Retry a trivial command until the host answers or `overall` lapses.
    /// First boot of a cloud instance can take a while to accept sessions.
    pub async fn wait_ready(&self, per_attempt: Duration, overall: Duration) -> Result<()> {
        let started = tokio::time::Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.run("true", per_attempt).await {
                Ok(_) => return Ok(()),
                Err(err) if started.elapsed() < overall => {
                    warn!(host = %self.host, attempt, %err, "ssh not ready yet");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Err(err) => {
                    return Err(RuntimeError::Ssh {
                        host: self.host.clone(),
                        reason: format!("never became reachable: {err}"),
                    });
                }
            }
        }
    }
}

pub fn validate_hostname(host: &str) -> Result<()> {
    let ok = !host.is_empty()
        && host.len() <= 253
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-._:".contains(c));
    if ok {
        Ok(())
    } else {
        Err(RuntimeError::Ssh {
            host: host.to_string(),
            reason: "invalid hostname".to_string(),
        })
    }
}

pub fn validate_username(user: &str) -> Result<()> {
    let ok = !user.is_empty()
        && user.len() <= 32
        && user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-._".contains(c));
    if ok {
        Ok(())
    } else {
        Err(RuntimeError::Ssh {
            host: user.to_string(),
            reason: "invalid username".to_string(),
        })
    }
}

/// Write private key material to a mode-0600 file that disappears on drop.
pub fn write_key_file(dir: &Path, key: &str) -> Result<tempfile::TempPath> {
    use std::io::Write as _;
    let mut file = tempfile::Builder::new()
        .prefix("hoster-key-")
        .tempfile_in(dir)?;
    file.write_all(key.as_bytes())?;
    if !key.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostnames_with_shell_metacharacters_rejected() {
        for bad in ["host;rm -rf /", "host$(id)", "host`id`", "host|x", "", "a b"] {
            assert!(validate_hostname(bad).is_err(), "{bad:?} must be rejected");
        }
        for good in ["203.0.113.10", "node-1.example.com", "fe80::1"] {
            assert!(validate_hostname(good).is_ok(), "{good:?} must be accepted");
        }
    }

    #[test]
    fn usernames_validated() {
        assert!(validate_username("root").is_ok());
        assert!(validate_username("deploy-bot").is_ok());
        assert!(validate_username("bad;user").is_err());
        assert!(validate_username("").is_err());
    }

    #[test]
    fn target_rejects_port_zero() {
        assert!(SshTarget::new("h.example.com", 0, "root", "/tmp/k").is_err());
    }

    #[test]
    fn key_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_key_file(dir.path(), "PRIVATE KEY MATERIAL").unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "PRIVATE KEY MATERIAL\n");
    }
}
