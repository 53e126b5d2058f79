//! Next hops reached through a child process speaking on stdin/stdout

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, warn};

use super::{Connector, ConnectorType, TransportLeg};
use crate::error::ConnectError;
use crate::invocation::NextHop;

/// Connects through `qrexec-client-vm <domain> <service[+args]>`
#[derive(Debug, Clone)]
pub struct QrexecConnector {
    program: PathBuf,
}

impl QrexecConnector {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

#[async_trait]
impl Connector for QrexecConnector {
    async fn connect(&self, hop: &NextHop) -> Result<TransportLeg, ConnectError> {
        let args = vec![hop.domain.clone(), hop.call()];
        spawn_leg(&self.program, &args, format!("{}:{}", hop.domain, hop.call()))
    }

    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Qrexec
    }
}

/// Runs an arbitrary program as the next hop
///
/// `{domain}`, `{service}` and `{call}` inside arguments are replaced with
/// the next hop's values. Useful outside Qubes OS and in tests.
#[derive(Debug, Clone)]
pub struct CommandConnector {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandConnector {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    fn render_args(&self, hop: &NextHop) -> Vec<String> {
        let call = hop.call();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{domain}", &hop.domain)
                    .replace("{service}", &hop.service)
                    .replace("{call}", &call)
            })
            .collect()
    }
}

#[async_trait]
impl Connector for CommandConnector {
    async fn connect(&self, hop: &NextHop) -> Result<TransportLeg, ConnectError> {
        let args = self.render_args(hop);
        spawn_leg(&self.program, &args, format!("{}:{}", hop.domain, hop.call()))
    }

    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Command
    }
}

fn spawn_leg(program: &Path, args: &[String], label: String) -> Result<TransportLeg, ConnectError> {
    debug!(program = %program.display(), ?args, "Spawning next hop");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        // logged, not inherited: inherited stderr reaches the calling domain
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| ConnectError::Spawn {
        program: program.display().to_string(),
        source,
    })?;

    let stdin = child.stdin.take().ok_or(ConnectError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(ConnectError::MissingPipe("stdout"))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_stderr(stderr, label.clone()));
    }

    Ok(TransportLeg::new(label, stdout, stdin).with_process(child))
}

async fn forward_stderr(stderr: ChildStderr, label: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => warn!(hop = %label, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(hop = %label, error = %e, "Stopped reading next hop stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn hop() -> NextHop {
        NextHop {
            domain: "work".into(),
            service: "qubes.Filecopy".into(),
            arguments: vec!["a".into()],
        }
    }

    #[test]
    fn test_render_args() {
        let connector = CommandConnector::new(
            PathBuf::from("echo"),
            vec!["{domain}".into(), "--svc={service}".into(), "{call}".into()],
        );
        assert_eq!(
            connector.render_args(&hop()),
            vec!["work", "--svc=qubes.Filecopy", "qubes.Filecopy+a"]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let connector = QrexecConnector::new(PathBuf::from("/nonexistent/qrexec-client-vm"));
        let err = connector.connect(&hop()).await.unwrap_err();
        assert!(matches!(err, ConnectError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_leg_round_trip() {
        let connector = CommandConnector::new(PathBuf::from("cat"), vec![]);
        let leg = connector.connect(&hop()).await.unwrap();
        assert!(leg.has_process());
        assert_eq!(leg.label(), "work:qubes.Filecopy+a");

        let (mut reader, mut writer, child) = leg.into_parts();
        writer.write_all(b"mirror me").await.unwrap();
        drop(writer);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"mirror me");

        let status = child.unwrap().wait().await.unwrap();
        assert!(status.success());
    }
}
