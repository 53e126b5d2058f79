use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

use crate::config::ConnectorConfig;
use crate::error::ConnectError;
use crate::invocation::NextHop;

pub mod process;

pub use process::{CommandConnector, QrexecConnector};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorType {
    Qrexec,
    Command,
    Custom,
}

/// One established transport leg: a readable and a writable byte stream,
/// optionally backed by a child process that must be supervised
pub struct TransportLeg {
    label: String,
    reader: BoxedReader,
    writer: BoxedWriter,
    process: Option<Child>,
}

impl TransportLeg {
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            label: label.into(),
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: None,
        }
    }

    /// Split a duplex stream into a leg
    pub fn from_stream<S>(label: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(label, reader, writer)
    }

    /// The qrexec channel of the calling domain: stdin and stdout
    ///
    /// Closing the writer closes the caller's end of stdout, so the caller
    /// sees end of stream while the proxy is still running.
    pub fn stdio() -> io::Result<Self> {
        Ok(Self::new("stdio", tokio::io::stdin(), owned_stdout()?))
    }

    pub fn with_process(mut self, child: Child) -> Self {
        self.process = Some(child);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    pub(crate) fn into_parts(self) -> (BoxedReader, BoxedWriter, Option<Child>) {
        (self.reader, self.writer, self.process)
    }
}

/// Move stdout to a descriptor owned by the returned writer and point fd 1
/// at `/dev/null`. `tokio::io::stdout()` never closes fd 1.
#[cfg(unix)]
fn owned_stdout() -> io::Result<tokio::fs::File> {
    use std::os::fd::{AsFd, AsRawFd};

    let stdout = io::stdout();
    let owned = stdout.as_fd().try_clone_to_owned()?;
    let null = std::fs::OpenOptions::new().write(true).open("/dev/null")?;
    nix::unistd::dup2(null.as_raw_fd(), stdout.as_raw_fd())?;
    Ok(tokio::fs::File::from_std(std::fs::File::from(owned)))
}

#[cfg(not(unix))]
fn owned_stdout() -> io::Result<tokio::io::Stdout> {
    Ok(tokio::io::stdout())
}

impl fmt::Debug for TransportLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLeg")
            .field("label", &self.label)
            .field("process", &self.process.as_ref().and_then(Child::id))
            .finish_non_exhaustive()
    }
}

/// Establishes the outbound leg towards a next hop
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, hop: &NextHop) -> Result<TransportLeg, ConnectError>;
    fn connector_type(&self) -> ConnectorType;
}

pub fn create_connector(config: &ConnectorConfig) -> Arc<dyn Connector> {
    match config {
        ConnectorConfig::Qrexec { program } => Arc::new(QrexecConnector::new(program.clone())),
        ConnectorConfig::Command { program, args } => {
            Arc::new(CommandConnector::new(program.clone(), args.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_create_connector() {
        let qrexec = create_connector(&ConnectorConfig::default());
        assert_eq!(qrexec.connector_type(), ConnectorType::Qrexec);

        let command = create_connector(&ConnectorConfig::Command {
            program: PathBuf::from("cat"),
            args: vec![],
        });
        assert_eq!(command.connector_type(), ConnectorType::Command);
    }

    #[tokio::test]
    async fn test_leg_from_stream() {
        let (near, mut far) = tokio::io::duplex(64);
        let leg = TransportLeg::from_stream("memory", near);
        assert_eq!(leg.label(), "memory");
        assert!(!leg.has_process());

        let (mut reader, mut writer, process) = leg.into_parts();
        assert!(process.is_none());

        writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        far.write_all(b"pong").await.unwrap();
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
