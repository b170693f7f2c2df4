//! Transport layer implementations
//!
//! A transport is just a duplex byte stream. Framing (one JSON value per
//! line) is applied by [`crate::peer::RpcPeer`].

use std::io;
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::debug;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Duplex stream to an agent process
pub struct Transport {
    reader: BoxedReader,
    writer: BoxedWriter,
    child: Option<Child>,
    label: String,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("label", &self.label)
            .field("has_child", &self.child.is_some())
            .finish()
    }
}

impl Transport {
    /// Wrap an arbitrary reader/writer pair (sockets, in-memory pipes)
    pub fn from_io<R, W>(reader: R, writer: W, label: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
            label: label.into(),
        }
    }

    /// Spawn a subprocess and talk to it over stdin/stdout.
    ///
    /// Stderr lines are forwarded to the log at debug level.
    pub fn spawn(command: &str, args: &[String], cwd: Option<&Path>) -> io::Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("Failed to capture stdout"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("Failed to capture stdin"))?;

        if let Some(stderr) = child.stderr.take() {
            let name = command.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "agentlink_rpc::stderr", "[{}] {}", name, line);
                }
            });
        }

        let label = format!("{} {}", command, args.join(" "));
        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
            label: label.trim_end().to_string(),
        })
    }

    /// Connect to an agent listening on a TCP socket
    pub async fn connect_tcp(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self::from_io(reader, writer, format!("tcp://{}", addr)))
    }

    /// Human-readable description used in logs
    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn into_parts(self) -> (BoxedReader, BoxedWriter, Option<Child>) {
        (self.reader, self.writer, self.child)
    }
}
