use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use zvm_dag::RunCode;
use zvm_sandbox::{SandboxRunner, GRACE};

use crate::reaper::DaemonReaper;
use crate::wire::{self, FRAME_PREFIX_LEN};

/// Why a request to a cached daemon failed.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Could not connect to the daemon's socket.
    #[error("Failed to connect to daemon socket {path}: {source}")]
    Connect {
        /// The socket path that refused the connection.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A read or write on an established connection failed.
    #[error("I/O error talking to daemon: {0}")]
    Io(#[from] std::io::Error),
    /// The connection was established but no complete response arrived before the deadline.
    #[error("Timed out waiting for a response from the daemon")]
    Timeout,
    /// The response did not follow the length-prefixed framing the daemon is expected to use.
    #[error("Malformed response from daemon: {0}")]
    Protocol(String),
    /// The daemon was unreachable even after a kill-and-reboot attempt.
    #[error("Daemon unreachable after restart attempt")]
    Terminal,
}

/// Talks to a cached, long-lived sandbox process over its Unix domain socket, restarting it once
/// via a [`DaemonReaper`] and a [`SandboxRunner`] if the initial connection fails.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    /// Path to the daemon's listening socket.
    pub socket_path: PathBuf,
    /// Responses larger than this are rejected before their body is read.
    pub stdout_max: usize,
}

impl DaemonClient {
    /// Send `manifest` to the daemon and return its run code and report bytes. `timeout` bounds
    /// how long the sandbox itself is allowed to take; the socket deadline is `timeout + GRACE`.
    pub fn send_manifest(
        &self,
        manifest: &[u8],
        timeout: Duration,
    ) -> Result<(RunCode, Vec<u8>), DaemonError> {
        let deadline = timeout + GRACE;
        let mut stream =
            UnixStream::connect(&self.socket_path).map_err(|source| DaemonError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;
        self.exchange(&mut stream, manifest, deadline)
    }

    /// Reconnect a daemon that failed to respond: ask `reaper` to kill whatever holds the stale
    /// socket, remove the socket file, boot a fresh daemon with `runner` in standalone mode, and
    /// retry the connection exactly once. A second failure is terminal.
    pub fn ensure_connected(
        &self,
        reaper: &dyn DaemonReaper,
        runner: &dyn SandboxRunner,
        boot_manifest: &Path,
        boot_timeout: Duration,
    ) -> Result<(), DaemonError> {
        if let Err(e) = reaper.kill_holder(&self.socket_path) {
            warn!("Failed to reap stale daemon holder at {:?}: {:?}", self.socket_path, e);
        }
        let _ = std::fs::remove_file(&self.socket_path);
        runner
            .run(boot_manifest, boot_timeout, &[])
            .map_err(|_| DaemonError::Terminal)?;
        UnixStream::connect(&self.socket_path)
            .map(|_| ())
            .map_err(|_| DaemonError::Terminal)
    }

    fn exchange(
        &self,
        stream: &mut UnixStream,
        manifest: &[u8],
        deadline: Duration,
    ) -> Result<(RunCode, Vec<u8>), DaemonError> {
        stream.set_read_timeout(Some(deadline))?;
        stream.set_write_timeout(Some(deadline))?;

        stream.write_all(&wire::frame(manifest))?;

        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        read_exact_mapping_timeout(stream, &mut prefix)?;
        let size = wire::parse_length(&prefix)
            .ok_or_else(|| DaemonError::Protocol("response length prefix was not hex".into()))?;
        if size > self.stdout_max {
            return Ok((RunCode::OutputTooLong, Vec::new()));
        }

        let mut body = vec![0u8; size];
        read_exact_mapping_timeout(stream, &mut body)?;
        Ok((RunCode::Ok, body))
    }
}

fn read_exact_mapping_timeout(stream: &mut UnixStream, buf: &mut [u8]) -> Result<(), DaemonError> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
            Err(DaemonError::Timeout)
        }
        Err(e) => Err(DaemonError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    #[test]
    fn send_manifest_round_trips_a_report_through_a_fake_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut prefix = [0u8; FRAME_PREFIX_LEN];
            conn.read_exact(&mut prefix).unwrap();
            let len = wire::parse_length(&prefix).unwrap();
            let mut manifest = vec![0u8; len];
            conn.read_exact(&mut manifest).unwrap();
            assert_eq!(manifest, b"Version = 20330611\n");
            conn.write_all(&wire::frame(b"report body")).unwrap();
        });

        let client = DaemonClient {
            socket_path,
            stdout_max: 65536,
        };
        let (code, report) = client
            .send_manifest(b"Version = 20330611\n", Duration::from_secs(1))
            .unwrap();
        assert_eq!(code, RunCode::Ok);
        assert_eq!(report, b"report body");
        server.join().unwrap();
    }

    #[test]
    fn send_manifest_rejects_an_oversized_response_without_reading_its_body() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut prefix = [0u8; FRAME_PREFIX_LEN];
            conn.read_exact(&mut prefix).unwrap();
            let len = wire::parse_length(&prefix).unwrap();
            let mut manifest = vec![0u8; len];
            conn.read_exact(&mut manifest).unwrap();
            conn.write_all(wire::length_prefix(1_000_000).as_bytes()).unwrap();
        });

        let client = DaemonClient {
            socket_path,
            stdout_max: 10,
        };
        let (code, report) = client.send_manifest(b"m", Duration::from_secs(1)).unwrap();
        assert_eq!(code, RunCode::OutputTooLong);
        assert!(report.is_empty());
        server.join().unwrap();
    }

    #[test]
    fn send_manifest_fails_to_connect_when_no_daemon_is_listening() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("nobody-home.sock");
        let client = DaemonClient {
            socket_path,
            stdout_max: 65536,
        };
        let err = client.send_manifest(b"m", Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, DaemonError::Connect { .. }));
    }

    struct NoopReaper;
    impl DaemonReaper for NoopReaper {
        fn kill_holder(&self, _socket_path: &Path) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    #[test]
    fn ensure_connected_is_terminal_when_the_rebooted_daemon_never_binds() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let client = DaemonClient {
            socket_path,
            stdout_max: 65536,
        };
        let runner = zvm_sandbox::SuccessSandboxRunner;
        let err = client
            .ensure_connected(
                &NoopReaper,
                &runner,
                Path::new("boot-manifest"),
                Duration::from_millis(100),
            )
            .unwrap_err();
        assert!(matches!(err, DaemonError::Terminal));
    }
}
