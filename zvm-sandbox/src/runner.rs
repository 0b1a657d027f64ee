use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Error};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use zvm_dag::RunCode;

/// Extra time given to the sandbox past its declared timeout before the primary deadline is
/// considered expired, matching the grace period the reference implementation budgets for.
pub const GRACE: Duration = Duration::from_millis(500);

/// Something able to spawn the sandbox binary against a manifest, wait for it to exit, and return
/// the bounded output it produced.
pub trait SandboxRunner: Send + Sync {
    /// Run the sandbox against `manifest_path`, waiting up to `timeout + GRACE` for it to finish
    /// on its own before escalating to termination.
    fn run(
        &self,
        manifest_path: &Path,
        timeout: Duration,
        args: &[String],
    ) -> Result<(RunCode, Vec<u8>, Vec<u8>), Error>;
}

impl<S: SandboxRunner> SandboxRunner for Arc<S> {
    fn run(
        &self,
        manifest_path: &Path,
        timeout: Duration,
        args: &[String],
    ) -> Result<(RunCode, Vec<u8>, Vec<u8>), Error> {
        self.as_ref().run(manifest_path, timeout, args)
    }
}

/// Spawns the real sandbox executable as a child process.
#[derive(Debug, Clone)]
pub struct RealSandboxRunner {
    /// Path to the sandbox binary.
    pub exe: PathBuf,
    /// Stdout is truncated and the child killed once buffered output exceeds this many bytes.
    pub stdout_max: usize,
    /// Stderr is truncated and the child killed once buffered output exceeds this many bytes.
    pub stderr_max: usize,
    /// How long to wait after sending `SIGTERM` before escalating to `SIGKILL`.
    pub kill_timeout: Duration,
}

enum PipeEvent {
    Chunk(Vec<u8>),
    Eof,
    Err(std::io::Error),
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> Receiver<PipeEvent> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.send(PipeEvent::Eof);
                    return;
                }
                Ok(n) => {
                    if tx.send(PipeEvent::Chunk(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(PipeEvent::Err(e));
                    return;
                }
            }
        }
    });
    rx
}

#[derive(Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

enum DrainOutcome {
    /// Both pipes reached EOF before the deadline.
    Completed,
    /// Captured output crossed the configured bound.
    OutputTooLong,
    /// The deadline passed with at least one pipe still open.
    DeadlineExpired,
}

impl RealSandboxRunner {
    /// Read both pipes until they close, the deadline passes, or the output bound is crossed.
    /// Chunks already read stay in `captured` regardless of which outcome is returned.
    fn drain_until(
        &self,
        stdout_rx: &Receiver<PipeEvent>,
        stderr_rx: &Receiver<PipeEvent>,
        captured: &mut Captured,
        deadline: Instant,
    ) -> Result<DrainOutcome, Error> {
        let mut stdout_open = true;
        let mut stderr_open = true;
        loop {
            if !stdout_open && !stderr_open {
                return Ok(DrainOutcome::Completed);
            }
            if captured.stdout.len() > self.stdout_max || captured.stderr.len() > self.stderr_max {
                return Ok(DrainOutcome::OutputTooLong);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(DrainOutcome::DeadlineExpired);
            }
            // Alternate short waits on each pipe so one busy stream can't starve the other.
            let slice = (deadline - now).min(Duration::from_millis(50));
            if stdout_open {
                match stdout_rx.recv_timeout(slice) {
                    Ok(PipeEvent::Chunk(chunk)) => captured.stdout.extend(chunk),
                    Ok(PipeEvent::Eof) | Err(RecvTimeoutError::Disconnected) => stdout_open = false,
                    Ok(PipeEvent::Err(e)) => return Err(Error::from(e).context("reading sandbox stdout")),
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
            if stderr_open {
                match stderr_rx.recv_timeout(Duration::from_millis(0)) {
                    Ok(PipeEvent::Chunk(chunk)) => captured.stderr.extend(chunk),
                    Ok(PipeEvent::Eof) | Err(RecvTimeoutError::Disconnected) => stderr_open = false,
                    Ok(PipeEvent::Err(e)) => return Err(Error::from(e).context("reading sandbox stderr")),
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }

    fn terminate(&self, pid: u32) {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("Cannot send SIGTERM to sandbox pid {}: {:?}", pid, e);
        }
    }

    fn kill(&self, pid: u32) {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!("Cannot send SIGKILL to sandbox pid {}: {:?}", pid, e);
        }
    }
}

impl SandboxRunner for RealSandboxRunner {
    fn run(
        &self,
        manifest_path: &Path,
        timeout: Duration,
        args: &[String],
    ) -> Result<(RunCode, Vec<u8>, Vec<u8>), Error> {
        let mut child = Command::new(&self.exe)
            .args(args)
            .arg(manifest_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn sandbox executable {}", self.exe.display()))?;
        let pid = child.id();
        let stdout_pipe = child.stdout.take().expect("stdout was piped");
        let stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_rx = spawn_reader(stdout_pipe);
        let stderr_rx = spawn_reader(stderr_pipe);

        let mut captured = Captured::default();
        let deadline = Instant::now() + timeout + GRACE;
        trace!("Sandbox pid {} started, deadline in {:?}", pid, timeout + GRACE);

        match self.drain_until(&stdout_rx, &stderr_rx, &mut captured, deadline)? {
            DrainOutcome::Completed => {
                let status = child.wait().context("waiting for sandbox to exit")?;
                let code = if status.success() { RunCode::Ok } else { RunCode::Error };
                Ok((code, captured.stdout, captured.stderr))
            }
            DrainOutcome::OutputTooLong => {
                self.kill(pid);
                let _ = child.wait();
                Ok((RunCode::OutputTooLong, captured.stdout, captured.stderr))
            }
            DrainOutcome::DeadlineExpired => {
                info!("Sandbox pid {} exceeded its deadline, sending SIGTERM", pid);
                self.terminate(pid);
                let kill_deadline = Instant::now() + self.kill_timeout;
                match self.drain_until(&stdout_rx, &stderr_rx, &mut captured, kill_deadline)? {
                    DrainOutcome::Completed => {
                        let _ = child.wait();
                        Ok((RunCode::TimedOut, captured.stdout, captured.stderr))
                    }
                    DrainOutcome::OutputTooLong => {
                        self.kill(pid);
                        let _ = child.wait();
                        Ok((RunCode::OutputTooLong, captured.stdout, captured.stderr))
                    }
                    DrainOutcome::DeadlineExpired => {
                        warn!("Sandbox pid {} still alive after grace, sending SIGKILL", pid);
                        self.kill(pid);
                        let _ = child.wait();
                        Ok((RunCode::Killed, captured.stdout, captured.stderr))
                    }
                }
            }
        }
    }
}

/// A fake sandbox that doesn't spawn anything and always fails.
#[derive(Default, Debug)]
pub struct ErrorSandboxRunner;

impl SandboxRunner for ErrorSandboxRunner {
    fn run(&self, _: &Path, _: Duration, _: &[String]) -> Result<(RunCode, Vec<u8>, Vec<u8>), Error> {
        Err(anyhow::anyhow!("sandbox failed to start"))
    }
}

/// A fake sandbox that doesn't spawn anything and always reports `OK` with empty output.
#[derive(Default, Debug)]
pub struct SuccessSandboxRunner;

impl SandboxRunner for SuccessSandboxRunner {
    fn run(&self, _: &Path, _: Duration, _: &[String]) -> Result<(RunCode, Vec<u8>, Vec<u8>), Error> {
        Ok((RunCode::Ok, Vec::new(), Vec::new()))
    }
}

/// A fake sandbox whose canned stdout/stderr and run code are set up by the test.
#[derive(Debug, Clone)]
pub struct FakeSandboxRunner {
    /// The run code to report.
    pub code: RunCode,
    /// The stdout bytes to report.
    pub stdout: Vec<u8>,
    /// The stderr bytes to report.
    pub stderr: Vec<u8>,
}

impl SandboxRunner for FakeSandboxRunner {
    fn run(&self, _: &Path, _: Duration, _: &[String]) -> Result<(RunCode, Vec<u8>, Vec<u8>), Error> {
        Ok((self.code, self.stdout.clone(), self.stderr.clone()))
    }
}
