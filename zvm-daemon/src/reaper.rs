use std::path::Path;

use anyhow::Error;

/// Finds and kills whatever process currently holds a cached daemon's socket, so a new daemon can
/// bind it. Platform-specific; a non-Linux target can fall back to a pidfile.
pub trait DaemonReaper: Send + Sync {
    /// Kill the process holding `socket_path`, if any. Not finding a holder is not an error: the
    /// socket may already be orphaned.
    fn kill_holder(&self, socket_path: &Path) -> Result<(), Error>;
}

/// Identifies the daemon holding a socket by scanning `/proc/<pid>/fd` for a `socket:[inode]`
/// link matching the socket file's inode, restricted to processes named `zerovm.daemon`.
#[cfg(target_os = "linux")]
#[derive(Default, Debug)]
pub struct ProcfsReaper;

#[cfg(target_os = "linux")]
impl DaemonReaper for ProcfsReaper {
    fn kill_holder(&self, socket_path: &Path) -> Result<(), Error> {
        use std::os::unix::fs::MetadataExt;

        let inode = match std::fs::metadata(socket_path) {
            Ok(meta) => meta.ino(),
            Err(_) => return Ok(()),
        };
        let target = format!("socket:[{inode}]");

        let Ok(procs) = std::fs::read_dir("/proc") else {
            return Ok(());
        };
        for entry in procs.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<i32>().ok())
            else {
                continue;
            };
            let comm = std::fs::read_to_string(entry.path().join("comm")).unwrap_or_default();
            if comm.trim() != "zerovm.daemon" {
                continue;
            }
            let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                if std::fs::read_link(fd.path())
                    .map(|link| link.to_string_lossy() == target)
                    .unwrap_or(false)
                {
                    kill(pid);
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn kill(pid: i32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
        warn!("Failed to kill stale daemon holding socket (pid {}): {:?}", pid, e);
    } else {
        info!("Killed stale daemon process (pid {})", pid);
    }
}

/// Identifies the daemon holding a socket by a pidfile written alongside it, for platforms
/// without `/proc`.
#[derive(Debug, Clone)]
pub struct PidfileReaper {
    /// Path to the pidfile containing the daemon's PID as decimal text.
    pub pidfile: std::path::PathBuf,
}

impl DaemonReaper for PidfileReaper {
    fn kill_holder(&self, _socket_path: &Path) -> Result<(), Error> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let Ok(content) = std::fs::read_to_string(&self.pidfile) else {
            return Ok(());
        };
        if let Ok(pid) = content.trim().parse::<i32>() {
            if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!("Failed to kill stale daemon pid {} from pidfile: {:?}", pid, e);
            }
        }
        let _ = std::fs::remove_file(&self.pidfile);
        Ok(())
    }
}
