//! Entry point for `zerocloud-node`, the per-node execution middleware's HTTP server.

#[macro_use]
extern crate log;

mod node_store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use node_store::FsObjectStore;
use zvm_daemon::DaemonReaper;
use zvm_pool::ThreadPoolRegistry;
use zvm_sandbox::RealSandboxRunner;
use zvm_store::RealFilesystemOps;

/// Runs a single object node's in-situ execution middleware.
#[derive(Parser, Debug)]
#[clap(name = "zerocloud-node")]
struct Opt {
    /// Path to the INI-style node config file (`zerovm_*` keys).
    #[clap(long = "config", short = 'c')]
    config: PathBuf,

    /// Address to bind the HTTP server to.
    #[clap(long = "bind", default_value = "0.0.0.0:6543")]
    bind: String,

    /// Root directory under which committed object data and metadata are kept.
    ///
    /// Stands in for the out-of-scope object store; see [`node_store`].
    #[clap(long = "objects-dir")]
    objects_dir: PathBuf,

    /// Root directory temp areas are scoped under, one subdirectory per device.
    #[clap(long = "devices-root")]
    devices_root: PathBuf,

    /// Directory cached daemon sockets live under.
    #[clap(long = "sockets-dir", default_value = "/tmp/zvm-daemons")]
    sockets_dir: PathBuf,

    /// Verbose mode (-v, -vv, etc.).
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

#[cfg(target_os = "linux")]
fn default_reaper() -> Arc<dyn DaemonReaper> {
    Arc::new(zvm_daemon::ProcfsReaper)
}

#[cfg(not(target_os = "linux"))]
fn default_reaper() -> Arc<dyn DaemonReaper> {
    Arc::new(zvm_daemon::PidfileReaper { pidfile: PathBuf::from("/var/run/zerovm.daemon.pid") })
}

#[tokio::main]
async fn main() -> Result<()> {
    better_panic::install();
    let opt = Opt::parse();
    init_logging(opt.verbose);

    let config = zvm_exec::NodeConfig::load(&opt.config)
        .with_context(|| format!("Failed to load node config from {:?}", opt.config))?;

    std::fs::create_dir_all(&opt.sockets_dir)
        .with_context(|| format!("Failed to create sockets dir {:?}", opt.sockets_dir))?;
    std::fs::create_dir_all(&opt.devices_root)
        .with_context(|| format!("Failed to create devices root {:?}", opt.devices_root))?;

    let store = Arc::new(FsObjectStore::new(opt.objects_dir)?);
    let pools = Arc::new(
        ThreadPoolRegistry::new(config.pool_policies.clone())
            .context("Failed to build thread pool registry from zerovm_threadpools")?,
    );
    let sandbox = Arc::new(RealSandboxRunner {
        exe: config.zerovm_exename.clone(),
        stdout_max: config.zerovm_maxoutput as usize,
        stderr_max: config.zerovm_maxoutput as usize,
        kill_timeout: config.zerovm_kill_timeout,
    });

    let state = Arc::new(zvm_exec::AppState {
        config,
        lookup: store.clone(),
        sink: store.clone(),
        validation_sink: store,
        sandbox,
        pools,
        reaper: default_reaper(),
        sockets_dir: opt.sockets_dir,
        devices_root: opt.devices_root,
        fs: Arc::new(RealFilesystemOps),
    });

    let app = zvm_exec::router(state);
    let listener = tokio::net::TcpListener::bind(&opt.bind)
        .await
        .with_context(|| format!("Failed to bind {}", opt.bind))?;
    info!("zerocloud-node listening on {}", opt.bind);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await;
            info!("Shutting down");
        })
        .await
        .context("HTTP server exited with an error")?;

    Ok(())
}
