//! foris-daemon binary: CLI parsing, startup wiring and shutdown.
//!
//! Startup order: tracing, controller identity, lock backend (decided
//! by the transport), daemon context, module registry, advertisement
//! loop, transport. Shutdown is signal driven: SIGINT or SIGTERM stops
//! the transport, terminates live async tasks and lets the advertiser
//! publish its final `exited` advertisement.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use foris_core::exec;
use foris_core::files::FileStore;
use foris_core::locks::LockBackend;
use foris_daemon::advertize::Advertizer;
use foris_daemon::federation::is_controller_id;
use foris_daemon::registry::Registry;
use foris_daemon::state::{Backend, DaemonContext, MOCK_CONTROLLER_ID};
use foris_daemon::transports::{mqtt, ubus, unix_socket};
use foris_daemon::modules;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Directory for cross-process lock files (ubus transport).
const LOCK_DIR: &str = "/var/lock/foris-controller";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Openwrt,
    Mock,
}

impl From<BackendArg> for Backend {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Openwrt => Self::Openwrt,
            BackendArg::Mock => Self::Mock,
        }
    }
}

#[derive(Debug, Subcommand)]
enum TransportCmd {
    /// Length-framed JSON over a unix-domain stream socket.
    UnixSocket {
        /// Socket path to bind.
        #[arg(long, default_value_os_t = unix_socket::default_socket_path())]
        path: PathBuf,
    },
    /// The system RPC bus; one object per module.
    Ubus {
        /// Serialize dispatch to one in-flight request.
        #[arg(long)]
        single: bool,
        /// Bus daemon socket.
        #[arg(long, default_value_os_t = ubus::default_socket_path())]
        socket: PathBuf,
    },
    /// The pub/sub broker with per-controller topic namespaces.
    Mqtt {
        /// Broker host.
        #[arg(long)]
        host: String,
        /// Broker port.
        #[arg(long, default_value_t = 11883)]
        port: u16,
        /// This node's 16-hex-digit controller ID.
        #[arg(long)]
        controller_id: String,
    },
}

/// Router-management control plane daemon.
#[derive(Debug, Parser)]
#[command(name = "foris-daemon", version, about)]
struct Cli {
    /// Handler variant to run with.
    #[arg(long, value_enum, default_value_t = BackendArg::Openwrt)]
    backend: BackendArg,

    /// Verbose logging plus outbound message validation.
    #[arg(long)]
    debug: bool,

    /// Restrict the loaded modules (comma separated).
    #[arg(long, value_delimiter = ',')]
    modules: Option<Vec<String>>,

    #[command(subcommand)]
    transport: TransportCmd,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let backend = Backend::from(cli.backend);
    let controller_id = resolve_controller_id(backend, &cli.transport).await?;
    info!(%controller_id, ?backend, "starting control plane");

    let lock_backend = match &cli.transport {
        // Bus deployments may run sibling daemon processes against the
        // same external state; everything else stays in-process.
        TransportCmd::Ubus { .. } => {
            std::fs::create_dir_all(LOCK_DIR)
                .with_context(|| format!("failed to create lock directory '{LOCK_DIR}'"))?;
            LockBackend::CrossProcess {
                dir: PathBuf::from(LOCK_DIR),
            }
        }
        _ => LockBackend::InProcess,
    };

    let context = DaemonContext::new(controller_id.clone(), backend, cli.debug, lock_backend);
    let handlers = modules::build(&context, cli.modules.as_deref())
        .context("module registry construction failed")?;
    let registry = Arc::new(
        Registry::new(
            handlers,
            context.hub.clone(),
            Arc::clone(&context.locks),
            cli.debug,
        )
        .context("schema composition failed")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let advertizer = Advertizer::new(
        Arc::clone(&registry),
        FileStore::new(),
        controller_id.clone(),
    )
    .spawn(shutdown_rx.clone());

    let transport = {
        let registry = Arc::clone(&registry);
        let shutdown_rx = shutdown_rx.clone();
        match cli.transport {
            TransportCmd::UnixSocket { path } => tokio::spawn(async move {
                unix_socket::serve(&path, registry, shutdown_rx).await
            }),
            TransportCmd::Ubus { single, socket } => tokio::spawn(async move {
                ubus::serve(&socket, registry, single, shutdown_rx).await
            }),
            TransportCmd::Mqtt {
                host,
                port,
                controller_id,
            } => tokio::spawn(async move {
                mqtt::serve(
                    mqtt::MqttConfig {
                        host,
                        port,
                        controller_id,
                    },
                    registry,
                    false,
                    shutdown_rx,
                )
                .await
            }),
        }
    };

    wait_for_termination().await;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    // Live async tasks are terminated and reaped before the final
    // advertisement goes out.
    context.tasks.shutdown().await;
    let _ = advertizer.await;
    match transport.await {
        Ok(result) => result?,
        Err(error) => warn!(%error, "transport task aborted"),
    }
    info!("orderly shutdown complete");
    Ok(())
}

/// Resolve this node's controller identity for the chosen transport.
async fn resolve_controller_id(
    backend: Backend,
    transport: &TransportCmd,
) -> anyhow::Result<String> {
    if let TransportCmd::Mqtt { controller_id, .. } = transport {
        anyhow::ensure!(
            is_controller_id(controller_id),
            "'{controller_id}' is not a 16-hex-digit controller ID"
        );
        return Ok(controller_id.to_lowercase());
    }
    if backend == Backend::Mock {
        return Ok(MOCK_CONTROLLER_ID.to_string());
    }
    match exec::run(Path::new("/usr/bin/atsha204cmd"), &["serial-number"], None).await {
        Ok(output) if output.success() => {
            let serial = output.stdout.trim().to_lowercase();
            if is_controller_id(&serial) {
                return Ok(serial);
            }
            warn!(%serial, "crypto chip returned a malformed serial");
        }
        Ok(output) => warn!(exit_code = output.exit_code, "serial-number command failed"),
        Err(error) => warn!(%error, "serial-number command unavailable"),
    }
    Ok("0000000000000000".to_string())
}

async fn wait_for_termination() {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%error, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%error, "cannot listen for SIGTERM");
            std::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}
