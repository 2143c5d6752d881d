mod args;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::LocalSet;
use tokio::{select, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

use crate::args::Args;
use xltop::config::{overlay, ConfigFile};
use xltop::conn::{ConnOps, Connection, DEFAULT_CTL_CHAR};
use xltop::refresh::{self, AggregatorRegistries, RefreshClient};
use xltop::server::{self, AggregatorShared, CTL_TABLE};

const DEFAULT_LISTEN: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
/// No default is evidenced in the filtered original source for the
/// aggregator's own bind ports (only the viewer's `--remote-port` default
/// of 9901 is); `9900`/`9901` are chosen so the control port matches that
/// viewer/agent default out of the box.
const DEFAULT_HTTP_PORT: u16 = 9900;
const DEFAULT_CTL_PORT: u16 = 9901;
const CTL_RD_BUF_SIZE: usize = 4096;
const CTL_WR_BUF_SIZE: usize = 4096;
const CTL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt().with_max_level(Level::TRACE).init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let config_file = match &args.conf {
        Some(path) => match ConfigFile::load(path) {
            Ok(c) => c,
            Err(error) => {
                error!(%error, "failed to load config file");
                return ExitCode::from(2);
            },
        },
        None => ConfigFile::default(),
    };

    let listen = overlay(args.listen, config_file.listen, DEFAULT_LISTEN);
    let port = overlay(args.port, config_file.port, DEFAULT_HTTP_PORT);
    let ctl_port = overlay(args.ctl_port, config_file.ctl_port, DEFAULT_CTL_PORT);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            }
            cancel.cancel();
        });
    }

    let regs = AggregatorRegistries::new();
    let shared = AggregatorShared::new(regs.clone());

    let http_addr = SocketAddr::from((listen, port));
    {
        let shared = shared.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            select! {
                result = server::serve(shared, http_addr) => {
                    if let Err(error) = result {
                        error!(%error, "http surface exited");
                    }
                },
                _ = cancel.cancelled() => {},
            }
        });
    }

    spawn_configured_refreshers(&config_file, &regs, &cancel).await;

    // The control port's `Connection` carries an `Rc<ConnOps<_>>`, so its
    // accept loop and per-connection tasks run on a `LocalSet` rather than
    // via plain `tokio::spawn` (§5's Rust realization note).
    let local = LocalSet::new();
    let ctl_addr = SocketAddr::from((listen, ctl_port));
    let exit_code = local
        .run_until(run_ctl_accept_loop(cancel, shared, ctl_addr))
        .await
        .map(|()| ExitCode::SUCCESS)
        .unwrap_or_else(|error| {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        });

    local.await;
    exit_code
}

/// Bootstraps and spawns one refresher task per config-file-listed
/// cluster/filesystem (§4.4). There is no CLI flag for these (§6's
/// aggregator flags have no room for a list of upstream sources).
async fn spawn_configured_refreshers(
    config_file: &ConfigFile,
    regs: &AggregatorRegistries,
    cancel: &CancellationToken,
) {
    for target in config_file.clusters.iter().flatten() {
        let client = RefreshClient::new(&target.base_url);
        let (interval, phase, size_hint) = match refresh::bootstrap_cluster(&client, &target.name).await {
            Ok(Some(v)) => v,
            Ok(None) => {
                warn!(cluster = %target.name, "no refresh interval reported, skipping");
                continue;
            },
            Err(error) => {
                error!(%error, cluster = %target.name, "failed to bootstrap cluster refresher");
                continue;
            },
        };

        regs.clusters.lock().unwrap().lookup_or_insert_with(&target.name, || {
            xltop::entity::Cluster {
                name: target.name.clone(),
                members: Vec::new(),
                interval: interval.as_secs_f64(),
                offset: phase.as_secs_f64(),
            }
        });
        regs.jobs.lock().unwrap().reserve(size_hint);

        let clus_name: Arc<str> = Arc::from(target.name.as_str());
        tokio::spawn(refresh::run_cluster_refresher(
            client,
            clus_name,
            regs.clone(),
            interval,
            phase,
            cancel.clone(),
        ));
    }

    for target in config_file.filesystems.iter().flatten() {
        let client = RefreshClient::new(&target.base_url);
        let fs_name: Arc<str> = Arc::from(target.name.as_str());
        tokio::spawn(refresh::run_fs_refresher(
            client,
            fs_name,
            regs.filesystems.clone(),
            Duration::from_secs(30),
            cancel.clone(),
        ));
    }
}

async fn run_ctl_accept_loop(
    cancel: CancellationToken,
    shared: AggregatorShared,
    addr: SocketAddr,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await.context("binding control port")?;
    info!(%addr, "control port listening");

    let ops = Rc::new(ConnOps {
        rd_buf_size: CTL_RD_BUF_SIZE,
        wr_buf_size: CTL_WR_BUF_SIZE,
        timeout: CTL_IDLE_TIMEOUT,
        ctl_char: DEFAULT_CTL_CHAR,
        ctl_table: CTL_TABLE,
        msg_cb: None,
    });
    ops.assert_ctl_table_sorted();

    loop {
        let (sock, peer) = select! {
            accept = listener.accept() => match accept {
                Ok(v) => v,
                Err(error) => {
                    warn!(%error, "failed to accept control connection");
                    continue;
                },
            },
            _ = cancel.cancelled() => return Ok(()),
        };

        let state = shared.query_state.clone();
        let ops = ops.clone();
        tokio::task::spawn_local(async move {
            let conn = Connection::new(sock, peer.to_string(), ops, state);
            let (_, outcome) = conn.run().await;
            debug!(%outcome, "control connection ended");
        });
    }
}
