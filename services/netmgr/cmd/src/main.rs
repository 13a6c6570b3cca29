//! netmgr demo binary.
//!
//! Runs an echo server over one of the four transports, or with `--query`
//! sends a single message to a server and prints the reply. DNS transports
//! echo whole messages; plain TCP and TLS echo whatever bytes arrive.

use anyhow::{Context, Result};
use clap::Parser;
use netmgr_transport::{
    Listener, NetError, NetManager, NetResult, NmHandle, Quota, TlsClientCtx, TlsServerCtx,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::{AppConfig, Transport};
use logging::NetmgrLogFormatter;

/// DNS-framed echo server and client
#[derive(Parser, Debug)]
#[command(name = "netmgr", version, about = "Echo server and client over TCP, TLS, DNS-over-TCP and DNS-over-TLS")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "netmgr.yaml")]
    config: PathBuf,

    /// Transport to serve or query with
    #[arg(long, value_enum)]
    transport: Option<Transport>,

    /// Listen address, e.g. 127.0.0.1:5300
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Worker threads (defaults to one per CPU)
    #[arg(long)]
    workers: Option<usize>,

    /// Concurrent connection limit for the listener
    #[arg(long)]
    quota: Option<usize>,

    /// Query this server once instead of serving
    #[arg(long)]
    query: Option<SocketAddr>,

    /// Payload sent by --query
    #[arg(long, default_value = "hello")]
    message: String,

    /// Connect and reply timeout for --query, e.g. 5s
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    /// Statistics log period, e.g. 30s (0s disables)
    #[arg(long)]
    stats_interval: Option<humantime::Duration>,

    /// Path to TLS certificate file (PEM format)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Path to CA certificate file (PEM format)
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Server name verified on the server certificate
    #[arg(long)]
    tls_sni: Option<String>,

    /// Offer the `dot` ALPN when querying
    #[arg(long)]
    dot_alpn: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(quota) = self.quota {
            config.quota = quota;
        }
        if let Some(timeout) = self.connect_timeout {
            config.timeouts.connect = timeout.into();
        }
        if let Some(interval) = self.stats_interval {
            config.stats_interval = interval.into();
        }
        if let Some(path) = &self.tls_cert {
            config.tls.cert_file = Some(path.clone());
        }
        if let Some(path) = &self.tls_key {
            config.tls.key_file = Some(path.clone());
        }
        if let Some(path) = &self.tls_ca {
            config.tls.ca_file = Some(path.clone());
        }
        if let Some(name) = &self.tls_sni {
            config.tls.server_name = Some(name.clone());
        }
        config.tls.dot_alpn |= self.dot_alpn;
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("netmgr={}", args.log_level).parse()?)
        .add_directive(format!("netmgr_transport={}", args.log_level).parse()?)
        .add_directive(format!("netmgr_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(NetmgrLogFormatter::new("netmgr"))
        .init();

    info!("Starting netmgr v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load_from_file(&args.config)?;
    args.apply(&mut config);

    let mgr = NetManager::new(config.net_config()).context("failed to start network manager")?;
    info!(
        "Network manager running: transport={:?}, workers={}",
        config.transport,
        mgr.workers()
    );

    let result = match args.query {
        Some(server) => query(&mgr, &config, server, args.message.into_bytes()).await,
        None => serve(&mgr, &config).await,
    };

    mgr.shutdown();
    tokio::task::spawn_blocking(move || mgr.destroy())
        .await
        .context("network manager teardown panicked")?;
    info!("netmgr shutdown complete");
    result
}

fn server_ctx(config: &AppConfig) -> Result<TlsServerCtx> {
    let (Some(cert), Some(key)) = (&config.tls.cert_file, &config.tls.key_file) else {
        anyhow::bail!("TLS transport requires a certificate and key (--tls-cert, --tls-key)");
    };
    TlsServerCtx::from_files(cert, key).context("failed to load TLS server certificate")
}

fn client_ctx(config: &AppConfig) -> Result<TlsClientCtx> {
    let ca_file = config
        .tls
        .ca_file
        .as_ref()
        .context("TLS transport requires a CA bundle (--tls-ca)")?;
    let ca = std::fs::read(ca_file).with_context(|| format!("failed to read {:?}", ca_file))?;
    let ctx = TlsClientCtx::from_pem(&ca, config.tls.dot_alpn)?;
    match &config.tls.server_name {
        Some(name) => Ok(ctx.with_server_name(name)?),
        None => Ok(ctx),
    }
}

fn accept_logged(handle: &NmHandle, res: NetResult<()>) -> NetResult<()> {
    if let Err(e) = &res {
        debug!("Accept failed: {}", e);
    }
    res?;
    debug!("Accepted connection from {}", handle.peer_addr());
    Ok(())
}

fn echo_message(handle: &NmHandle, msg: NetResult<&[u8]>) {
    match msg {
        Ok(msg) => {
            let peer = handle.peer_addr();
            handle.send(msg.to_vec(), move |_, res| {
                if let Err(e) = res {
                    debug!("Reply to {} failed: {}", peer, e);
                }
            });
        }
        Err(e) if e.is_eof_class() => {}
        Err(e) => debug!("Read from {} failed: {}", handle.peer_addr(), e),
    }
}

fn echo_stream(handle: &NmHandle, res: NetResult<()>) -> NetResult<()> {
    accept_logged(handle, res)?;
    handle.read(echo_message);
    Ok(())
}

fn listen(mgr: &NetManager, config: &AppConfig) -> Result<Listener> {
    let quota = (config.quota > 0).then(|| Quota::new(config.quota));
    let (addr, backlog) = (config.listen, config.backlog);
    let listener = match config.transport {
        Transport::Tcp => mgr.listen_tcp(addr, echo_stream, backlog, quota),
        Transport::Tcpdns => mgr.listen_tcpdns(addr, echo_message, accept_logged, backlog, quota),
        Transport::Tls => mgr.listen_tls(addr, echo_stream, backlog, quota, &server_ctx(config)?),
        Transport::Tlsdns => mgr.listen_tlsdns(
            addr,
            echo_message,
            accept_logged,
            backlog,
            quota,
            &server_ctx(config)?,
        ),
    };
    listener.with_context(|| format!("failed to listen on {}", addr))
}

async fn serve(mgr: &NetManager, config: &AppConfig) -> Result<()> {
    let listener = listen(mgr, config)?;
    component_info!(
        "listener",
        "Serving {:?} echo on {}",
        config.transport,
        listener.local_addr()
    );

    let mut stats = (!config.stats_interval.is_zero())
        .then(|| tokio::time::interval(config.stats_interval));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tick(&mut stats) => {
                let s = mgr.stats();
                component_info!(
                    "stats",
                    "accepted={} accept_failed={} quota_deferred={} sent={} send_failed={} recv_failed={} active={}",
                    s.accepted, s.accept_failed, s.quota_deferred, s.sent, s.send_failed,
                    s.recv_failed, s.active_sockets
                );
            }
        }
    }

    listener.stop();
    Ok(())
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => component_warn!("signal", "Failed to install SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to wait for Ctrl-C: {}", e);
    }
    info!("Received SIGINT, shutting down");
}

async fn query(
    mgr: &NetManager,
    config: &AppConfig,
    server: SocketAddr,
    message: Vec<u8>,
) -> Result<()> {
    let (tx, rx) = oneshot::channel::<NetResult<Vec<u8>>>();
    let on_connect = move |res: NetResult<NmHandle>| {
        let handle = match res {
            Ok(handle) => handle,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        };
        let tx = std::sync::Mutex::new(Some(tx));
        handle.read(move |h, reply| {
            let taken = tx.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(tx) = taken {
                let _ = tx.send(reply.map(|r| r.to_vec()));
            }
            h.shutdown();
        });
        handle.send(message, |h, res| {
            if let Err(e) = res {
                warn!("Query to {} failed: {}", h.peer_addr(), e);
                h.shutdown();
            }
        });
    };

    let timeout = config.timeouts.connect;
    match config.transport {
        Transport::Tcp => mgr.connect_tcp(None, server, on_connect, timeout),
        Transport::Tcpdns => mgr.connect_tcpdns(None, server, on_connect, timeout),
        Transport::Tls => mgr.connect_tls(None, server, on_connect, timeout, &client_ctx(config)?),
        Transport::Tlsdns => {
            mgr.connect_tlsdns(None, server, on_connect, timeout, &client_ctx(config)?)
        }
    }

    let reply = match tokio::time::timeout(timeout * 2, rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => Err(NetError::Canceled),
        Err(_) => Err(NetError::TimedOut),
    }
    .with_context(|| format!("query to {} failed", server))?;

    component_info!(
        "query",
        "Reply from {} ({} bytes{}): {}",
        server,
        reply.len(),
        if config.transport.is_dns() { ", one message" } else { "" },
        String::from_utf8_lossy(&reply)
    );
    if config.transport.is_tls() && !config.tls.dot_alpn {
        debug!("Queried without the dot ALPN");
    }
    Ok(())
}
