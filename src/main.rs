//! intercept-proxy: local interception proxy
//!
//! This is the main entry point for the standalone proxy.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! ./intercept-proxy
//!
//! # Run with custom configuration
//! ./intercept-proxy -c /path/to/config.json
//!
//! # Run with environment overrides
//! INTERCEPT_PROXY_LOG_LEVEL=debug ./intercept-proxy
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use intercept_proxy::config::{load_config_with_env, Config, Configuration, LogConfig, LogFormat};
use intercept_proxy::event::{self, TracingSink};
use intercept_proxy::fakedns::{DnsServer, DnsUdpServer, FakeDnsManager, UdpUpstream};
use intercept_proxy::proxy::ProxyServer;
use intercept_proxy::rules::RuleEngine;
use intercept_proxy::socket::{RawSocketFactory, TunnelProviderSlot};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Proxy port override
    port: Option<u16>,
    /// Log format override
    log_format: Option<LogFormat>,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/intercept-proxy/config.json");
        let mut port = None;
        let mut log_format = None;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-p" | "--port" => match args.next().map(|p| p.parse::<u16>()) {
                    Some(Ok(p)) => port = Some(p),
                    _ => exit_usage("--port expects a number between 0 and 65535"),
                },
                "--log-format" => match args.next().as_deref() {
                    Some("text") => log_format = Some(LogFormat::Text),
                    Some("json") => log_format = Some(LogFormat::Json),
                    _ => exit_usage("--log-format expects 'text' or 'json'"),
                },
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("intercept-proxy v{}", intercept_proxy::VERSION);
                    std::process::exit(0);
                }
                _ => exit_usage(&format!("Unknown argument: {arg}")),
            }
        }

        Self {
            config_path,
            port,
            log_format,
            check_config,
        }
    }
}

fn exit_usage(message: &str) -> ! {
    eprintln!("{message}");
    print_help();
    std::process::exit(1);
}

fn print_help() {
    println!(
        r#"intercept-proxy v{}

Local interception proxy with rule-based routing and fake-IP DNS.

USAGE:
    intercept-proxy [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/intercept-proxy/config.json]
    -p, --port <PORT>       Override the proxy listen port
    --log-format <FORMAT>   Log format: text or json
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    INTERCEPT_PROXY_PORT        Override the proxy listen port
    INTERCEPT_PROXY_LOG_LEVEL   Override log level (trace, debug, info, warn, error)
    RUST_LOG                    Full tracing filter, takes precedence over the level

SIGNALS:
    SIGHUP                      Reload rules and adapters from the configuration file
    SIGINT, SIGTERM             Shut down
"#,
        intercept_proxy::VERSION
    );
}

/// Initialize logging
fn init_logging(log: &LogConfig) {
    let level = match log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match log.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

/// Load the configuration with file, environment and command-line layers
fn load(args: &Args) -> Result<Config> {
    let mut config = load_config_with_env(&args.config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config_path))?;
    if let Some(port) = args.port {
        config.proxy.port = port;
    }
    if let Some(format) = args.log_format {
        config.log.format = format;
    }
    Ok(config)
}

/// Running DNS listener
struct DnsHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

async fn start_dns(
    settings: &Config,
    manager: &Arc<FakeDnsManager>,
    rules: &Arc<RuleEngine>,
) -> Result<Option<DnsHandle>> {
    if !settings.dns.enabled {
        return Ok(None);
    }
    let upstream = UdpUpstream::new(settings.dns.upstream).with_timeout(settings.dns.upstream_timeout());
    let server = DnsServer::new(Arc::clone(manager), Arc::clone(rules), Arc::new(upstream));
    let listener = DnsUdpServer::bind(settings.dns.listen, Arc::new(server))
        .await
        .with_context(|| format!("Failed to bind DNS listener on {}", settings.dns.listen))?;

    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(listener.run(rx));
    Ok(Some(DnsHandle { shutdown, task }))
}

/// Re-read the configuration file and swap in its rules.
///
/// A failed reload leaves the running rules in place.
fn reload(args: &Args, sockets: &Arc<RawSocketFactory>, proxy: &ProxyServer, version: u64) -> Result<()> {
    let config = load(args)?;
    let compiled = Configuration::compile(config, sockets, version)?;
    proxy.reload_rules(compiled.rules);
    Ok(())
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();
    let config = load(&args)?;

    init_logging(&config.log);
    info!("intercept-proxy v{}", intercept_proxy::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let sockets = Arc::new(RawSocketFactory::new());
    let compiled = Configuration::compile(config, &sockets, 1)
        .with_context(|| format!("Invalid configuration in {:?}", args.config_path))?;

    if args.check_config {
        println!(
            "Configuration is valid: {} adapters, {} rules",
            compiled.adapters.len(),
            compiled.rules.len()
        );
        return Ok(());
    }

    let settings = compiled.settings;
    event::set_sink(Arc::new(TracingSink));

    let manager = Arc::new(FakeDnsManager::new(&settings.dns.fake_ip));
    let cleanup = manager.spawn_cleanup();
    let rules = Arc::new(RuleEngine::new(compiled.rules));

    let dns = start_dns(&settings, &manager, &rules).await?;
    let proxy = ProxyServer::new(&settings.proxy, Arc::clone(&rules), Some(Arc::clone(&manager)));
    let addr = proxy.start().await.context("Failed to start proxy")?;

    info!(
        "intercept-proxy ready on {} (dns: {}, fake ip: {}) in {:.2}ms",
        addr,
        if dns.is_some() { settings.dns.listen.to_string() } else { "off".into() },
        manager.is_enabled(),
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let mut version = 1;
    let mut hangup = hangup_signal()?;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT, initiating shutdown...");
                break;
            }
            () = wait_for_sigterm() => {
                info!("Received SIGTERM, initiating shutdown...");
                break;
            }
            () = hangup.recv() => {
                version += 1;
                match reload(&args, &sockets, &proxy, version) {
                    Ok(()) => info!("Rules reloaded (version {})", version),
                    Err(e) => error!("Reload failed, keeping current rules: {:#}", e),
                }
            }
        }
    }

    info!("Shutting down...");
    if let Err(e) = proxy.stop().await {
        warn!("Proxy stop: {}", e);
    }
    if let Some(dns) = dns {
        let _ = dns.shutdown.send(true);
        let _ = dns.task.await;
    }
    cleanup.abort();
    TunnelProviderSlot::global().clear();
    event::clear_sink();

    let stats = proxy.stats_snapshot();
    info!(
        "Final stats: {} total connections, {} completed, {} errored, {} rejected",
        stats.total_accepted, stats.completed, stats.errored, stats.rejected
    );
    info!("Transferred: {} bytes up, {} bytes down", stats.bytes_up, stats.bytes_down);
    info!("Shutdown complete");

    Ok(())
}

/// SIGHUP stream; never fires off Unix
struct Hangup {
    #[cfg(unix)]
    inner: signal::unix::Signal,
}

impl Hangup {
    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            if self.inner.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
fn hangup_signal() -> Result<Hangup> {
    use tokio::signal::unix::{signal, SignalKind};
    let inner = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;
    Ok(Hangup { inner })
}

#[cfg(not(unix))]
fn hangup_signal() -> Result<Hangup> {
    Ok(Hangup {})
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await
}
