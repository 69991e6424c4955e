//! RouteProxy - Main entry point
//!
//! Runs the proxy listeners alongside the interactive route console.

use anyhow::{Context, Result};
use clap::Parser;
use routeproxy::acme::LETSENCRYPT_PRODUCTION;
use routeproxy::console::stdin_lines;
use routeproxy::{
    persistence, AcmeConfig, AcmeIssuer, CertificateIssuer, CertificateManager,
    ChallengeStore, Console, ProxyConfig, ProxyServer, RoutePolicy, RouteStore,
    SelfSignedIssuer, Shutdown,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// RouteProxy - A host-routed HTTP/HTTPS reverse proxy
#[derive(Parser, Debug)]
#[command(name = "routeproxy")]
#[command(author = "RouteProxy Contributors")]
#[command(version)]
#[command(about = "A host-routed HTTP/HTTPS reverse proxy with a live route console")]
struct Args {
    /// Address to bind the listeners to
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: IpAddr,

    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, env = "HTTPS_PORT", default_value = "8443")]
    https_port: u16,

    /// Enable HTTPS server
    #[arg(long, env = "ENABLE_HTTPS", default_value = "false")]
    enable_https: bool,

    /// Force HTTPS redirect
    #[arg(long, env = "FORCE_HTTPS", default_value = "false")]
    force_https: bool,

    /// Route file, loaded at startup and saved after every change
    #[arg(long, env = "ROUTES_FILE", default_value = "routes.json")]
    routes_file: PathBuf,

    /// Certificates directory
    #[arg(long, env = "CERTS_DIR", default_value = "tls")]
    certs_dir: PathBuf,

    /// ACME directory URL (Let's Encrypt)
    #[arg(long, env = "ACME_DIRECTORY_URL", default_value = LETSENCRYPT_PRODUCTION)]
    acme_directory_url: String,

    /// Contact email for the ACME account
    #[arg(long, env = "ACME_EMAIL")]
    acme_email: Option<String>,

    /// Issue self-signed certificates instead of using ACME
    #[arg(long, env = "SELF_SIGNED", default_value = "false")]
    self_signed: bool,

    /// Seconds in-flight connections get to finish on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value = "5")]
    shutdown_grace_secs: u64,

    /// Seconds between certificate renewal checks
    #[arg(long, env = "RENEW_INTERVAL_SECS", default_value = "43200")]
    renew_interval_secs: u64,

    /// Run without the interactive console, stopping on Ctrl-C
    #[arg(long, env = "NO_CONSOLE", default_value = "false")]
    no_console: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Run in production mode (ports 80/443)
    #[arg(long)]
    production: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();

    // Production mode overrides
    if args.production {
        args.http_port = 80;
        args.https_port = 443;
        args.enable_https = true;
    }

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // The console owns stdout.
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting RouteProxy v{}", env!("CARGO_PKG_VERSION"));
    info!("HTTP port: {}", args.http_port);
    if args.enable_https {
        info!("HTTPS port: {}", args.https_port);
    }

    let routes = Arc::new(RouteStore::new());
    match persistence::load(&args.routes_file) {
        Ok(loaded) => {
            if loaded.skipped > 0 {
                warn!(
                    "Skipped {} invalid route(s) in {}",
                    loaded.skipped,
                    args.routes_file.display()
                );
            }
            routes.replace_all(loaded.table);
            info!(
                "Loaded {} route(s) from {}",
                routes.len(),
                args.routes_file.display()
            );
        }
        Err(e) if e.is_not_found() => {
            info!(
                "No route file at {}, starting with an empty table",
                args.routes_file.display()
            );
        }
        Err(e) => return Err(e).context("Failed to load routes"),
    }

    let cert_manager = if args.enable_https {
        let challenges = Arc::new(ChallengeStore::new());
        let issuer: Arc<dyn CertificateIssuer> = if args.self_signed {
            info!("Using self-signed certificates");
            Arc::new(SelfSignedIssuer)
        } else {
            info!("Using ACME directory: {}", args.acme_directory_url);
            Arc::new(AcmeIssuer::new(
                AcmeConfig {
                    directory_url: args.acme_directory_url.clone(),
                    contact_email: args.acme_email.clone(),
                },
                &args.certs_dir,
                challenges.clone(),
            ))
        };
        let policy = Arc::new(RoutePolicy::new(routes.clone()));
        let manager = CertificateManager::new(&args.certs_dir, policy, issuer, challenges)
            .context("Failed to initialize certificate manager")?;
        info!(
            "Certificate manager initialized at: {}",
            args.certs_dir.display()
        );
        Some(Arc::new(manager))
    } else {
        None
    };

    let config = ProxyConfig {
        bind_address: args.bind_address,
        http_port: args.http_port,
        https_port: args.https_port,
        enable_https: args.enable_https,
        force_https: args.force_https,
        shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
    };

    let server = Arc::new(ProxyServer::new(config, routes.clone(), cert_manager.clone()));
    let listeners = server.bind().await?;

    let shutdown = Shutdown::new();
    let server_task = tokio::spawn(server.serve(listeners, shutdown.subscribe()));
    let renewal_task = cert_manager.map(|manager| {
        manager.spawn_renewal(
            Duration::from_secs(args.renew_interval_secs),
            shutdown.subscribe(),
        )
    });

    info!("RouteProxy started successfully");

    if args.no_console {
        tokio::signal::ctrl_c().await?;
        info!("Interrupt received");
    } else {
        let console = Console::new(routes, &args.routes_file);
        let mut lines = stdin_lines();
        let mut stdout = std::io::stdout();
        println!("Type 'help' for available commands.");

        tokio::select! {
            result = console.run(&mut lines, &mut stdout) => result?,
            _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
        }
    }

    info!("Initiating server shutdown...");
    shutdown.trigger();

    match server_task.await {
        Ok(Ok(())) => info!("Server shutdown successfully"),
        Ok(Err(e)) => error!("Server shutdown with error: {:#}", e),
        Err(e) => error!("Server task failed: {}", e),
    }
    if let Some(task) = renewal_task {
        let grace = Duration::from_secs(args.shutdown_grace_secs);
        match tokio::time::timeout(grace, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Renewal task failed: {}", e),
            Err(_) => warn!("Renewal task did not stop within {:?}, abandoning it", grace),
        }
    }

    info!("Exiting");
    Ok(())
}
