//! CLI tool for managing the route file while the proxy is stopped
//!
//! Usage:
//!   routeproxy-routes add <domain> <port>
//!   routeproxy-routes remove <domain>
//!   routeproxy-routes list [--domain <domain>] [--json]
//!
//! A running proxy picks the changes up with its `load` console command.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use routeproxy::{normalize_domain, persistence, Route, RouteStore};
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// CLI tool for managing proxy routes
#[derive(Parser, Debug)]
#[command(name = "routeproxy-routes")]
#[command(author = "RouteProxy Contributors")]
#[command(version)]
#[command(about = "Manage the RouteProxy route file")]
struct Args {
    /// Route file
    #[arg(long, env = "ROUTES_FILE", default_value = "routes.json")]
    routes_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add or replace a route
    Add {
        /// Domain name (e.g., api.example.com)
        domain: String,

        /// Backend port on localhost
        port: String,
    },

    /// Remove a route
    Remove {
        /// Domain name
        domain: String,
    },

    /// List all routes
    List {
        /// Filter by domain
        #[arg(short = 'd', long)]
        domain: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let routes = open(&args.routes_file)?;

    match args.command {
        Commands::Add { domain, port } => {
            let route = routes.put(&domain, &port)?;
            persistence::save(&args.routes_file, &routes.records())?;

            println!("Added route:");
            print_route(&route);
        }

        Commands::Remove { domain } => {
            if !routes.remove(&domain) {
                eprintln!("No route found for {}", normalize_domain(&domain));
                std::process::exit(1);
            }
            persistence::save(&args.routes_file, &routes.records())?;
            println!("Removed route for {}", normalize_domain(&domain));
        }

        Commands::List { domain, json } => {
            let mut records = routes.records();
            if let Some(domain) = &domain {
                let domain = normalize_domain(domain);
                records.retain(|r| r.domain == domain);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
                return Ok(());
            }

            if records.is_empty() {
                match domain {
                    Some(domain) => println!("No route found for domain: {}", domain),
                    None => println!("No routes found"),
                }
                return Ok(());
            }

            println!("{:<40} {:<8} {:<30}", "DOMAIN", "PORT", "TARGET");
            println!("{}", "-".repeat(80));

            for record in &records {
                println!(
                    "{:<40} {:<8} http://localhost:{}",
                    record.domain, record.port, record.port
                );
            }

            println!("\nTotal: {} route(s)", records.len());
        }
    }

    Ok(())
}

/// Load the route file, treating a missing file as an empty table.
fn open(path: &Path) -> Result<RouteStore> {
    match persistence::load(path) {
        Ok(loaded) => Ok(RouteStore::with_table(loaded.table)),
        Err(e) if e.is_not_found() => Ok(RouteStore::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to open {}", path.display())),
    }
}

fn print_route(route: &Route) {
    println!("  Domain:  {}", route.domain);
    println!("  Port:    {}", route.port);
    println!("  Target:  {}", route.target);
}
