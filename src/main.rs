//! Prefix Broker
//!
//! Hands out IPv4/IPv6 prefixes and mesh addresses to routers joining a
//! community mesh network. Requests are reserved first and committed once a
//! contact confirms the emailed token.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

mod allocator;
mod api;
mod config;
mod db;
mod notify;
mod sweeper;
mod validation;

use allocator::{AllocationPolicy, Allocator};
use config::{load_config, Config, DEFAULT_CONFIG_PATH};
use db::{Database, ReservationFilter, ReservationState, UnitKind, UnitSeed};
use sweeper::ExpirySweeper;

/// Prefix Broker
#[derive(Parser)]
#[command(name = "prefix-broker")]
#[command(about = "Prefix and mesh address broker for community mesh network routers")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker daemon
    Run {
        /// Override API listen host
        #[arg(long)]
        host: Option<String>,

        /// Override API listen port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate configuration and exit
    CheckConfig,

    /// Show pool and reservation counts
    Status,

    /// Reservation management
    Reservations {
        #[command(subcommand)]
        action: Option<ReservationAction>,
    },

    /// Pool inspection
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },

    /// Expire overdue reservations once and exit
    Sweep,

    /// Operator token management
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum ReservationAction {
    /// List reservations
    List {
        /// Only reservations listing this contact
        #[arg(long)]
        email: Option<String>,

        /// Only reservations in this state (pending, confirmed, expired)
        #[arg(long)]
        state: Option<ReservationState>,
    },

    /// Show reservation details
    Show {
        /// Session id
        session: Uuid,
    },

    /// Delete a reservation and release its units
    Delete {
        /// Session id
        session: Uuid,
    },
}

#[derive(Subcommand)]
enum PoolAction {
    /// List pool units
    List {
        /// Only units of this kind (ipv4_prefix, ipv6_prefix, mesh4)
        #[arg(long)]
        kind: Option<UnitKind>,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Create a new operator token
    Create {
        /// Token name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List all tokens
    List,

    /// Revoke a token
    Revoke {
        /// Token id
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = load_config(Some(&cli.config)).context("Failed to load configuration")?;

    match cli.command {
        Some(Commands::CheckConfig) => cmd_check_config(&config),
        Some(Commands::Status) => cmd_status(&config).await,
        Some(Commands::Reservations { action }) => cmd_reservations(&config, action).await,
        Some(Commands::Pool { action }) => cmd_pool(&config, action).await,
        Some(Commands::Sweep) => cmd_sweep(&config).await,
        Some(Commands::Token { action }) => cmd_token(&config, action).await,
        Some(Commands::Run { host, port }) => cmd_run(&config, host, port).await,
        None => cmd_run(&config, None, None).await,
    }
}

/// Open the database and seed the configured pools.
async fn open_allocator(config: &Config) -> Result<Arc<Allocator>> {
    let db = Database::open(&config.database.path)
        .await
        .context("Failed to open database")?;
    let policy =
        AllocationPolicy::try_from(&config.allocation).context("Invalid allocation settings")?;
    let allocator = Allocator::new(db, policy);
    allocator
        .sync_pools(&UnitSeed::from_config(&config.pools))
        .await
        .context("Failed to seed pools")?;
    Ok(Arc::new(allocator))
}

fn cmd_check_config(config: &Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    println!("Configuration is valid");

    println!("\nPools:");
    for p in &config.pools.ipv4_prefixes {
        println!("  IPv4 prefix:  {}", p);
    }
    for p in &config.pools.ipv6_prefixes {
        println!("  IPv6 prefix:  {}", p);
    }
    println!("  Mesh addresses: {}", config.pools.mesh4.len());

    println!("\nAllocation:");
    println!("  Mesh addresses per router: {}", config.allocation.mesh_count);
    println!("  Reservation TTL: {}s", config.allocation.reservation_ttl_secs);
    println!("  Sweep interval:  {}s", config.allocation.sweep_interval_secs);

    println!("\nValidation:");
    println!("  Captcha: {}", config.validation.captcha_question);
    println!(
        "  Email deliverability check: {}",
        config.validation.check_email_deliverability
    );

    println!("\nNotify:");
    println!("  Method: {:?}", config.notify.method);
    println!("  Confirm URL: {}", config.notify.confirm_url_base);

    println!("\nAPI:");
    println!("  Listen: {}:{}", config.api.listen_host, config.api.listen_port);

    println!("\nDatabase:");
    println!("  Path: {}", config.database.path.display());

    Ok(())
}

async fn cmd_status(config: &Config) -> Result<()> {
    let allocator = open_allocator(config).await?;
    let status = allocator.status().await.context("Failed to get status")?;

    println!("Prefix Broker Status");
    println!("{}", "=".repeat(56));
    println!("{:<14} {:>8} {:>10} {:>10} {:>8}", "Pool", "Free", "Reserved", "Committed", "Total");
    for s in &status.pools {
        println!(
            "{:<14} {:>8} {:>10} {:>10} {:>8}",
            s.kind.to_string(),
            s.free,
            s.reserved,
            s.committed,
            s.total()
        );
    }
    println!();
    println!("Pending reservations:   {}", status.pending);
    println!("Confirmed reservations: {}", status.confirmed);
    println!("Expired reservations:   {}", status.expired);

    Ok(())
}

async fn cmd_reservations(config: &Config, action: Option<ReservationAction>) -> Result<()> {
    let allocator = open_allocator(config).await?;

    match action {
        Some(ReservationAction::Show { session }) => {
            let r = allocator
                .lookup(session)
                .await
                .with_context(|| format!("Reservation {} not found", session))?;

            println!("Session:      {}", r.session);
            println!("Host:         {}", r.host);
            println!("Emails:       {}", r.emails.join(", "));
            println!(
                "Constituency: {}{}",
                r.constituency,
                r.constituency.name().map(|n| format!(" ({})", n)).unwrap_or_default()
            );
            println!("State:        {}", r.state);
            println!("Created:      {}", r.created_at);
            println!("Expires:      {}", r.expires_at);
            println!(
                "Confirmed:    {}",
                r.confirmed_at.map(|dt| dt.to_string()).unwrap_or_else(|| "Never".to_string())
            );
            for unit in &r.units {
                println!("Unit:         {} ({}, {})", unit.unit, unit.kind, unit.state);
            }
        }
        Some(ReservationAction::Delete { session }) => {
            let r = allocator
                .delete_reservation(session)
                .await
                .with_context(|| format!("Failed to delete reservation {}", session))?;
            println!("Deleted reservation {} ({}), released {} units", r.session, r.host, r.units.len());
        }
        Some(ReservationAction::List { email, state }) => {
            list_reservations(&allocator, ReservationFilter { state, email }).await?;
        }
        None => {
            list_reservations(&allocator, ReservationFilter::default()).await?;
        }
    }

    Ok(())
}

async fn list_reservations(allocator: &Allocator, filter: ReservationFilter) -> Result<()> {
    let reservations = allocator
        .list_reservations(&filter)
        .await
        .context("Failed to list reservations")?;

    if reservations.is_empty() {
        println!("No reservations found");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<10} {:<20} {}", "Session", "Host", "State", "Prefix", "Created");
    println!("{}", "-".repeat(110));

    for r in reservations {
        let prefix = r
            .prefix4()
            .map(|p| p.to_string())
            .or_else(|| r.prefix6().map(|p| p.to_string()))
            .unwrap_or_else(|| "-".to_string());
        let created = r.created_at.format("%Y-%m-%d %H:%M");
        println!("{:<38} {:<24} {:<10} {:<20} {}", r.session, r.host, r.state.to_string(), prefix, created);
    }

    Ok(())
}

async fn cmd_pool(config: &Config, action: PoolAction) -> Result<()> {
    let allocator = open_allocator(config).await?;

    match action {
        PoolAction::List { kind } => {
            let units = allocator.pool_units(kind).await.context("Failed to list pool")?;

            println!("{:<28} {:<12} {:<10} {}", "Unit", "Kind", "State", "Holder");
            println!("{}", "-".repeat(90));
            for u in units {
                println!(
                    "{:<28} {:<12} {:<10} {}",
                    u.unit.to_string(),
                    u.kind.to_string(),
                    u.state.to_string(),
                    u.holder.map(|h| h.to_string()).unwrap_or_else(|| "-".to_string())
                );
            }
        }
    }

    Ok(())
}

async fn cmd_sweep(config: &Config) -> Result<()> {
    let allocator = open_allocator(config).await?;
    let expired = allocator
        .expire_stale(Utc::now())
        .await
        .context("Failed to expire reservations")?;
    println!("Expired {} reservations", expired);
    Ok(())
}

async fn cmd_token(config: &Config, action: TokenAction) -> Result<()> {
    let db = Database::open(&config.database.path)
        .await
        .context("Failed to open database")?;

    match action {
        TokenAction::Create { name } => {
            let (token, token_obj) = db
                .create_operator_token(name.as_deref())
                .await
                .context("Failed to create token")?;

            println!("Token created successfully!");
            println!("  ID:          {}", token_obj.id);
            println!("  Name:        {}", token_obj.name.as_deref().unwrap_or("(none)"));
            println!();
            println!("  Token: {}", token);
            println!();
            println!("Save this token securely - it cannot be retrieved later!");
        }
        TokenAction::List => {
            let tokens = db.list_operator_tokens().await.context("Failed to list tokens")?;
            if tokens.is_empty() {
                println!("No tokens found");
            } else {
                println!("{:<5} {:<20} {:<20} {:<8}", "ID", "Name", "Created", "Revoked");
                println!("{}", "-".repeat(55));
                for t in &tokens {
                    println!(
                        "{:<5} {:<20} {:<20} {:<8}",
                        t.id,
                        t.name.as_deref().unwrap_or("(none)"),
                        t.created_at.format("%Y-%m-%d %H:%M").to_string(),
                        t.revoked,
                    );
                }
            }
        }
        TokenAction::Revoke { id } => {
            if db.revoke_operator_token(id).await.context("Failed to revoke token")? {
                println!("Token {} revoked", id);
            } else {
                anyhow::bail!("Token {} not found", id);
            }
        }
    }

    Ok(())
}

async fn cmd_run(config: &Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    // Initialize components
    let allocator = open_allocator(config).await?;
    let notifier = notify::from_config(&config.notify);

    let sweeper = ExpirySweeper::new(
        allocator.clone(),
        Duration::from_secs(config.allocation.sweep_interval_secs),
    );

    // Expire whatever lapsed while the broker was down
    if let Err(e) = sweeper.sweep_once().await {
        error!(error = %e, "Initial sweep failed");
    }

    // Determine listen address
    let listen_host = host.unwrap_or_else(|| config.api.listen_host.clone());
    let listen_port = port.unwrap_or(config.api.listen_port);
    let listen_addr = format!("{}:{}", listen_host, listen_port);

    // Create API router
    let app_state = api::AppState {
        config: config.clone(),
        allocator,
        notifier,
    };
    let app = api::create_router(app_state);

    // Create listener
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;

    info!(listen_addr = %listen_addr, "Starting prefix-broker");

    // Run both concurrently; the server drains on shutdown
    tokio::select! {
        _ = sweeper.start() => {}
        result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .into_future() => {
            if let Err(e) = result {
                error!(error = %e, "Server error");
            }
        }
    }
    sweeper.stop();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
