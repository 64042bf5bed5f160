use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use edgesync::{EdgesyncAgent, EdgesyncConfig};

#[derive(Parser, Debug)]
#[command(name = "edgesync")]
#[command(about = "Offline-first event synchronization agent for safety-monitoring edge appliances")]
#[command(version)]
#[command(long_about = "Synchronizes locally captured safety events with an application server. \
Events are stored durably on the appliance, batched and uploaded when connectivity allows, \
and confirmed end to end so nothing is lost across power cuts or network outages. \
Also keeps the device configuration in step with the server and reports device health.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "edgesync.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the agent")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Dry run mode - initialize and test connectivity, don't start workers
    #[arg(long, help = "Initialize components and run a connectivity test without starting workers")]
    dry_run: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting edgesync agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match EdgesyncConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    config.validate()?;

    let mut agent = EdgesyncAgent::new(config, PathBuf::from(&args.config))
        .await
        .map_err(|e| {
            error!("Failed to initialize agent: {}", e);
            e
        })?;

    if args.dry_run {
        let report = agent.test_connectivity().await;
        println!("✓ Dry run completed - all components initialized");
        println!(
            "  internet: {}  server: {}  authentication: {}",
            report.internet, report.server, report.authentication
        );
        return Ok(());
    }

    agent.start().map_err(|e| {
        error!("Failed to start agent: {}", e);
        e
    })?;

    let exit_code = agent.run().await.map_err(|e| {
        error!("Agent error during execution: {}", e);
        e
    })?;

    info!("edgesync agent exited with code: {}", exit_code);
    std::process::exit(exit_code);
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("edgesync={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# Edgesync Configuration File");
    println!("# This is the default configuration with all available options");
    println!();

    match toml::to_string_pretty(&EdgesyncConfig::default()) {
        Ok(toml) => println!("{}", toml),
        Err(e) => eprintln!("Error generating default configuration: {}", e),
    }
}
