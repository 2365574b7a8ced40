use a3s_topology::config::TopologyConfig;
use a3s_topology::observability::init_logging;
use a3s_topology::platform::simulated::SimulatedPlatform;
use a3s_topology::{Orchestrator, PlatformClients, RolloutState, TopologyPlanner};
use clap::{Parser, Subcommand};
use std::sync::Arc;

/// A3S Topology — plan, route, scale, and roll out multi-service deployments
#[derive(Parser)]
#[command(name = "a3s-topology", version, about)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a configuration file without contacting the platform
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "topology.hcl")]
        config: String,
    },
    /// Print the resolved plan for every service (or one) as JSON
    Plan {
        #[arg(short, long, default_value = "topology.hcl")]
        config: String,
        /// Only plan this service
        #[arg(short, long)]
        service: Option<String>,
    },
    /// Roll out every service in the configuration
    Apply {
        #[arg(short, long, default_value = "topology.hcl")]
        config: String,
        /// Run against the in-process simulated platform
        #[arg(long)]
        simulate: bool,
    },
}

#[tokio::main]
async fn main() -> a3s_topology::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Validate { config } => validate_config(&config).await,
        Commands::Plan { config, service } => plan(&config, service.as_deref()).await,
        Commands::Apply { config, simulate } => apply(&config, simulate).await,
    }
}

async fn load(path: &str) -> a3s_topology::Result<TopologyConfig> {
    tracing::info!(config = path, "Loading configuration");
    let config = TopologyConfig::from_file(path).await?;
    config.validate()?;
    Ok(config)
}

/// Validate a configuration file and print diagnostics
async fn validate_config(path: &str) -> a3s_topology::Result<()> {
    let config = match TopologyConfig::from_file(path).await {
        Ok(c) => {
            println!("✓ Config parsed successfully ({})", path);
            c
        }
        Err(e) => {
            eprintln!("✗ Parse error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("✗ Validation error: {}", e);
        std::process::exit(1);
    }

    println!("✓ Configuration is valid");
    println!();
    println!(
        "  Environment: {} ({}, {})",
        config.environment.name, config.environment.region, config.environment.architecture
    );
    println!("  Listener:    {} (port {})", config.listener.name, config.listener.port);
    println!("  Services:    {}", config.services.len());
    for spec in config.service_specs() {
        println!(
            "    - {} ({}, {} replicas [{}..{}], {} routes, {} policies)",
            spec.name,
            spec.substrate.kind(),
            spec.replicas.desired,
            spec.replicas.min,
            spec.replicas.max,
            spec.routes.len(),
            spec.scaling.len()
        );
        for rule in &spec.routes {
            println!("        priority {} → {}", rule.priority, rule.patterns.join(", "));
        }
    }
    Ok(())
}

async fn plan(path: &str, only: Option<&str>) -> a3s_topology::Result<()> {
    let config = load(path).await?;
    let mut plans = Vec::new();
    for spec in config.service_specs() {
        if only.is_some_and(|name| name != spec.name) {
            continue;
        }
        plans.push(TopologyPlanner::plan(spec, &config.environment)?);
    }
    if let Some(name) = only {
        if plans.is_empty() {
            return Err(a3s_topology::TopologyError::Config(format!(
                "service '{}' is not defined in {}",
                name, path
            )));
        }
    }
    println!("{}", serde_json::to_string_pretty(&plans)?);
    Ok(())
}

async fn apply(path: &str, simulate: bool) -> a3s_topology::Result<()> {
    if !simulate {
        return Err(a3s_topology::TopologyError::Config(
            "no provider binding is configured; re-run with --simulate".to_string(),
        ));
    }
    let config = load(path).await?;
    tracing::info!("A3S Topology v{}", env!("CARGO_PKG_VERSION"));

    let platform = Arc::new(SimulatedPlatform::new());
    let orchestrator = Arc::new(Orchestrator::new(config, PlatformClients::simulated(platform))?);

    let mut failed = false;
    for (service, result) in orchestrator.apply().await {
        match result {
            Ok(report) => {
                failed |= report.state != RolloutState::Healthy;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Err(e) => {
                failed = true;
                eprintln!("✗ {}: {}", service, e);
            }
        }
    }
    println!("{}", serde_json::to_string_pretty(&orchestrator.topologies().await)?);
    tracing::info!(metrics = %serde_json::to_string(&orchestrator.metrics().snapshot())?, "Apply finished");

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
