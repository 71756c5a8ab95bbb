use clap::Parser;
use pg_reptool::report::ReportWriter;
use pg_reptool::{Config, ReplicationOverview, Result};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-reptool")]
#[command(about = "PostgreSQL logical replication topology overview", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", help = "Configuration file [default: config.toml]")]
    config: Option<PathBuf>,

    #[arg(long, env = "PGHOST", help = "Seed host to start discovery from")]
    start_host: Option<String>,

    #[arg(short, long, env = "PGUSER", help = "User for the seed host")]
    user: Option<String>,

    #[arg(long, env = "PGPASSWORD", hide = true, hide_env_values = true)]
    password: Option<String>,

    #[arg(long, help = "Maximum number of hosts probed concurrently")]
    max_workers: Option<usize>,

    #[arg(long, help = "Log level (trace, debug, info, warn, error)")]
    log_level: Option<String>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Only report slots lagging more than 1 MB")]
    only_lagging: bool,

    #[arg(long, value_name = "DIR", default_value = ".", help = "Directory for the saved report")]
    output_dir: PathBuf,

    #[arg(long, help = "Print the report without saving it")]
    no_save: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config_path, required) = match &args.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from("config.toml"), false),
    };
    let mut config = Config::from_file(&config_path, required)?;
    apply_overrides(&mut config, &args);

    init_logging(
        &config.logging.level,
        args.json_logs || config.logging.json,
        args.verbose,
    );
    info!("Configuration loaded from {:?}", config_path);

    let overview = match ReplicationOverview::from_config(&config) {
        Ok(overview) => overview,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        seed_host = ?config.postgres.host,
        user = %config.postgres.username,
        max_workers = config.monitoring.max_workers,
        pool_size = config.monitoring.pool_size,
        follow_peers = config.monitoring.follow_replication_peers,
        "Configuration summary"
    );

    let mut report = overview.run().await;
    if args.only_lagging {
        report.only_lagging();
    }

    println!("{}", report.to_json_pretty()?);

    if !args.no_save {
        if let Err(e) = ReportWriter::new(&args.output_dir).save(&report).await {
            warn!("Could not save report: {}", e);
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(host) = &args.start_host {
        config.postgres.host = Some(host.clone());
    }
    if let Some(user) = &args.user {
        config.postgres.username = user.clone();
    }
    if let Some(password) = &args.password {
        config.postgres.password = Some(password.clone());
    }
    if let Some(workers) = args.max_workers {
        config.monitoring.max_workers = workers;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
}

/// Logs go to stderr so the report on stdout stays parseable.
fn init_logging(level: &str, json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_reptool=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("pg_reptool={},warn", level)))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
