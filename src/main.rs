use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use aias_guard::config::GuardConfig;
use aias_guard::ratelimit::{RateLimitConfig, RateLimitResult, RateLimiter};

/// Operator tool for the AIAS guard components
#[derive(Parser, Debug)]
#[command(name = "aias-guard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fire rate limit checks for one path and identifier and print each decision
    Probe(ProbeArgs),

    /// Print the effective configuration
    Config,
}

#[derive(clap::Args, Debug)]
struct ProbeArgs {
    /// Route path to check
    #[arg(short, long)]
    path: String,

    /// Client identifier, e.g. an IP address or user id
    #[arg(short, long, default_value = "127.0.0.1")]
    identifier: String,

    /// Number of checks to fire
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,

    /// Window override in milliseconds; uses the route rules when unset
    #[arg(long)]
    window_ms: Option<u64>,

    /// Limit override; uses the route rules when unset
    #[arg(long)]
    max_requests: Option<u32>,

    /// Fire all checks at once instead of one after another
    #[arg(long)]
    concurrent: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProbeLine<'a> {
    request: u32,
    path: &'a str,
    identifier: &'a str,
    #[serde(flatten)]
    result: RateLimitResult,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = GuardConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Probe(args) => probe(&config, args).await,
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn probe(config: &GuardConfig, args: ProbeArgs) -> anyhow::Result<()> {
    let limiter = RateLimiter::from_config(config)?;
    if let Some(interval) = config.rate_limiting.sweep_interval() {
        limiter.start_sweeper(interval);
    }

    let route_limit = limiter.rules().limit_for(&args.path);
    let limit = RateLimitConfig {
        window_ms: args.window_ms.unwrap_or(route_limit.window_ms),
        max_requests: args.max_requests.unwrap_or(route_limit.max_requests),
    };

    info!(
        path = %args.path,
        identifier = %args.identifier,
        count = args.count,
        window_ms = limit.window_ms,
        max_requests = limit.max_requests,
        remote_store = limiter.has_remote_store(),
        "Probing rate limiter"
    );

    let results: Vec<RateLimitResult> = if args.concurrent {
        futures::future::join_all(
            (0..args.count).map(|_| limiter.check_rate_limit(&args.path, &args.identifier, &limit)),
        )
        .await
    } else {
        let mut results = Vec::with_capacity(args.count as usize);
        for _ in 0..args.count {
            results.push(limiter.check_rate_limit(&args.path, &args.identifier, &limit).await);
        }
        results
    };

    let allowed = results.iter().filter(|r| r.allowed).count();
    for (i, result) in results.into_iter().enumerate() {
        let line = ProbeLine {
            request: i as u32 + 1,
            path: &args.path,
            identifier: &args.identifier,
            result,
        };
        println!("{}", serde_json::to_string(&line)?);
    }

    info!(allowed, rejected = args.count as usize - allowed, "Probe finished");
    limiter.stop_sweeper().await;
    Ok(())
}
