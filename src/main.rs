use anyhow::Result;
use clap::{Parser, Subcommand};
use pacer::persistence::StateStore;
use pacer::{Config, LimiterRegistry, Priority};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "pacer", version, about = "Adaptive admission control for rate-sensitive APIs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Push synthetic calls through a limiter and print its status
    Simulate {
        #[arg(long, default_value = "demo")]
        endpoint: String,
        #[arg(long, default_value_t = 50)]
        requests: usize,
        /// Mean latency of the simulated call
        #[arg(long, default_value_t = 200)]
        latency_ms: u64,
        /// Probability that a simulated call fails, between 0 and 1
        #[arg(long, default_value_t = 0.0, value_parser = parse_failure_rate)]
        failure_rate: f64,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        /// Give up on admission after this long
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Print a persisted limiter state file
    Inspect { path: PathBuf },
}

fn parse_failure_rate(raw: &str) -> Result<f64, String> {
    let rate: f64 = raw.parse().map_err(|e| format!("{}", e))?;
    if rate.is_finite() && (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{} is not a probability between 0 and 1", raw))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("pacer={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Command::Simulate {
            endpoint,
            requests,
            latency_ms,
            failure_rate,
            priority,
            timeout_ms,
        } => {
            simulate(
                &config,
                endpoint,
                requests,
                Duration::from_millis(latency_ms),
                failure_rate,
                priority,
                timeout_ms.map(Duration::from_millis),
            )
            .await
        }
        Command::Inspect { path } => inspect(path),
    }
}

async fn simulate(
    config: &Config,
    endpoint: String,
    requests: usize,
    latency: Duration,
    failure_rate: f64,
    priority: Priority,
    timeout: Option<Duration>,
) -> Result<()> {
    let registry = Arc::new(LimiterRegistry::from_config(config)?);
    tracing::info!(endpoint = %endpoint, requests, "starting simulation");

    let tasks: Vec<_> = (0..requests)
        .map(|_| {
            let registry = registry.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
                registry
                    .run_with_limit(&endpoint, priority, deadline, || async move {
                        let jitter = rand::rng().random_range(0.5..1.5);
                        let fails = rand::rng().random_bool(failure_rate);
                        tokio::time::sleep(latency.mul_f64(jitter)).await;
                        if fails {
                            Err(anyhow::anyhow!("simulated upstream failure"))
                        } else {
                            Ok(())
                        }
                    })
                    .await
            })
        })
        .collect();

    let (mut ok, mut limited, mut failed) = (0usize, 0usize, 0usize);
    for task in tasks {
        match task.await? {
            Ok(()) => ok += 1,
            Err(e) if e.is_rate_limited() => limited += 1,
            Err(_) => failed += 1,
        }
    }
    tracing::info!(ok, limited, failed, "simulation finished");

    let status = registry.limiter(&endpoint)?.get_status();
    println!("{}", serde_json::to_string_pretty(&status)?);

    registry.shutdown_all().await;
    Ok(())
}

fn inspect(path: PathBuf) -> Result<()> {
    match StateStore::new(path.clone()).try_load()? {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        None => println!("No prior history at {}", path.display()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_rate_must_be_a_probability() {
        assert_eq!(parse_failure_rate("0.25"), Ok(0.25));
        assert_eq!(parse_failure_rate("1"), Ok(1.0));
        for bad in ["NaN", "inf", "-0.1", "1.5", "often"] {
            assert!(parse_failure_rate(bad).is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn test_cli_rejects_nan_failure_rate() {
        assert!(Cli::try_parse_from(["pacer", "simulate", "--failure-rate", "NaN"]).is_err());
        let cli = Cli::try_parse_from(["pacer", "simulate", "--failure-rate", "0.5"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Simulate { failure_rate, .. } if failure_rate == 0.5
        ));
    }
}
