use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use throttlegate::clock::{Clock, ManualClock};
use throttlegate::config::ThrottleSettings;
use throttlegate::error::StoreError;
use throttlegate::gate::{keys, ActionRequest, GateComposer};
use throttlegate::throttle::{CounterRecord, CounterStore, MemoryCounterStore, ThrottleEngine};

#[derive(Parser, Debug)]
#[command(name = "throttlegate", version, about = "Inspect and exercise throttle policies")]
struct Cli {
    /// Settings file (YAML)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log filter, e.g. `info` or `throttlegate=debug`
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the settings and print the policy table
    Validate,

    /// Replay a burst of attempts against one gate and print each outcome
    Simulate {
        /// Action to throttle
        #[arg(short, long)]
        action: String,

        /// Caller identity (e.g. an email); omit to key by address
        #[arg(short, long)]
        key: Option<String>,

        /// Caller network address
        #[arg(short, long, default_value = "127.0.0.1")]
        remote: IpAddr,

        /// Number of attempts
        #[arg(short = 'n', long, default_value_t = 6)]
        attempts: u32,

        /// Simulated seconds between attempts
        #[arg(short, long, default_value_t = 2)]
        interval_secs: i64,

        /// Pretend the counter store is unreachable
        #[arg(long)]
        store_down: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let settings = ThrottleSettings::load(cli.config.as_deref()).context("loading settings")?;
    let policies = settings.policy_table().context("building policy table")?;

    match cli.command {
        Command::Validate => {
            for action in policies.actions() {
                let rule = policies.get_rule(action)?;
                println!(
                    "{:<14} max_attempts={:<4} window={}s lockout={}",
                    action,
                    rule.max_attempts,
                    rule.window_seconds,
                    rule.lockout()
                        .map(|s| format!("{}s", s))
                        .unwrap_or_else(|| "none".to_string()),
                );
            }
            info!(actions = policies.len(), "Policy table is valid");
        }
        Command::Simulate {
            action,
            key,
            remote,
            attempts,
            interval_secs,
            store_down,
        } => {
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let store: Arc<dyn CounterStore> = if store_down {
                Arc::new(DownStore)
            } else {
                Arc::new(MemoryCounterStore::new())
            };
            let engine = Arc::new(
                ThrottleEngine::new(Arc::new(policies), store)
                    .with_store_timeout(settings.store_timeout()),
            );

            // The simulated caller carries no challenge token, so challenges stay off.
            let mut options = settings.gate.clone();
            options.require_challenge = false;

            let gate = GateComposer::new(engine, clock.clone())
                .build_gate(&action, keys::field_and_addr("identity"), options)?;

            info!(action = %action, attempts, "Simulating attempts");
            for attempt in 1..=attempts {
                let mut request = ActionRequest::new(remote);
                if let Some(identity) = &key {
                    request = request.with_field("identity", identity.as_str());
                }

                let outcome = gate.evaluate(&request).await;
                println!(
                    "{}",
                    serde_json::json!({
                        "attempt": attempt,
                        "at": clock.now().to_rfc3339(),
                        "outcome": outcome,
                    })
                );
                clock.advance_secs(interval_secs);
            }
        }
    }

    Ok(())
}

/// A store that refuses every call.
struct DownStore;

#[async_trait::async_trait]
impl CounterStore for DownStore {
    async fn increment(&self, _: &str, _: u64, _: DateTime<Utc>) -> Result<CounterRecord, StoreError> {
        Err(StoreError::Unavailable("simulated outage".to_string()))
    }

    async fn get(&self, _: &str, _: DateTime<Utc>) -> Result<Option<CounterRecord>, StoreError> {
        Err(StoreError::Unavailable("simulated outage".to_string()))
    }

    async fn set(&self, _: &str, _: u64, _: u64, _: DateTime<Utc>) -> Result<CounterRecord, StoreError> {
        Err(StoreError::Unavailable("simulated outage".to_string()))
    }

    async fn delete(&self, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("simulated outage".to_string()))
    }
}
