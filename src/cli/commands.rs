//! CLI command implementations
//!
//! Commands are thin: they load and validate configuration, drive the
//! library and print JSON to stdout.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::client::{RealtimeClient, MESSAGES_TABLE, MESSAGE_EVENT};
use crate::config::LiveConfig;
use crate::connection::ConnectionStatus;
use crate::observability::{Logger, MetricsSnapshot};
use crate::store::MemoryStore;
use crate::transport::{ChangeRecord, MemoryTransport};

use super::args::Command;
use super::errors::{CliError, CliResult};

const SIM_TOPIC: &str = "room:simulation";
const SIM_USER: &str = "simulator";

/// Parse arguments and run the selected command
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::CheckConfig { config } => check_config(&config),
        Command::Backoff { config } => backoff(config.as_deref()),
        Command::Simulate {
            config,
            messages,
            drop_rate,
            duplicate_rate,
            disconnects,
            seed,
        } => {
            let options = SimulationOptions {
                messages,
                drop_rate,
                duplicate_rate,
                disconnects,
                seed,
            };
            simulate(config.as_deref(), options)
        }
    }
}

/// Load the config file, or defaults when none is given, and apply its
/// log level
fn load_config(path: Option<&Path>) -> CliResult<LiveConfig> {
    let config = match path {
        Some(path) => LiveConfig::load(path)?,
        None => {
            let config = LiveConfig::default();
            config.validate()?;
            config
        }
    };
    Logger::set_min_severity(config.severity()?);
    Ok(config)
}

fn write_json(value: &impl Serialize, pretty: bool) -> CliResult<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{}", text)?;
    out.flush()?;
    Ok(())
}

/// Validate a configuration file and print the effective values
pub fn check_config(config_path: &Path) -> CliResult<()> {
    let config = load_config(Some(config_path))?;
    write_json(&config, true)
}

/// Print one JSON line per reconnect attempt
pub fn backoff(config_path: Option<&Path>) -> CliResult<()> {
    let config = load_config(config_path)?;
    for line in backoff_schedule(&config) {
        write_json(&line, false)?;
    }
    Ok(())
}

fn backoff_schedule(config: &LiveConfig) -> Vec<Value> {
    let policy = &config.backoff;
    (0..policy.max_retries)
        .map(|attempt| {
            let (min, max) = policy.delay_bounds(attempt);
            json!({
                "attempt": attempt + 1,
                "base_ms": policy.base_delay(attempt).as_millis() as u64,
                "min_ms": min.as_millis() as u64,
                "max_ms": max.as_millis() as u64,
            })
        })
        .collect()
}

/// Loss pattern for one simulation run
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub messages: usize,
    pub drop_rate: f64,
    pub duplicate_rate: f64,
    pub disconnects: usize,
    pub seed: u64,
}

impl SimulationOptions {
    fn validate(&self) -> CliResult<()> {
        for (name, rate) in [
            ("drop_rate", self.drop_rate),
            ("duplicate_rate", self.duplicate_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(CliError::invalid_argument(format!(
                    "{} must be within [0, 1], got {}",
                    name, rate
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of one simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub run_id: String,
    pub messages: usize,
    /// Notifications that reached a live subscription
    pub notifications_sent: usize,
    /// Messages with at least one notification through
    pub expected_deliveries: usize,
    /// Distinct messages handed to the application
    pub delivered: usize,
    /// Extra callbacks beyond the first per message
    pub duplicate_deliveries: usize,
    pub disconnects: usize,
    pub metrics: MetricsSnapshot,
}

/// Run a simulation on a fresh runtime and print the report
pub fn simulate(config_path: Option<&Path>, options: SimulationOptions) -> CliResult<()> {
    let config = load_config(config_path)?;
    options.validate()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::runtime_failed(e.to_string()))?;
    let report = runtime.block_on(run_simulation(config, &options));

    write_json(&report, true)
}

/// Wait until the simulated topic is connected again, or give up at
/// `deadline`
async fn wait_connected(client: &RealtimeClient, deadline: Instant) -> bool {
    loop {
        if client.status(SIM_TOPIC) == Some(ConnectionStatus::Connected) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Longest a full retry cycle can take
fn reconnect_budget(config: &LiveConfig) -> Duration {
    let policy = &config.backoff;
    (0..policy.max_retries.max(1))
        .map(|attempt| policy.delay_bounds(attempt).1)
        .sum::<Duration>()
        + Duration::from_secs(1)
}

/// Publish `options.messages` messages over both notification paths with
/// random loss, duplication and server-side disconnects
pub async fn run_simulation(config: LiveConfig, options: &SimulationOptions) -> SimulationReport {
    let transport = Arc::new(MemoryTransport::new());
    let store = Arc::new(MemoryStore::new());
    let budget = reconnect_budget(&config);
    let client = RealtimeClient::new(
        SIM_USER,
        config,
        transport.clone(),
        store.clone(),
        store.clone(),
    );

    let received: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = Arc::clone(&received);
    let subscription = client.subscribe_to_messages(SIM_TOPIC, move |message| {
        if let Some(id) = message.get("id").and_then(Value::as_str) {
            let mut received = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            *received.entry(id.to_string()).or_insert(0) += 1;
        }
    });
    wait_connected(&client, Instant::now() + budget).await;

    let mut rng = StdRng::seed_from_u64(options.seed);
    let disconnect_every = match options.disconnects {
        0 => None,
        n => Some((options.messages / (n + 1)).max(1)),
    };
    let mut notifications_sent = 0;
    let mut expected_deliveries = 0;
    let mut disconnects = 0;

    for i in 0..options.messages {
        if let Some(every) = disconnect_every {
            if i > 0 && i % every == 0 && disconnects < options.disconnects {
                transport.close(SIM_TOPIC);
                disconnects += 1;
                sleep(Duration::from_millis(1)).await;
                wait_connected(&client, Instant::now() + budget).await;
            }
        }

        let id = format!("m-{:05}", i);
        store.insert("message", &id, json!({"id": id, "body": format!("message {}", i)}));

        let mut reached = 0;
        if !rng.gen_bool(options.drop_rate) {
            reached += transport.broadcast(SIM_TOPIC, MESSAGE_EVENT, json!({"id": id}));
            if rng.gen_bool(options.duplicate_rate) {
                reached += transport.broadcast(SIM_TOPIC, MESSAGE_EVENT, json!({"id": id}));
            }
        }
        if !rng.gen_bool(options.drop_rate) {
            reached += transport.change(
                SIM_TOPIC,
                ChangeRecord::insert(MESSAGES_TABLE, json!({"id": id})),
            );
        }

        notifications_sent += reached;
        if reached > 0 {
            expected_deliveries += 1;
        }
        tokio::task::yield_now().await;
    }

    // Let the delivery worker drain
    sleep(Duration::from_millis(50)).await;
    subscription.cleanup();

    let metrics = client.metrics();
    client.shutdown();

    let received = received.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    SimulationReport {
        run_id: Uuid::new_v4().to_string(),
        messages: options.messages,
        notifications_sent,
        expected_deliveries,
        delivered: received.len(),
        duplicate_deliveries: received.values().map(|count| count - 1).sum(),
        disconnects,
        metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn options(seed: u64) -> SimulationOptions {
        SimulationOptions {
            messages: 120,
            drop_rate: 0.3,
            duplicate_rate: 0.5,
            disconnects: 2,
            seed,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_delivers_each_reachable_message_once() {
        let report = run_simulation(LiveConfig::default(), &options(7)).await;

        assert_eq!(report.disconnects, 2);
        assert!(report.expected_deliveries > 0);
        assert_eq!(report.delivered, report.expected_deliveries);
        assert_eq!(report.duplicate_deliveries, 0);
        assert_eq!(report.metrics.deliveries as usize, report.delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lossless_simulation_delivers_everything() {
        let lossless = SimulationOptions {
            drop_rate: 0.0,
            duplicate_rate: 1.0,
            disconnects: 0,
            ..options(1)
        };
        let report = run_simulation(LiveConfig::default(), &lossless).await;

        assert_eq!(report.delivered, 120);
        assert_eq!(report.notifications_sent, 360);
        assert_eq!(report.metrics.duplicates_dropped, 240);
    }

    #[test]
    fn test_rates_outside_unit_interval_rejected() {
        let bad = SimulationOptions {
            drop_rate: 1.5,
            ..options(1)
        };
        assert!(bad.validate().is_err());
        assert!(options(1).validate().is_ok());
    }

    #[test]
    fn test_backoff_schedule_has_one_line_per_retry() {
        let config = LiveConfig::default();
        let schedule = backoff_schedule(&config);

        assert_eq!(schedule.len(), config.backoff.max_retries as usize);
        assert_eq!(schedule[0]["attempt"], 1);
        assert_eq!(
            schedule[0]["base_ms"].as_u64(),
            Some(config.backoff.initial_delay_ms)
        );
    }

    #[test]
    fn test_load_config_reports_invalid_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"dedup_capacity": 0}}"#).unwrap();

        let err = load_config(Some(file.path())).unwrap_err();
        assert_eq!(err.code_str(), "AERO_LIVE_CONFIG_ERROR");
    }
}
