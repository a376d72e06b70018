use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration as StdDuration,
};

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Duration, DurationRound, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use shared_event_bus::{EventPublisher, FileEventPublisher};
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use tunnelflow_planning::explainer::{BoundedExplainer, RemoteExplainer};
use tunnelflow_scheduling::{
    ControlTelemetry, ControllerConfig, CurrentState, ForecastSeries, HorizonKind, MpcController,
    PumpStatus,
};
use tunnelflow_simulationengine::{
    NoisyForecaster, RollingSimulator, StormEvent, SyntheticScenario, SyntheticTunnel,
};

const DEFAULT_CONFIG: &str = "tunnelflow/pumpctl/config/default.toml";

#[derive(Parser, Debug)]
#[command(name = "pumpctl", version, about = "Tunnel pump scheduling controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Backtests the controller against the synthetic tunnel.
    Run(RunArgs),
    /// Checks a configuration file and prints its horizons.
    Validate {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Solves one cycle from flat inputs and prints the schedule.
    Solve(SolveArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Run length in hours.
    #[arg(long, default_value_t = 24.0)]
    hours: f64,
    /// Start time (RFC 3339); defaults to now, rounded down to 15 minutes.
    #[arg(long)]
    start: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, default_value_t = 3.0)]
    initial_level: f64,
    /// Relative forecast noise.
    #[arg(long, default_value_t = 0.1)]
    forecast_noise: f64,
    /// Forecasts ignore the storm.
    #[arg(long)]
    blind_forecast: bool,
    /// Storm start, hours after the run start.
    #[arg(long)]
    storm_at_hours: Option<f64>,
    #[arg(long, default_value_t = 3.0)]
    storm_hours: f64,
    #[arg(long, default_value_t = 4.0)]
    storm_peak: f64,
    #[arg(long, default_value_t = 0.0)]
    hours_since_flush: f64,
    /// Writes the full summary here instead of stdout.
    #[arg(long)]
    summary: Option<PathBuf>,
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[arg(long)]
    event_log: Option<PathBuf>,
    /// Narrative service endpoint; the algorithmic narrative is used without it.
    #[arg(long)]
    explainer_url: Option<String>,
    /// Bearer token for the narrative service.
    #[arg(long, env = "PUMPCTL_EXPLAINER_TOKEN")]
    explainer_token: Option<String>,
    #[arg(long, default_value_t = 2_000)]
    explainer_timeout_ms: u64,
}

#[derive(Parser, Debug)]
struct SolveArgs {
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Tunnel level (m).
    #[arg(long)]
    level: f64,
    /// Inflow held over the horizon (m³/s).
    #[arg(long)]
    inflow: f64,
    /// Price held over the horizon (EUR/kWh).
    #[arg(long)]
    price: f64,
    /// Tactical steps; defaults to the configured window.
    #[arg(long)]
    steps: Option<usize>,
    /// Pumps currently running, taken in table order.
    #[arg(long, default_value_t = 1)]
    running: usize,
    #[arg(long)]
    hours_since_flush: Option<f64>,
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => handle_run(args),
        Commands::Validate { config } => handle_validate(&config),
        Commands::Solve(args) => handle_solve(args),
    }
}

fn load_config(path: &Path) -> Result<ControllerConfig> {
    ControllerConfig::load(path).with_context(|| format!("loading config {}", path.display()))
}

fn build_telemetry(
    module: &str,
    log_file: Option<&PathBuf>,
    event_log: Option<&PathBuf>,
) -> Result<Option<ControlTelemetry>> {
    if log_file.is_none() && event_log.is_none() {
        return Ok(None);
    }
    let mut builder = ControlTelemetry::builder(module);
    if let Some(path) = log_file {
        builder = builder.log_path(path);
    }
    if let Some(path) = event_log {
        let publisher: Arc<dyn EventPublisher> = Arc::new(
            FileEventPublisher::new(path)
                .with_context(|| format!("opening event log {}", path.display()))?,
        );
        builder = builder.event_publisher(publisher);
    }
    Ok(Some(builder.build()?))
}

fn handle_validate(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "config": path,
            "pumps": config.pumps.iter().map(|pump| pump.id.as_str()).collect::<Vec<_>>(),
            "tactical_steps": config.horizon.tactical_steps(),
            "strategic_steps": config.horizon.strategic_steps(),
            "legacy_soft_mode": config.solver.legacy_soft_mode,
        }))?
    );
    Ok(())
}

fn handle_run(args: RunArgs) -> Result<()> {
    ensure!(args.hours > 0.0, "--hours must be positive");
    let config = load_config(&args.config)?;
    let start = match args.start {
        Some(start) => start,
        None => Utc::now().duration_trunc(Duration::minutes(15))?,
    };

    let mut scenario = SyntheticScenario::dry_weather(start, args.seed);
    scenario.initial_level_m = args.initial_level;
    if let Some(offset) = args.storm_at_hours {
        scenario = scenario.with_storm(StormEvent {
            start_offset_hours: offset,
            duration_hours: args.storm_hours,
            peak_m3s: args.storm_peak,
        });
    }
    let tunnel = SyntheticTunnel::new(scenario.clone(), config.pumps.clone(), &config.system);
    let mut forecaster = NoisyForecaster::new(scenario, args.forecast_noise);
    if args.blind_forecast {
        forecaster = forecaster.blind_to_storms();
    }

    let explainer_timeout = StdDuration::from_millis(args.explainer_timeout_ms);
    let explainer = match &args.explainer_url {
        Some(url) => {
            let mut remote = RemoteExplainer::new(url.clone(), explainer_timeout)?;
            if let Some(token) = &args.explainer_token {
                remote = remote.with_auth_token(token.clone());
            }
            BoundedExplainer::new(Arc::new(remote), explainer_timeout)
        }
        None => BoundedExplainer::algorithmic(),
    };
    let mut simulator = RollingSimulator::new(&config, Arc::new(tunnel), Arc::new(forecaster))?
        .with_hours_since_flush(args.hours_since_flush)
        .with_explainer(explainer);
    if let Some(telemetry) =
        build_telemetry("simulation", args.log_file.as_ref(), args.event_log.as_ref())?
    {
        simulator = simulator.with_telemetry(telemetry);
    }

    let end = start + Duration::minutes((args.hours * 60.0).round() as i64);
    let interval = Duration::minutes(i64::from(config.horizon.reoptimize_minutes));
    info!(%start, %end, seed = args.seed, "starting backtest");
    let runtime = Runtime::new()?;
    let summary = runtime.block_on(simulator.run_rolling(start, end, interval))?;

    let rendered = serde_json::to_string_pretty(&summary)?;
    match &args.summary {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("writing summary {}", path.display()))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "summary": path,
                    "cycles": summary.cycles,
                    "cost_savings_eur": summary.cost_savings_eur,
                    "cost_savings_pct": summary.cost_savings_pct,
                    "violations": summary.optimized.violation_count,
                    "baseline_violations": summary.baseline.violation_count,
                    "modes": summary.mode_counts,
                    "divergence_events": summary.divergence_events,
                }))?
            );
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn solve_state(config: &ControllerConfig, args: &SolveArgs, now: DateTime<Utc>) -> CurrentState {
    let pumps: Vec<PumpStatus> = config
        .pumps
        .iter()
        .enumerate()
        .map(|(idx, spec)| {
            if idx < args.running {
                PumpStatus::running(spec.id.clone(), spec.max_frequency_hz)
            } else {
                PumpStatus::off(spec.id.clone())
            }
        })
        .collect();
    let outflow_m3s = config
        .pumps
        .iter()
        .take(args.running)
        .map(|spec| spec.max_flow_m3s)
        .sum();
    CurrentState {
        timestamp: now,
        level_m: args.level,
        inflow_m3s: args.inflow,
        outflow_m3s,
        price_eur_kwh: args.price,
        pumps,
    }
}

fn handle_solve(args: SolveArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let now = Utc::now();
    let state = solve_state(&config, &args, now);
    let steps = args.steps.unwrap_or_else(|| config.horizon.tactical_steps());
    let tactical = ForecastSeries::flat(
        HorizonKind::Tactical,
        now,
        config.horizon.step_minutes,
        steps,
        args.inflow,
        args.price,
    );
    let mut controller = MpcController::from_config(&config);
    if let Some(telemetry) =
        build_telemetry("scheduling.controller", args.log_file.as_ref(), None)?
    {
        controller = controller.with_telemetry(telemetry);
    }
    let runtime = Runtime::new()?;
    let outcome = runtime.block_on(controller.solve_cycle(
        &state,
        &tactical,
        None,
        &config.system,
        &config.weights,
        args.hours_since_flush,
    ))?;
    println!("{}", serde_json::to_string_pretty(&outcome.result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml")
    }

    #[test]
    fn shipped_config_is_valid() {
        let config = load_config(&sample_config()).unwrap();
        assert_eq!(config.pumps.len(), 3);
        assert_eq!(config.horizon.tactical_steps(), 8);
        assert_eq!(config.horizon.strategic_steps(), 96);
    }

    #[test]
    fn parses_run_with_storm() {
        let cli = Cli::try_parse_from([
            "pumpctl",
            "run",
            "--hours",
            "6",
            "--storm-at-hours",
            "2",
            "--blind-forecast",
            "--start",
            "2024-06-01T00:00:00Z",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert!((args.hours - 6.0).abs() < f64::EPSILON);
                assert_eq!(args.storm_at_hours, Some(2.0));
                assert!(args.blind_forecast);
                assert!(args.start.is_some());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn solve_state_runs_leading_pumps() {
        let config = load_config(&sample_config()).unwrap();
        let cli = Cli::try_parse_from([
            "pumpctl",
            "solve",
            "--level",
            "7.9",
            "--inflow",
            "3.0",
            "--price",
            "0.05",
            "--running",
            "2",
        ])
        .unwrap();
        let Commands::Solve(args) = cli.command else {
            panic!("expected solve");
        };
        let state = solve_state(&config, &args, Utc::now());
        assert!(state.pumps[0].is_on && state.pumps[1].is_on && !state.pumps[2].is_on);
        assert!((state.outflow_m3s - 4.0).abs() < 1e-12);
    }

    #[test]
    fn telemetry_is_optional() {
        assert!(build_telemetry("simulation", None, None).unwrap().is_none());
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("run.log");
        assert!(build_telemetry("simulation", Some(&log), None)
            .unwrap()
            .is_some());
    }
}
