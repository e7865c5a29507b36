use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::warn;

use resumable_sampler::checkpoint::{
    Checkpoint, DeviceRngs, HistoryReconstructor, NumericBuffer, Settings, SnapshotStore,
    StateCodec,
};
use resumable_sampler::config::AppConfig;
use resumable_sampler::control::{handle_steer, ControlCommand, ControlRegistry};
use resumable_sampler::logging::init_logging;
use resumable_sampler::sampler::{
    ResumePlan, RunOutcome, Sampler, SamplerUpdate, Schedule, ShrinkDenoiser, SnapshotPolicy,
    SolverKind,
};
use resumable_sampler::session::RunId;

/// Run, inspect, and resume checkpointed sampling sessions.
#[derive(Parser)]
#[command(name = "resumable-sampler", about = "Pausable, resumable iterative sampler")]
struct Cli {
    /// Path to TOML configuration file
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a sampling session. Control commands are read from stdin, one per
    /// line: a bare word (PAUSE, PROCEED, SNAPSHOT, EXIT) or a JSON steer body.
    Run(RunArgs),
    /// Print the contents of a checkpoint file
    Inspect {
        path: PathBuf,
    },
    /// Print the derivative history rebuilt from a run directory
    History {
        run_dir: PathBuf,
        /// Step to walk back from
        #[arg(long)]
        step: u64,
        /// Number of earlier steps to look at
        #[arg(long, default_value_t = 2)]
        depth: usize,
    },
    /// Print a configuration file with every default filled in
    DefaultConfig,
}

#[derive(Args)]
struct RunArgs {
    /// Run identifier; defaults to run_<seed>
    #[arg(long)]
    run_id: Option<String>,

    /// Resume from this checkpoint file
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Override the RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Override the number of steps in the schedule
    #[arg(long)]
    steps: Option<u64>,

    /// Override the last step to execute
    #[arg(long)]
    end_at_step: Option<u64>,

    /// Override the solver: euler, euler_ancestral, multistep_2m, multistep_3m
    #[arg(long)]
    solver: Option<String>,

    /// Override the snapshot cadence
    #[arg(long)]
    snapshot_interval: Option<u64>,

    /// Override the per-run storage budget in megabytes
    #[arg(long)]
    storage_limit_mb: Option<u64>,

    /// Override the snapshot base directory
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Write the final state to this file
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::DefaultConfig = cli.command {
        print!("{}", AppConfig::default_toml());
        return Ok(());
    }

    let mut app_config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    if let Command::Run(args) = &cli.command {
        apply_overrides(&mut app_config, args);
        app_config.validate().context("validating config overrides")?;
    }

    init_logging(&app_config.logging.level)?;

    match cli.command {
        Command::Run(args) => run(app_config, args),
        Command::Inspect { path } => inspect(&path),
        Command::History {
            run_dir,
            step,
            depth,
        } => history(&run_dir, step, depth),
        Command::DefaultConfig => Ok(()),
    }
}

fn apply_overrides(config: &mut AppConfig, args: &RunArgs) {
    if let Some(seed) = args.seed {
        config.sampler.seed = seed;
    }
    if let Some(steps) = args.steps {
        config.sampler.steps = steps;
    }
    if let Some(end) = args.end_at_step {
        config.sampler.end_at_step = end;
    }
    if let Some(solver) = &args.solver {
        config.sampler.solver = solver.clone();
    }
    if let Some(interval) = args.snapshot_interval {
        config.snapshot.interval = interval;
    }
    if let Some(limit) = args.storage_limit_mb {
        config.snapshot.storage_limit_mb = limit;
    }
    if let Some(dir) = &args.base_dir {
        config.snapshot.base_dir = dir.clone();
    }
}

fn run(config: AppConfig, args: RunArgs) -> Result<()> {
    let sc = &config.sampler;
    let run_id = match &args.run_id {
        Some(id) => RunId::new(id.as_str())?,
        None => RunId::from_seed(sc.seed),
    };
    let Some(kind) = SolverKind::parse(&sc.solver) else {
        bail!("unknown solver '{}'", sc.solver);
    };

    let registry = Arc::new(ControlRegistry::with_poll_interval(
        std::time::Duration::from_millis(config.control.poll_interval_ms),
    ));
    let channel = registry.channel(&run_id);

    let mut store = SnapshotStore::from_config(&config.snapshot, run_id.clone())
        .with_context(|| format!("opening snapshot store for {run_id}"))?;
    let existing = store.rebuild_index().context("scanning run directory")?;
    if existing > 0 {
        println!("Found {existing} existing checkpoint(s) in {}", store.run_dir().display());
    }

    let schedule = Schedule::karras(sc.steps, sc.sigma_min, sc.sigma_max)?;
    let mut solver = kind.build(ShrinkDenoiser {
        strength: sc.denoise_strength,
    });
    let mut rngs = DeviceRngs::seeded(sc.seed);

    let plan = match &args.resume {
        Some(path) => ResumePlan::from_checkpoint(path, &mut rngs, solver.history_depth())
            .with_context(|| format!("resuming from {}", path.display()))?,
        None => {
            let initial = NumericBuffer::zeros(vec![sc.state_len]);
            match schedule.sigma_at(sc.start_at_step) {
                Some(sigma) if sc.add_noise => {
                    ResumePlan::noised(sc.start_at_step, initial, sigma, &mut rngs)
                }
                _ => ResumePlan::fresh(sc.start_at_step, initial),
            }
        }
    };

    let mut settings = Settings::new();
    settings.insert("seed".into(), json!(sc.seed));
    settings.insert("solver".into(), json!(kind.name()));
    settings.insert("steps".into(), json!(sc.steps));
    settings.insert("sigma_min".into(), json!(sc.sigma_min));
    settings.insert("sigma_max".into(), json!(sc.sigma_max));
    settings.insert("denoise_strength".into(), json!(sc.denoise_strength));

    println!(
        "Run {run_id}: {} steps with {}, snapshots every {} step(s) into {}",
        sc.steps,
        kind.name(),
        config.snapshot.interval,
        store.run_dir().display()
    );
    println!("Commands: PAUSE | PROCEED | SNAPSHOT | EXIT (or a JSON steer body)");

    let (update_tx, update_rx) = mpsc::channel::<SamplerUpdate>();
    let printer = std::thread::spawn(move || {
        for update in update_rx {
            print_update(&update);
        }
    });

    let control_registry = registry.clone();
    let control_run_id = run_id.clone();
    // Detached: blocks on stdin until the process exits.
    std::thread::spawn(move || read_commands(&control_registry, &control_run_id));

    let mut sampler = Sampler::new(channel, store)
        .with_policy(SnapshotPolicy::from(&config.snapshot))
        .with_settings(settings.clone())
        .with_updates(update_tx);
    let outcome = sampler.run(solver.as_mut(), &schedule, plan, sc.end_at_step, &mut rngs);

    let metrics = sampler.metrics();
    let summary = format!(
        "{} step(s), {} snapshot(s) ({} bytes), {} evicted, {} pause(s), {:.2} ms/step",
        metrics.steps_completed(),
        metrics.snapshots_written(),
        metrics.bytes_written(),
        metrics.checkpoints_evicted(),
        metrics.pauses(),
        metrics.avg_step_ms(100),
    );
    let latest = sampler.store().index().last().map(|e| e.path.clone());
    drop(sampler);
    let _ = printer.join();
    registry.remove(&run_id);

    let outcome = outcome?;
    println!("{summary}");
    match &outcome {
        RunOutcome::Completed { last_step, .. } => println!("Completed at step {last_step}"),
        RunOutcome::Aborted { last_step, .. } => {
            println!("Aborted after step {last_step}");
            if let Some(path) = latest {
                println!("Resume with: --run-id {run_id} --resume {}", path.display());
            }
        }
    }

    if let Some(output) = &args.output {
        let checkpoint =
            Checkpoint::capture(outcome.last_step(), outcome.state(), None, &settings, &rngs)
                .context("capturing final state")?;
        let size = StateCodec::save(output, &checkpoint)
            .with_context(|| format!("writing final state to {}", output.display()))?;
        println!("Final state written to {} ({size} bytes)", output.display());
    }

    Ok(())
}

fn read_commands(registry: &ControlRegistry, run_id: &RunId) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('{') {
            match handle_steer(registry, line) {
                Ok(resp) => match serde_json::to_string(&resp) {
                    Ok(body) => println!("{body}"),
                    Err(e) => warn!(error = %e, "Failed to encode steer response"),
                },
                Err(e) => warn!(error = %e, "Rejected control request"),
            }
        } else {
            let command = ControlCommand::parse_lossy(line);
            registry.send(run_id, command);
            println!(">> {command}");
        }
    }
}

fn print_update(update: &SamplerUpdate) {
    match update {
        SamplerUpdate::StepCompleted { step, end_step } => println!("Step {step}/{end_step}"),
        SamplerUpdate::Paused { after_step } => {
            println!("Paused after step {after_step}; send PROCEED to continue")
        }
        SamplerUpdate::Resumed {
            after_step,
            command,
        } => println!("Resumed after step {after_step} ({command})"),
        SamplerUpdate::SnapshotSaved {
            step,
            path,
            size_bytes,
            forced,
        } => println!(
            "  >> Snapshot{} at step {step}: {} ({size_bytes} bytes)",
            if *forced { " (forced)" } else { "" },
            path.display()
        ),
        SamplerUpdate::Evicted { steps, bytes_freed } => {
            println!("  >> Evicted steps {steps:?} ({bytes_freed} bytes freed)")
        }
        SamplerUpdate::Finished { last_step } => println!("Finished at step {last_step}"),
        SamplerUpdate::Aborted { last_step } => println!("Exit after step {last_step}"),
    }
}

fn inspect(path: &Path) -> Result<()> {
    let checkpoint =
        StateCodec::read(path).with_context(|| format!("reading checkpoint {}", path.display()))?;
    println!("File:         {}", path.display());
    println!("Step:         {}", checkpoint.step);
    println!("State shape:  {:?}", checkpoint.state.shape());
    println!("Has momentum: {}", checkpoint.has_momentum());
    println!(
        "RNG devices:  {}",
        checkpoint
            .rng_states
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "Settings:     {}",
        serde_json::to_string_pretty(&checkpoint.settings)?
    );
    Ok(())
}

fn history(run_dir: &Path, step: u64, depth: usize) -> Result<()> {
    if !run_dir.is_dir() {
        bail!("{} is not a directory", run_dir.display());
    }
    let history = HistoryReconstructor::gather(run_dir, step, depth);
    println!(
        "Recovered {} of {} frame(s) before step {step}",
        history.len(),
        depth
    );
    for frame in history.frames() {
        let norm = frame
            .derivative
            .values()
            .iter()
            .map(|v| v * v)
            .sum::<f32>()
            .sqrt();
        println!("  step {:>6}  |d| = {norm:.6}", frame.step);
    }
    Ok(())
}
