use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use puppet_core::TaskKind;
use puppet_runner::{
    build_order_of_tasks, generate_trial_set, parse_answer, parse_trial_descriptor, score_answer,
    GroundTruth, TrialDescriptor,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "puppet", version = "0.2.0", about = "Subtle Game puppeteer tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a randomized trial plan from a simulation catalog file.
    Plan {
        catalog: PathBuf,
        #[arg(long, default_value_t = 3)]
        repeats: usize,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Print the designated-correct answer for every simulation in a catalog.
    AnswerKey {
        catalog: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Score a submitted answer against one simulation identifier.
    CheckKey {
        simulation: String,
        answer: String,
        #[arg(long)]
        json: bool,
    },
    /// Print a randomized task order for an experiment run.
    TaskOrder {
        #[arg(long)]
        short: bool,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Plan {
            catalog,
            repeats,
            seed,
            json,
        } => {
            let descriptors = read_catalog(&catalog)?;
            let mut rng = seeded_rng(seed);
            let set = generate_trial_set(&descriptors, repeats, &mut rng)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "repeats": repeats,
                    "practice": set.practice.iter().map(trial_to_json).collect::<Vec<_>>(),
                    "main": set.main.iter().map(trial_to_json).collect::<Vec<_>>(),
                })));
            }
            println!("practice:");
            for trial in &set.practice {
                print_trial(trial);
            }
            println!("main:");
            for trial in &set.main {
                print_trial(trial);
            }
        }
        Commands::AnswerKey { catalog, json } => {
            let descriptors = read_catalog(&catalog)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "answer-key",
                    "simulations": descriptors.iter().map(trial_to_json).collect::<Vec<_>>(),
                })));
            }
            for trial in &descriptors {
                println!(
                    "{}: {}",
                    trial.simulation_name,
                    ground_truth_label(trial.ground_truth)
                );
            }
        }
        Commands::CheckKey {
            simulation,
            answer,
            json,
        } => {
            let trial = parse_trial_descriptor(&simulation, 0)?;
            let answer = parse_answer(&answer)?;
            let verdict = score_answer(trial.ground_truth, answer);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "check-key",
                    "simulation": trial.simulation_name,
                    "ground_truth": ground_truth_label(trial.ground_truth),
                    "answer": answer.as_str(),
                    "verdict": verdict.shared_state_value(),
                })));
            }
            println!("ground_truth: {}", ground_truth_label(trial.ground_truth));
            println!("verdict: {}", verdict.shared_state_value());
        }
        Commands::TaskOrder { short, seed, json } => {
            let mut rng = seeded_rng(seed);
            let order = build_order_of_tasks(short, &mut rng);
            let names: Vec<&str> = order.iter().map(TaskKind::shared_state_name).collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "task-order",
                    "short": short,
                    "order": names,
                })));
            }
            for name in names {
                println!("{}", name);
            }
        }
    }
    Ok(None)
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Reads a catalog file of one simulation identifier per line; blank
/// lines and `#` comments are skipped. Line order fixes each
/// simulation's server index.
fn read_catalog(path: &Path) -> Result<Vec<TrialDescriptor>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog '{}'", path.display()))?;
    let mut descriptors = Vec::new();
    for (server_index, line) in raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .enumerate()
    {
        descriptors.push(parse_trial_descriptor(line, server_index as u64)?);
    }
    if descriptors.is_empty() {
        anyhow::bail!("catalog '{}' contains no simulations", path.display());
    }
    Ok(descriptors)
}

fn ground_truth_label(ground_truth: GroundTruth) -> &'static str {
    match ground_truth {
        GroundTruth::Ambivalent => "ambivalent",
        GroundTruth::Molecule(molecule) => molecule.as_str(),
    }
}

fn trial_to_json(trial: &TrialDescriptor) -> Value {
    json!({
        "simulation": trial.simulation_name,
        "server_index": trial.server_index,
        "multiplier": trial.multiplier,
        "modified_molecule": trial.modified_molecule.as_str(),
        "ground_truth": ground_truth_label(trial.ground_truth),
    })
}

fn print_trial(trial: &TrialDescriptor) {
    println!(
        "  {} (x{}, correct: {})",
        trial.simulation_name,
        trial.multiplier,
        ground_truth_label(trial.ground_truth)
    );
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Plan { json, .. }
        | Commands::AnswerKey { json, .. }
        | Commands::CheckKey { json, .. }
        | Commands::TaskOrder { json, .. } => *json,
    }
}
