use std::{path::PathBuf, sync::Arc};

use casesim::{
    providers::{openai::OpenAI, scripted::ScriptedProvider},
    ChatOrchestrator, CriteriaGoalEvaluator, GoalEvaluator, InMemoryMetricsCollector,
    InMemoryProgressStore, InMemoryScenarioStore, JsonFileProgressStore, LLMProvider,
    LayeredGoalEvaluator, LlmGoalEvaluator, MetricsCollector, ProgressStore,
    ProviderResponseGenerator, ResponseMode, Scenario, SimulationConfig, TurnOutcome,
};
use clap::Parser;
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "simulate")]
#[command(about = "Play through a business case scenario from the terminal")]
struct Args {
    /// Scenario document (YAML or JSON)
    scenario: PathBuf,

    /// File with one student message per line; reads stdin when omitted
    #[arg(long)]
    script: Option<PathBuf>,

    /// Student identifier used for progress records
    #[arg(long, default_value = "cli-student")]
    student: String,

    /// Call OpenAI (OPENAI_API_KEY) instead of the offline scripted provider
    #[arg(long)]
    openai: bool,

    /// Canned persona reply used by the scripted provider
    #[arg(long, default_value = "That's an interesting point. Tell me more.")]
    reply: String,

    /// sequential or concurrent
    #[arg(long)]
    mode: Option<ResponseMode>,

    /// Persist progress as JSON files in this directory
    #[arg(long)]
    progress_dir: Option<PathBuf>,

    /// Print aggregated turn metrics at the end
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let document = tokio::fs::read_to_string(&args.scenario).await?;
    let scenario = match args.scenario.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Scenario::from_json_str(&document)?,
        _ => Scenario::from_yaml_str(&document)?,
    };
    let scenario_id = scenario.id.clone();
    let scenarios = Arc::new(InMemoryScenarioStore::with_scenarios([scenario])?);

    let mut config = SimulationConfig::from_env();
    if let Some(mode) = args.mode {
        config = config.with_response_mode(mode);
    }

    let (provider, evaluator): (Arc<dyn LLMProvider>, Arc<dyn GoalEvaluator>) = if args.openai {
        let provider: Arc<dyn LLMProvider> = Arc::new(OpenAI::from_env()?);
        let judge = LlmGoalEvaluator::new(provider.clone(), config.model.clone());
        (provider, Arc::new(LayeredGoalEvaluator::new(Arc::new(judge))))
    } else {
        (
            Arc::new(ScriptedProvider::new().with_fallback(args.reply.clone())),
            Arc::new(CriteriaGoalEvaluator::new()),
        )
    };

    let progress: Arc<dyn ProgressStore> = match &args.progress_dir {
        Some(dir) => Arc::new(JsonFileProgressStore::open(dir).await?),
        None => Arc::new(InMemoryProgressStore::new()),
    };

    let metrics = Arc::new(InMemoryMetricsCollector::new());
    let generator = Arc::new(ProviderResponseGenerator::from_config(provider, &config));
    let orchestrator = ChatOrchestrator::new(scenarios, progress, generator, evaluator)
        .with_config(config)
        .with_metrics_collector(metrics.clone());

    let messages: Vec<String> = match &args.script {
        Some(path) => tokio::fs::read_to_string(path)
            .await?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    };

    println!("{}", format!("=== {scenario_id} ===").bold());
    if args.script.is_some() {
        for message in messages {
            println!("{} {}", "you>".bright_green().bold(), message);
            if !run_turn(&orchestrator, &args.student, &scenario_id, &message).await {
                break;
            }
        }
    } else {
        println!("{}", "Type a message and press enter. Ctrl-D quits.".dimmed());
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !run_turn(&orchestrator, &args.student, &scenario_id, line).await {
                break;
            }
        }
    }

    if args.metrics {
        let aggregated = metrics.aggregated();
        println!(
            "\n{} {} turns, {:.0}% ok, {} generator calls, {} tokens, avg {:?}",
            "metrics:".bold(),
            aggregated.total_turns,
            aggregated.success_rate * 100.0,
            aggregated.generation_attempts,
            aggregated.total_tokens,
            aggregated.average_turn_duration,
        );
    }
    Ok(())
}

/// Returns false once the scenario is finished or rejects further input.
async fn run_turn(orchestrator: &ChatOrchestrator, student: &str, scenario_id: &str, message: &str) -> bool {
    match orchestrator.handle_message(student, scenario_id, message).await {
        Ok(outcome) => {
            print_outcome(&outcome);
            !outcome.progress.completed
        }
        Err(err) if err.is_retryable() => {
            eprintln!("{} {err} (try again)", "error:".bright_red().bold());
            true
        }
        Err(err) => {
            eprintln!("{} {err}", "error:".bright_red().bold());
            false
        }
    }
}

fn print_outcome(outcome: &TurnOutcome) {
    for reply in &outcome.responses {
        println!("{} {}", format!("{}:", reply.persona_name).bright_cyan().bold(), reply.text);
    }
    if let Some(narration) = &outcome.narration {
        println!("{}", narration.yellow());
    }
    if outcome.goal_uncertain {
        println!("{}", "(the objective could not be judged this turn)".dimmed());
    }
    let progress = &outcome.progress;
    println!(
        "{}",
        format!(
            "[{}% | scene {}/{} | turn {}]",
            progress.percent_complete,
            (progress.scene_index + 1).min(progress.scene_count),
            progress.scene_count,
            progress.turn_count
        )
        .dimmed()
    );
}
