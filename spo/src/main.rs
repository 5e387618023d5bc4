//! Command-line front end for the prompt optimization loop.
//!
//! Reads `spo.toml`, starts a run against the configured backend, prints one
//! progress line per iteration and writes the run history as JSON.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use spo::controller::{StepError, StepOutcome};
use spo::core::types::RunState;
use spo::exit_codes;
use spo::io::capability::{ApiSettings, Capabilities};
use spo::io::chat::ChatBackend;
use spo::io::config::{Backend, DEFAULT_CONFIG_FILE, RunMode, SpoConfig, load_config, write_config};
use spo::io::export::{default_export_file_name, write_export};
use spo::io::service::ServiceClient;
use spo::logging;
use spo::looping::{LoopStop, run_loop};
use spo::session::{RunConfig, RunSession, SessionError};
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "spo",
    version,
    about = "Iteratively improve a prompt using model-judged pairwise comparisons"
)]
struct Cli {
    /// Config file to read.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log run progress to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if missing.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// List models offered by the backend.
    Models {
        #[arg(long, value_enum)]
        backend: Option<Backend>,
    },
    /// Optimize a prompt for a task.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Task description.
    #[arg(long, conflicts_with = "task_file", required_unless_present = "task_file")]
    task: Option<String>,

    /// Read the task description from a file.
    #[arg(long)]
    task_file: Option<PathBuf>,

    /// Seed prompt.
    #[arg(long, conflicts_with = "prompt_file", required_unless_present = "prompt_file")]
    prompt: Option<String>,

    /// Read the seed prompt from a file.
    #[arg(long)]
    prompt_file: Option<PathBuf>,

    /// Iteration budget (1-20). Overrides the config file.
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Ask before every iteration.
    #[arg(long)]
    manual: bool,

    /// Where to write the run history.
    #[arg(long)]
    export: Option<PathBuf>,

    #[arg(long, value_enum)]
    backend: Option<Backend>,
}

/// How a run's driving loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Stopped(LoopStop),
    /// The operator finished a manual run early.
    Quit,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Models { backend } => cmd_models(&cli.config, backend).await,
        Command::Run(args) => cmd_run(&cli.config, args).await,
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(path, &SpoConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

async fn cmd_models(config_path: &Path, backend: Option<Backend>) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let settings = api_settings(&cfg);
    let models = match backend.unwrap_or(cfg.backend) {
        Backend::Direct => {
            let client = ChatBackend::new(cfg.request_timeout(), cfg.max_tokens)?;
            if !settings.api_key.is_empty() {
                client.configure(&settings).await?;
            }
            client.list_models().await?
        }
        Backend::Service => {
            let client = ServiceClient::new(&cfg.service_url, cfg.request_timeout())?;
            client.list_models().await?
        }
    };
    for model in models {
        println!("{model}");
    }
    Ok(exit_codes::OK)
}

async fn cmd_run(config_path: &Path, args: RunArgs) -> Result<i32> {
    let mut cfg = load_config(config_path)?;
    if let Some(max_iterations) = args.max_iterations {
        cfg.max_iterations = max_iterations;
    }
    if args.manual {
        cfg.mode = RunMode::Manual;
    }
    if let Some(backend) = args.backend {
        cfg.backend = backend;
    }
    cfg.validate().context("invalid run options")?;

    let task_description = text_arg(args.task, args.task_file.as_deref(), "task")?;
    let initial_prompt = text_arg(args.prompt, args.prompt_file.as_deref(), "prompt")?;
    let run_config = RunConfig {
        settings: api_settings(&cfg),
        task_description,
        initial_prompt,
        max_iterations: cfg.max_iterations,
        mode: cfg.mode,
        concurrency: cfg.concurrency,
        early_stop_after_rejections: cfg.early_stop_after_rejections,
    };

    match cfg.backend {
        Backend::Direct => {
            let client = ChatBackend::new(cfg.request_timeout(), cfg.max_tokens)?;
            drive(client, run_config, args.export).await
        }
        Backend::Service => {
            let client = ServiceClient::new(&cfg.service_url, cfg.request_timeout())?;
            drive(client, run_config, args.export).await
        }
    }
}

async fn drive<C: Capabilities>(
    client: C,
    run_config: RunConfig,
    export: Option<PathBuf>,
) -> Result<i32> {
    let mode = run_config.mode;
    let session = RunSession::start(client, run_config)
        .await
        .context("start run")?;
    println!("baseline ready: {} samples", session.samples().len());

    let stop = session.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current iteration");
            stop.stop();
        }
    });

    let max_iterations = session.config().max_iterations;
    let ending = match mode {
        RunMode::Auto => run_loop(&session, |step| print_step(step, max_iterations))
            .await
            .map(|outcome| Ending::Stopped(outcome.stop))
            .map_err(anyhow::Error::from),
        RunMode::Manual => manual_loop(&session, max_iterations).await,
    };

    let snapshot = session.snapshot().await;
    print_summary(&snapshot.state);
    let now = Local::now();
    let export_path = export.unwrap_or_else(|| PathBuf::from(default_export_file_name(now)));
    write_export(&export_path, &session.export(now).await)
        .with_context(|| format!("write export {}", export_path.display()))?;
    println!("history written to {}", export_path.display());

    match ending? {
        Ending::Stopped(LoopStop::Cancelled) => Ok(exit_codes::CANCELLED),
        Ending::Stopped(_) | Ending::Quit => Ok(exit_codes::OK),
    }
}

async fn manual_loop<C: Capabilities>(session: &RunSession<C>, max_iterations: u32) -> Result<Ending> {
    loop {
        let snapshot = session.snapshot().await;
        if snapshot.state.terminated {
            let stop = snapshot
                .stop_reason
                .map_or(LoopStop::BudgetExhausted, LoopStop::from);
            return Ok(Ending::Stopped(stop));
        }

        print!(
            "iteration {}/{} next; Enter to run, q to finish: ",
            snapshot.state.iteration + 1,
            max_iterations
        );
        io::stdout().flush().context("flush stdout")?;
        let answer = tokio::task::spawn_blocking(read_answer)
            .await
            .context("join stdin reader")??;
        if answer.is_none_or(|line| line.trim().eq_ignore_ascii_case("q")) {
            session.cancel().await;
            return Ok(Ending::Quit);
        }

        match session.step().await {
            Ok(step) => print_step(&step, max_iterations),
            Err(StepError::Terminated) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// One line from stdin, `None` at end of input.
fn read_answer() -> Result<Option<String>> {
    let mut line = String::new();
    let read = io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read stdin")?;
    Ok((read > 0).then_some(line))
}

fn text_arg(inline: Option<String>, file: Option<&Path>, what: &str) -> Result<String> {
    match (inline, file) {
        (Some(text), _) => Ok(text),
        (None, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("read {what} {}", path.display()))
        }
        (None, None) => Ok(String::new()),
    }
}

fn api_settings(cfg: &SpoConfig) -> ApiSettings {
    ApiSettings {
        api_key: cfg.resolved_api_key().unwrap_or_default(),
        base_url: cfg.base_url.clone(),
        models: cfg.models.clone(),
    }
}

fn print_step(step: &StepOutcome, max_iterations: u32) {
    println!("{}", progress_line(step, max_iterations));
}

fn progress_line(step: &StepOutcome, max_iterations: u32) -> String {
    let verdict = if step.record.accepted {
        "accepted"
    } else {
        "rejected"
    };
    format!(
        "iteration {}/{}: {} (candidate={} baseline={} similar={})",
        step.record.iteration,
        max_iterations,
        verdict,
        step.tally.candidate_better,
        step.tally.baseline_better,
        step.tally.similar
    )
}

fn print_summary(state: &RunState) {
    println!();
    println!("final prompt:");
    println!("{}", state.current_best_prompt);
    println!();
    println!(
        "iterations: {}  accepted: {}  improvement rate: {:.1}%",
        state.iteration,
        state.accepted_count(),
        state.improvement_rate() * 100.0
    );
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let step = err.downcast_ref::<StepError>().or_else(|| {
        match err.downcast_ref::<SessionError>() {
            Some(SessionError::Step(step)) => Some(step),
            _ => None,
        }
    });
    match step {
        Some(StepError::OptimizationFailed(_) | StepError::EmptyCandidate) => exit_codes::HALTED,
        _ => exit_codes::INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spo::core::decision::Tally;
    use spo::core::types::{HistoryRecord, VerdictMap};

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["spo", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "spo",
            "run",
            "--task",
            "haiku",
            "--prompt-file",
            "seed.md",
            "--max-iterations",
            "4",
            "--manual",
            "--backend",
            "service",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.task.as_deref(), Some("haiku"));
        assert_eq!(args.prompt_file, Some(PathBuf::from("seed.md")));
        assert_eq!(args.max_iterations, Some(4));
        assert!(args.manual);
        assert_eq!(args.backend, Some(Backend::Service));
    }

    #[test]
    fn run_requires_task_and_prompt() {
        assert!(Cli::try_parse_from(["spo", "run", "--prompt", "p"]).is_err());
        assert!(Cli::try_parse_from(["spo", "run", "--task", "t"]).is_err());
        assert!(
            Cli::try_parse_from(["spo", "run", "--task", "t", "--task-file", "x", "--prompt", "p"])
                .is_err()
        );
    }

    #[test]
    fn progress_line_reports_tally() {
        let step = StepOutcome {
            record: HistoryRecord {
                iteration: 2,
                proposed_prompt: "p".to_string(),
                accepted: true,
                analysis: String::new(),
                verdicts: VerdictMap::new(),
            },
            tally: Tally {
                candidate_better: 2,
                baseline_better: 1,
                similar: 0,
            },
            terminated: false,
        };
        assert_eq!(
            progress_line(&step, 5),
            "iteration 2/5: accepted (candidate=2 baseline=1 similar=0)"
        );
    }

    #[test]
    fn aborted_steps_map_to_halted() {
        let err = anyhow::Error::from(StepError::EmptyCandidate);
        assert_eq!(exit_code_for(&err), exit_codes::HALTED);
        let err = anyhow::Error::from(SessionError::Configuration("x".to_string()))
            .context("start run");
        assert_eq!(exit_code_for(&err), exit_codes::INVALID);
    }
}
