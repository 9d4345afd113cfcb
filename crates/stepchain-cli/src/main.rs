//! CLI binary for running and validating declarative step chains.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use stepchain_engine::{
    load_chain, CancelHandle, ChainEvent, ChainExecutor, ChainSpec, DocumentLoader, ProcessBackend,
    Severity, StepKind, StepchainConfig,
};
use stepchain_types::{ChainError, ChainOutput};

#[derive(Parser)]
#[command(name = "stepchain", version, about = "Declarative step-chain interpreter")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Refuse remote `$ref` documents
    #[arg(long, global = true)]
    offline: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a chain document
    Run {
        /// Path to the chain (.yaml, .yml or .json)
        chain: PathBuf,

        /// Configuration file with the unit table and limits
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write the chain output (results, context, exit) as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Abort after this many state-machine transitions (unbounded by default)
        #[arg(long)]
        max_transitions: Option<usize>,
    },

    /// Validate a chain document
    Validate {
        /// Path to the chain (.yaml, .yml or .json)
        chain: PathBuf,
    },

    /// Show the structure of a chain document
    Info {
        /// Path to the chain (.yaml, .yml or .json)
        chain: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut loader = if cli.offline {
        DocumentLoader::offline()
    } else {
        DocumentLoader::new()
    };

    let outcome = match cli.command {
        Commands::Run {
            chain,
            config,
            output,
            max_transitions,
        } => cmd_run(&mut loader, &chain, config.as_deref(), output.as_deref(), max_transitions).await,
        Commands::Validate { chain } => cmd_validate(&mut loader, &chain).await,
        Commands::Info { chain } => cmd_info(&mut loader, &chain).await,
    };

    match outcome {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

async fn cmd_run(
    loader: &mut DocumentLoader,
    path: &Path,
    config_path: Option<&Path>,
    output_path: Option<&Path>,
    max_transitions: Option<usize>,
) -> Result<i32, ChainError> {
    let (spec, diagnostics) = load_chain(loader, path).await?;
    print_diagnostics(&diagnostics);

    let mut config = match config_path {
        Some(p) => StepchainConfig::load(p).await?,
        None => StepchainConfig::default(),
    };
    if max_transitions.is_some() {
        config.chain.max_transitions = max_transitions;
    }

    println!("Running chain: {}", path.display());
    println!("Units configured: {}", config.backend.units.len());

    let backend = Arc::new(ProcessBackend::new(config.backend));
    let executor = ChainExecutor::new(backend).with_config(config.chain);
    let progress = spawn_progress(&executor);

    let cancel = CancelHandle::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; cancelling chain");
            trigger.cancel();
        }
    });

    let result = executor.run_with_cancel(&spec, &cancel).await;
    drop(executor);
    let _ = progress.await;
    let output = result?;

    print_summary(&output);
    if let Some(p) = output_path {
        output.save(p)?;
        println!("Output written to {}", p.display());
    }
    Ok(output.exit_code())
}

/// Print one line per unit as the chain progresses.
fn spawn_progress(executor: &ChainExecutor) -> tokio::task::JoinHandle<()> {
    let mut rx = executor.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                ChainEvent::UnitDispatched { ordinal, label, .. } => {
                    println!("  [{ordinal}] {label}");
                }
                ChainEvent::UnitCompleted {
                    ordinal,
                    success: false,
                    code,
                    ..
                } => {
                    println!("  [{ordinal}] failed with code {code}");
                }
                ChainEvent::ChainCompleted { .. }
                | ChainEvent::ChainAborted { .. }
                | ChainEvent::ChainFailed { .. } => break,
                _ => {}
            }
        }
    })
}

fn print_summary(output: &ChainOutput) {
    match &output.exit {
        None => println!("\nChain completed"),
        Some(exit) => println!(
            "\nChain exited with code {}: {}",
            exit.code,
            exit.message.as_deref().unwrap_or("(no message)")
        ),
    }
    println!("Units submitted: {}", output.units_submitted);
    println!("Results: {:?}", output.results.keys());
}

fn print_diagnostics(diagnostics: &[stepchain_engine::Diagnostic]) {
    for diag in diagnostics {
        let severity = match diag.severity {
            Severity::Error => "ERROR",
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        match &diag.path {
            Some(at) => println!("[{}] {} at {}: {}", severity, diag.rule, at, diag.message),
            None => println!("[{}] {}: {}", severity, diag.rule, diag.message),
        }
    }
}

async fn cmd_validate(loader: &mut DocumentLoader, path: &Path) -> Result<i32, ChainError> {
    let doc = loader.load_file(path).await?;
    let spec = ChainSpec::from_value(&doc)?;
    let diagnostics = stepchain_engine::validate(&spec);

    if diagnostics.is_empty() {
        println!("Chain is valid");
        return Ok(0);
    }
    print_diagnostics(&diagnostics);

    let has_error = diagnostics.iter().any(|d| d.severity == Severity::Error);
    Ok(if has_error {
        stepchain_types::EXIT_SPECIFICATION
    } else {
        0
    })
}

async fn cmd_info(loader: &mut DocumentLoader, path: &Path) -> Result<i32, ChainError> {
    let (spec, _) = load_chain(loader, path).await?;

    println!("Chain: {}", path.display());
    println!("Documents loaded: {}", loader.cached());
    println!("Setup expressions: {}", spec.setup.len());
    println!("Steps: {}", spec.step_count());
    println!("Loop depth: {}", spec.max_loop_depth());

    println!("\nSteps:");
    print_steps(&spec.steps, 1);

    let units = spec.units();
    if !units.is_empty() {
        println!("\nUnits:");
        for unit in units {
            println!("  {} {} ({} inputs)", unit.kind, unit.identifier, unit.inputs.len());
        }
    }
    Ok(0)
}

fn print_steps(steps: &[stepchain_engine::Step], depth: usize) {
    let indent = "  ".repeat(depth);
    for (i, step) in steps.iter().enumerate() {
        let guard = step
            .condition
            .as_ref()
            .map(|c| format!(" if {}", c.source()))
            .unwrap_or_default();
        println!("{indent}{i}: {}{guard}", step.describe());
        if let StepKind::Loop { steps, .. } = &step.kind {
            print_steps(steps, depth + 1);
        }
    }
}
