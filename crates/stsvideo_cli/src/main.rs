//! `stsvideo` — command-line surface for the declarative video compiler.
//!
//! Plays the role the spec treats as an external collaborator: argument
//! parsing, logging setup, driving one-or-many output renders, and mapping
//! compiler errors to process exit codes (§6).

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use stsvideo_compiler::cancel::CancellationToken;
use stsvideo_compiler::error::ExitClass;
use stsvideo_compiler::orchestrator::RenderContext;
use stsvideo_compiler::{builder, CompileError};

#[derive(Parser)]
#[command(
    name = "stsvideo",
    version,
    about = "Compiles a declarative markup+style project into rendered video",
    long_about = "Parses a project.html document into a typed timeline, resolves \
                  fragment expressions, rasterizes HTML/app overlays, builds an \
                  ffmpeg filter graph per output, and renders it."
)]
struct Cli {
    /// Project directory containing project.html (defaults to the current directory).
    #[arg(long, value_name = "DIR")]
    project: Option<PathBuf>,

    /// Render only these outputs by data-name (defaults to every output in the document).
    #[arg(value_name = "OUTPUT")]
    outputs: Vec<String>,

    /// Overrides encoder presets with `-preset ultrafast` for fast iteration.
    #[arg(long)]
    dev: bool,

    /// Resolve and print the filter graph and input plan without invoking the encoder.
    #[arg(long)]
    dry_run: bool,

    /// Includes file/line/target in log output and the full error chain on failure.
    #[arg(long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("STSVIDEO_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if debug {
        subscriber.with_file(true).with_line_number(true).with_target(true).init();
    } else {
        subscriber.without_time().with_target(false).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let debug = cli.debug;
    init_logging(debug);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if debug {
                eprintln!("error: {err:#?}");
            } else {
                eprintln!("error: {err}");
            }
            exit_code_for(&err)
        }
    }
}

fn exit_code_for(err: &CompileError) -> ExitCode {
    match err.exit_class() {
        ExitClass::UserError => ExitCode::from(1),
        ExitClass::ExternalToolFailure => ExitCode::from(2),
        ExitClass::Cancelled => ExitCode::from(3),
    }
}

async fn run(cli: Cli) -> Result<(), CompileError> {
    let project_dir = cli.project.unwrap_or(std::env::current_dir()?);
    let token = CancellationToken::new();
    install_sigterm_handler(token.clone());

    if cli.dry_run {
        return run_dry(&project_dir, &cli.outputs);
    }

    let mut ctx = RenderContext::new(token, cli.dev)?;
    ctx.run(&project_dir, &cli.outputs, |name, mut rx| {
        let name = name.to_string();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let progress = rx.borrow();
                tracing::info!(
                    output = %name,
                    percent = progress.percent,
                    fps = progress.fps,
                    speed = %progress.speed,
                    "encoding"
                );
            }
        });
    })
    .await
}

/// `--dry-run`: resolves the filter graph and input plan for every
/// requested output and prints it as pretty JSON, skipping rasterization
/// and the encoder entirely (§9 supplemented feature).
fn run_dry(project_dir: &std::path::Path, outputs: &[String]) -> Result<(), CompileError> {
    let project = builder::build_project(project_dir)?;
    let names = stsvideo_compiler::orchestrator::resolve_output_names(&project, outputs)?;

    let mut plans = serde_json::Map::new();
    for name in names {
        let output = &project.outputs[&name];
        let plan = stsvideo_compiler::timeline::compile(&project, output)?;
        plans.insert(
            name,
            serde_json::json!({
                "filter_graph": plan.filter_graph,
                "inputs": plan.inputs,
            }),
        );
    }
    println!("{}", serde_json::to_string_pretty(&serde_json::Value::Object(plans))?);
    Ok(())
}

fn install_sigterm_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                token.cancel();
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            token.cancel();
        }
    });
}
