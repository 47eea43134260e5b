mod backoff;
mod config;
mod copilot;
mod gateway;
mod llm;
mod sandbox;

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::copilot::Copilot;
use crate::gateway::{Admission, AdmissionResponse, Gateway, GatewayError, ValidationPolicy, Verdict};
use crate::sandbox::Executor;

const DEFAULT_CONFIG_PATH: &str = "config/copilot.toml";

fn print_help() {
    println!(
        "\
cad-copilot v{}

Turns natural-language requests into CAD models. Every generated script
passes a static validator and runs in a separate interpreter process
with a deadline before its artifact is returned.

USAGE:
    cad-copilot [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    check <SCRIPT>                  Validate a script without running it
    run <SCRIPT>                    Validate and execute a script
    generate <PROMPT>...            Generate a model from a description
    refine <SCRIPT> <INSTRUCTION>...
                                    Modify a previous script
    status                          Report LLM, interpreter and output dir health
    sweep                           Delete expired files from the output dir

    SCRIPT may be `-` to read from standard input.

OPTIONS:
    -c, --config <PATH>    TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing, overrides `log_level`
                (e.g. debug, cad_copilot=debug,warn)

EXAMPLES:
    cad-copilot generate a 20mm cube with a 5mm hole
    cad-copilot check model.py
    cad-copilot -c /etc/cad-copilot.toml status",
        env!("CARGO_PKG_VERSION"),
    );
}

enum Command {
    Check(String),
    Run(String),
    Generate(String),
    Refine { script: String, instruction: String },
    Status,
    Sweep,
}

struct Args {
    config_path: Option<String>,
    command: Command,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut config_path = None;
    let mut positional = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("cad-copilot v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--config" | "-c" => {
                config_path = Some(args.next().context("--config needs a path")?);
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let name = positional
        .next()
        .context("missing command (see --help)")?;
    let rest: Vec<String> = positional.collect();

    let command = match (name.as_str(), rest.as_slice()) {
        ("check", [script]) => Command::Check(script.clone()),
        ("run", [script]) => Command::Run(script.clone()),
        ("generate", words) if !words.is_empty() => Command::Generate(words.join(" ")),
        ("refine", [script, words @ ..]) if !words.is_empty() => Command::Refine {
            script: script.clone(),
            instruction: words.join(" "),
        },
        ("status", []) => Command::Status,
        ("sweep", []) => Command::Sweep,
        _ => bail!("invalid command line for `{name}` (see --help)"),
    };

    Ok(Args {
        config_path,
        command,
    })
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH),
        None => Ok(Config::default()),
    }
}

async fn read_script(source: &str) -> Result<String> {
    if source == "-" {
        let mut script = String::new();
        tokio::io::stdin()
            .read_to_string(&mut script)
            .await
            .context("Cannot read script from stdin")?;
        return Ok(script);
    }
    tokio::fs::read_to_string(source)
        .await
        .with_context(|| format!("Cannot read script {source}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints the outcome and returns whether it was a success.
fn report<T: Serialize, E: Serialize>(outcome: Result<T, E>) -> Result<bool> {
    match outcome {
        Ok(value) => print_json(&value).map(|_| true),
        Err(error) => print_json(&error).map(|_| false),
    }
}

/// The JSON carries the public artifact URL; the local file goes to the log.
fn admission_response(admission: &Admission) -> AdmissionResponse {
    info!("Artifact written to {}", admission.artifact_path.display());
    admission.to_response()
}

#[derive(Serialize)]
struct CheckResponse<'a> {
    status: &'static str,
    code: &'a str,
    synthesized_binding: bool,
    observations: &'a gateway::Observations,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    let config = load_config(args.config_path.as_deref())?;

    // Logs go to stderr; stdout carries the JSON result
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("cad_copilot={}", config.log_level.as_str()))
        }))
        .init();

    match &args.config_path {
        Some(path) => info!("Loaded configuration from {path}"),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loaded configuration from {DEFAULT_CONFIG_PATH}")
        }
        None => warn!("No {DEFAULT_CONFIG_PATH} found, using defaults"),
    }

    tokio::fs::create_dir_all(&config.cad.output_dir)
        .await
        .with_context(|| {
            format!(
                "Cannot create output directory {}",
                config.cad.output_dir.display()
            )
        })?;

    let policy = ValidationPolicy::from_config(&config.policy)?;
    let executor = Executor::new(&config.cad);
    info!(
        "Interpreter: {}, deadline {}s, output dir {}",
        executor
            .executable()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<unset>".to_string()),
        executor.deadline().as_secs(),
        executor.output_dir().display()
    );
    let gateway = Gateway::new(policy, executor);

    let succeeded = match args.command {
        Command::Check(source) => {
            let script = read_script(&source).await?;
            match gateway.check(&script) {
                Verdict::Accepted(source) => {
                    print_json(&CheckResponse {
                        status: "accepted",
                        code: source.as_str(),
                        synthesized_binding: source.synthesized_binding(),
                        observations: source.observations(),
                    })?;
                    true
                }
                Verdict::Rejected(rejection) => {
                    print_json(&GatewayError::from(rejection).to_response())?;
                    false
                }
            }
        }
        Command::Run(source) => {
            let script = read_script(&source).await?;
            let outcome = gateway.admit(&script).await;
            report(
                outcome
                    .as_ref()
                    .map(admission_response)
                    .map_err(|e| e.to_response()),
            )?
        }
        Command::Generate(prompt) => {
            let copilot = Copilot::new(llm::from_config(&config.llm)?, gateway);
            let outcome = copilot.generate(&prompt).await;
            report(
                outcome
                    .as_ref()
                    .map(admission_response)
                    .map_err(|e| e.to_response()),
            )?
        }
        Command::Refine {
            script,
            instruction,
        } => {
            let previous = read_script(&script).await?;
            let copilot = Copilot::new(llm::from_config(&config.llm)?, gateway);
            let outcome = copilot.refine(&previous, &instruction).await;
            report(
                outcome
                    .as_ref()
                    .map(admission_response)
                    .map_err(|e| e.to_response()),
            )?
        }
        Command::Status => {
            let copilot = Copilot::new(llm::from_config(&config.llm)?, gateway);
            let status = copilot.status().await;
            print_json(&status)?;
            status.status == "ok"
        }
        Command::Sweep => {
            let executor = gateway.executor();
            let swept = sandbox::sweeper::sweep(executor.output_dir(), executor.retention()).await;
            print_json(&swept)?;
            swept.failed == 0
        }
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
