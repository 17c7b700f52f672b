//! # CLI
//!
//! Diagnostics over the built-in sequences:
//! - `fhir-harness list` prints every sequence and its tests
//! - `fhir-harness deps <sequence> --config harness.json` reports missing inputs
//! - `fhir-harness run <sequence> --config harness.json` runs one sequence
//!
//! `run` exits non-zero when the sequence fails or errors, for CI use.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use thiserror::Error;

use crate::config::{self, HarnessConfig};
use crate::deps;
use crate::engine::SequenceEngine;
use crate::error::{ClientError, ConfigError, EngineError, RegistrationError, StoreError};
use crate::http::{LoggedRestClient, ReqwestTransport, RestFhirClient};
use crate::instance::InstanceContext;
use crate::model::{RunGrouping, SequenceRun};
use crate::registry::Registry;
use crate::sequences;
use crate::status::Status;
use crate::store::{MemoryStore, RunStore, SqliteStore};

#[derive(Debug, Parser)]
#[command(
    name = "fhir-harness",
    version,
    about = "Run FHIR conformance test sequences against a server."
)]
pub struct HarnessArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List every registered sequence and its tests.
    List,
    /// Show the inputs a sequence is missing and which sequences supply them.
    Deps {
        sequence: String,
        #[arg(long)]
        config: PathBuf,
        /// Only report the sequence's own inputs.
        #[arg(long)]
        shallow: bool,
    },
    /// Run a sequence against the configured instance.
    Run {
        sequence: String,
        #[arg(long)]
        config: PathBuf,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Failed to encode output")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to write output")]
    Io(#[from] io::Error),

    #[error("instance has no `url` parameter")]
    MissingUrl,
}

pub fn execute(args: HarnessArgs) -> Result<ExitCode, CliError> {
    let registry = sequences::registry()?;
    let mut out = io::stdout().lock();

    match args.command {
        Command::List => {
            config::init_logging("warn");
            render_list(&registry, &mut out)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Deps {
            sequence,
            config,
            shallow,
        } => {
            let config = HarnessConfig::load(&config)?;
            config::init_logging(&config.log_filter);
            render_deps(&registry, &sequence, &config.instance, !shallow, &mut out)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            sequence,
            config,
            format,
        } => {
            let config = HarnessConfig::load(&config)?;
            config::init_logging(&config.log_filter);
            let run = run_sequence(&registry, &sequence, config)?;
            match format {
                OutputFormat::Text => render_run(&run, &mut out)?,
                OutputFormat::Json => writeln!(out, "{}", serde_json::to_string_pretty(&run)?)?,
            }
            Ok(match run.result {
                Status::Fail | Status::Error => ExitCode::FAILURE,
                _ => ExitCode::SUCCESS,
            })
        }
    }
}

fn run_sequence(registry: &Registry, name: &str, config: HarnessConfig) -> Result<SequenceRun, CliError> {
    let sequence = registry
        .sequence(name)
        .ok_or_else(|| EngineError::UnknownSequence(name.to_string()))?;

    let mut instance = config.instance;
    let url = instance.get("url").ok_or(CliError::MissingUrl)?.to_string();
    let mut client = RestFhirClient::new(&url, &config.http)?;
    let rest = LoggedRestClient::new(Box::new(ReqwestTransport::new(&config.http)?));
    let mut store: Box<dyn RunStore> = match &config.database_path {
        Some(path) => Box::new(SqliteStore::open(path)?),
        None => Box::new(MemoryStore::new()),
    };

    if !sequence.preconditions_met_for(&instance) {
        tracing::warn!(
            sequence = %sequence.name,
            "preconditions not met: {}",
            sequence.preconditions_description().unwrap_or_default()
        );
    }

    let mut engine = SequenceEngine::new(sequence, &mut instance, &mut client, store.as_mut()).with_rest(rest);
    let run = engine.start(RunGrouping::default())?.clone();
    Ok(run)
}

pub fn render_list(registry: &Registry, out: &mut impl Write) -> io::Result<()> {
    for sequence in registry.sequences() {
        let optional = if sequence.is_optional { " (optional)" } else { "" };
        writeln!(out, "{}  {}{optional}", sequence.name, sequence.title)?;
        for test in &sequence.test_cases {
            let versions = test
                .applicable_versions
                .iter()
                .map(|version| version.as_str())
                .collect::<Vec<_>>()
                .join(",");
            writeln!(
                out,
                "  {:<8} {:<8} {:<14} {}",
                test.identifier.as_deref().unwrap_or("-"),
                if test.required { "required" } else { "optional" },
                versions,
                test.name
            )?;
        }
    }
    Ok(())
}

pub fn render_deps(
    registry: &Registry,
    name: &str,
    instance: &dyn InstanceContext,
    recurse: bool,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let sequence = registry
        .sequence(name)
        .ok_or_else(|| EngineError::UnknownSequence(name.to_string()))?;

    if !sequence.preconditions_met_for(instance) {
        writeln!(
            out,
            "Preconditions not met: {}",
            sequence.preconditions_description().unwrap_or_default()
        )?;
    }

    let missing = deps::missing_requirements(registry, sequence, instance, recurse);
    if missing.is_empty() {
        writeln!(out, "All requirements of {name} are satisfied")?;
        return Ok(());
    }

    writeln!(out, "{name} is missing:")?;
    for requirement in missing {
        let providers = if requirement.providers.is_empty() {
            "no sequence provides it".to_string()
        } else {
            requirement.providers.join(", ")
        };
        writeln!(out, "  {} <- {providers}", requirement.input)?;
    }
    Ok(())
}

pub fn render_run(run: &SequenceRun, out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "{}: {}", run.sequence_name, run.result)?;
    for result in &run.test_results {
        let message = result
            .message
            .as_deref()
            .map(|message| format!(": {message}"))
            .unwrap_or_default();
        writeln!(
            out,
            "  {:<8} {:<5} {}{message}",
            result.test_id.as_deref().unwrap_or("-"),
            result.result,
            result.name
        )?;
        for warning in &result.warnings {
            writeln!(out, "           warning: {warning}")?;
        }
    }

    if let Some(endpoint) = &run.wait_at_endpoint {
        writeln!(
            out,
            "Waiting at `{endpoint}`{}",
            run.redirect_to_url
                .as_deref()
                .map(|url| format!(": {url}"))
                .unwrap_or_default()
        )?;
    }

    let counts = &run.counts;
    writeln!(
        out,
        "required {}/{} passed, optional {}/{} passed, {} todo, {} errors, {} skipped",
        counts.required_passed,
        counts.required_total,
        counts.optional_passed,
        counts.optional_total,
        counts.todo_count,
        counts.error_count,
        counts.skip_count
    )
}
