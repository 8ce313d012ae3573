//! `batchflow` - runs one pipeline phase per invocation.
//!
//! Exit codes: 0 success, 1 transient failure or incomplete phase (safe to
//! re-run), 2 invariant violation (needs an operator), 3 configuration error.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, info_span, Instrument};

use batchflow_core::{ErrorClass, RunId};
use batchflow_infra::{ConfigError, PipelineConfig};
use batchflow_pipeline::PipelineError;

mod args;
mod commands;

use args::Cli;
use commands::{Context, Finished};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    batchflow_observability::init(cli.log_format);

    let phase = cli.command.phase();
    let config = PipelineConfig::from(cli.settings);
    if let Err(err) = config.validate_for(phase) {
        error!(phase = %phase, error = %err, "invalid configuration");
        eprintln!("batchflow {phase}: {err}");
        return exit(ErrorClass::Configuration);
    }

    let run_id = RunId::new();
    let span = info_span!("run", run_id = %run_id, phase = %phase, dry_run = cli.dry_run);
    let ctx = Context::new(config, run_id, cli.dry_run);

    let result = async {
        info!("phase started");
        let result = commands::run(&ctx, cli.command).await;
        match &result {
            Ok(finished) => info!(?finished, "phase finished"),
            Err(err) => error!(error = %format!("{err:#}"), "phase failed"),
        }
        result
    }
    .instrument(span)
    .await;

    match result {
        Ok(Finished::Complete) => ExitCode::SUCCESS,
        Ok(Finished::Incomplete) => ExitCode::from(1),
        Err(err) => {
            if let Some(summary) = partial_summary(&err) {
                println!("{summary}");
            }
            let class = classify(&err);
            eprintln!("batchflow {phase}: {err:#}");
            eprintln!("batchflow {phase}: {}", next_step(class));
            exit(class)
        }
    }
}

/// What the operator should do after a failure of this class.
fn next_step(class: ErrorClass) -> &'static str {
    if class.is_fatal() {
        "fix the cause before re-running; a retry alone will fail the same way"
    } else {
        "safe to re-run; completed work is kept"
    }
}

/// Summary of the work a phase finished before it failed, if it got that far.
fn partial_summary(err: &anyhow::Error) -> Option<&str> {
    err.downcast_ref::<PipelineError>()?.partial_summary()
}

fn exit(class: ErrorClass) -> ExitCode {
    ExitCode::from(class.exit_code() as u8)
}

/// Class of whatever error ended the phase. Store and remote errors that
/// escaped a phase, and anything unrecognized, count as transient.
fn classify(err: &anyhow::Error) -> ErrorClass {
    if let Some(err) = err.downcast_ref::<PipelineError>() {
        return err.class();
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return ErrorClass::Configuration;
    }
    ErrorClass::Transient
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_pipeline::StoreError;

    #[test]
    fn errors_map_to_exit_classes() {
        let invariant = anyhow::Error::from(PipelineError::invariant("two active jobs"));
        assert_eq!(classify(&invariant), ErrorClass::Invariant);

        let config = anyhow::Error::from(ConfigError::Invalid {
            name: "BATCHFLOW_PAGE_SIZE",
            reason: "must be positive".into(),
        });
        assert_eq!(classify(&config), ErrorClass::Configuration);

        let store =
            anyhow::Error::from(StoreError::unavailable("down")).context("counting records");
        assert_eq!(classify(&store), ErrorClass::Transient);

        assert_eq!(classify(&anyhow::anyhow!("manifest not staged")), ErrorClass::Transient);
    }

    #[test]
    fn interrupted_phases_surface_their_summary() {
        let cause = PipelineError::from(StoreError::unavailable("db down"));
        let err = anyhow::Error::from(PipelineError::interrupted("import: 0/1 objects", cause));

        assert_eq!(partial_summary(&err), Some("import: 0/1 objects"));
        assert_eq!(classify(&err), ErrorClass::Transient);
        assert_eq!(partial_summary(&anyhow::anyhow!("no manifest")), None);
    }

    #[test]
    fn fatal_classes_ask_for_a_fix_before_rerunning() {
        assert!(next_step(ErrorClass::Invariant).starts_with("fix the cause"));
        assert!(next_step(ErrorClass::Configuration).starts_with("fix the cause"));
        assert!(next_step(ErrorClass::Transient).starts_with("safe to re-run"));
    }

    #[test]
    fn exit_codes_follow_classes() {
        assert_eq!(exit(ErrorClass::Invariant), ExitCode::from(2));
        assert_eq!(exit(ErrorClass::Configuration), ExitCode::from(3));
    }
}
