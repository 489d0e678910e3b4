//! `strata run`: Create, start and wait for one container.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::Context;
use clap::Args;
use strata_common::spec::ContainerSpec;
use strata_common::types::ContainerState;
use strata_runtime::{ContainerHandle, Engine, WritableLayer};

use crate::output;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the JSON container spec.
    pub spec: PathBuf,

    /// Discard the writable layer and container directory on exit.
    #[arg(long)]
    pub rm: bool,
}

const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Executes the `run` command.
///
/// The process exit code mirrors the container's: its own code when it
/// exited, `128 + signal` when it was killed.
///
/// # Errors
///
/// Returns an error if the spec cannot be read or the container cannot be
/// created, started or destroyed.
pub fn execute(args: RunArgs, engine: &Engine) -> anyhow::Result<ExitCode> {
    let content = std::fs::read_to_string(&args.spec)
        .with_context(|| format!("cannot read spec {}", args.spec.display()))?;
    let spec: ContainerSpec = serde_json::from_str(&content)
        .with_context(|| format!("invalid spec {}", args.spec.display()))?;
    let mode = if args.rm {
        WritableLayer::Discard
    } else {
        WritableLayer::Keep
    };

    let started = Instant::now();
    let handle = engine.create(spec)?;
    eprintln!(
        "  {BOLD}{}{RESET} {DIM}created, isolation: {}{RESET}",
        handle.id(),
        handle.granted()
    );

    install_interrupt_handler(&handle, mode)?;

    if let Err(e) = handle.start() {
        if let Err(cleanup) = handle.destroy_with(mode) {
            tracing::warn!(id = %handle.id(), error = %cleanup, "cleanup after failed start");
        }
        return Err(e.into());
    }
    tracing::info!(id = %handle.id(), pid = ?handle.pid(), "container running");

    let state = handle.wait();
    report_usage(&handle);
    handle.destroy_with(mode)?;

    let colour = if matches!(state, ContainerState::Exited { code: 0 }) {
        GREEN
    } else {
        RED
    };
    eprintln!(
        "  {colour}{state}{RESET} {DIM}after {:.1}s{RESET}",
        started.elapsed().as_secs_f64()
    );
    Ok(ExitCode::from(output::exit_code(&state)))
}

fn install_interrupt_handler(handle: &ContainerHandle, mode: WritableLayer) -> anyhow::Result<()> {
    let handle = handle.clone();
    ctrlc::set_handler(move || {
        tracing::info!(id = %handle.id(), "interrupted, destroying container");
        if let Err(e) = handle.destroy_with(mode) {
            tracing::error!(id = %handle.id(), error = %e, "destroy after interrupt failed");
        }
    })
    .context("cannot install Ctrl+C handler")
}

fn report_usage(handle: &ContainerHandle) {
    match handle.metrics() {
        Ok(m) => {
            let peak = m.memory_peak_bytes.or(m.memory_usage_bytes);
            eprintln!(
                "  {DIM}memory peak {}, cpu {}, oom kills {}{RESET}",
                peak.map_or_else(|| "-".into(), output::format_bytes),
                m.cpu_usage_usec
                    .map_or_else(|| "-".into(), output::format_usec),
                m.oom_kills.unwrap_or(0),
            );
        }
        Err(e) => tracing::debug!(error = %e, "no usage figures"),
    }
}
