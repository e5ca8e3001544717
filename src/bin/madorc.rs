//! Entry point: parses the CLI surface (spec.md §6), wires it to a
//! [`Configuration`], and drives the Build/Run/Full/Generate/ExportConfig
//! phases through [`orchestrator`].

use std::process::ExitCode as ProcessExitCode;

use clap::Parser;
use colored::Colorize;

use madorc::cli::{Cli, Command, ExitCode as AppExitCode, GenerateTarget};
use madorc::config::{Configuration, HostFacts};
use madorc::error::{self, MadError, PanelReporter, Result};
use madorc::manifest::BuildManifest;
use madorc::orchestrator::{self, BuildReport, RunReport};
use madorc::runner;

#[tokio::main]
async fn main() -> ProcessExitCode {
    let cli = Cli::parse();

    error::set_reporter(Box::new(PanelReporter { verbose: cli.verbose }));
    let filter = if cli.verbose { "madorc=debug" } else { "madorc=info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    runner::factory::warn_unavailable();

    match dispatch(cli.command).await {
        Ok(code) => to_process_code(code),
        Err(e) => {
            error::handle(&e);
            to_process_code(AppExitCode::Failure)
        }
    }
}

fn to_process_code(code: AppExitCode) -> ProcessExitCode {
    ProcessExitCode::from(i32::from(code) as u8)
}

async fn dispatch(command: Command) -> Result<AppExitCode> {
    match command {
        Command::Build {
            tags,
            registry,
            clean_docker_cache,
            manifest_output,
            additional_context,
            additional_context_file,
            models_dir,
            target_arch,
            credential_file,
        } => {
            let config = Configuration {
                models_dir,
                credential_file,
                manifest_file: manifest_output,
                registry,
                tags,
                additional_context,
                additional_context_file,
                clean_docker_cache,
                ..Configuration::default()
            };
            let report = orchestrator::run_build(&config, &target_arch).await?;
            print_build_report(&report);
            Ok(exit_for_build(&report))
        }
        Command::Run {
            manifest_file,
            registry: _,
            timeout,
            keep_alive: _,
            keep_model_dir: _,
            skip_model_run,
            output,
            runner: runner_kind,
            inventory_file,
            host_arch,
        } => {
            if skip_model_run {
                println!("{}", "--skip-model-run set, nothing to run".yellow());
                return Ok(AppExitCode::Success);
            }
            let mut config = Configuration::default();
            config.manifest_file = manifest_file;
            config.timeout_secs = timeout;
            config.perf_csv = output;
            config.runner_kind = runner_kind.clone();
            config.inventory_file = inventory_file.clone();

            let inventory = match &inventory_file {
                Some(path) => Some(runner::load_inventory(path).await?),
                None => None,
            };
            let arch = resolve_host_arch(host_arch)?;
            let report =
                orchestrator::run_run(&config, &arch, runner_kind.as_deref(), inventory.as_ref()).await?;
            print_run_report(&report);
            Ok(exit_for_run(&report))
        }
        Command::Full {
            tags,
            registry,
            clean_docker_cache,
            manifest_output,
            additional_context,
            additional_context_file,
            models_dir,
            target_arch,
            credential_file,
            timeout,
            keep_alive: _,
            runner: runner_kind,
            inventory_file,
            host_arch,
            output,
        } => {
            let build_config = Configuration {
                models_dir,
                credential_file,
                manifest_file: manifest_output.clone(),
                registry,
                tags,
                additional_context,
                additional_context_file,
                clean_docker_cache,
                ..Configuration::default()
            };
            let build_report = orchestrator::run_build(&build_config, &target_arch).await?;
            print_build_report(&build_report);

            let mut run_config = Configuration::default();
            run_config.manifest_file = manifest_output;
            run_config.timeout_secs = timeout;
            run_config.perf_csv = output;
            run_config.runner_kind = runner_kind.clone();
            run_config.inventory_file = inventory_file.clone();

            let inventory = match &inventory_file {
                Some(path) => Some(runner::load_inventory(path).await?),
                None => None,
            };
            let arch = resolve_host_arch(host_arch)?;
            let run_report =
                orchestrator::run_run(&run_config, &arch, runner_kind.as_deref(), inventory.as_ref()).await?;
            print_run_report(&run_report);

            Ok(if build_report.has_failures() || run_report.failed > 0 {
                AppExitCode::Failure
            } else {
                AppExitCode::Success
            })
        }
        Command::Generate { target } => {
            let (manifest_file, environment, rendered, output) = match target {
                GenerateTarget::Ansible {
                    manifest_file,
                    environment,
                    output,
                } => {
                    let manifest = BuildManifest::read(&manifest_file).await?;
                    let rendered = madorc::generate::generate_ansible_playbook(&manifest, &environment);
                    (manifest_file, environment, rendered, output)
                }
                GenerateTarget::K8s {
                    manifest_file,
                    environment,
                    namespace,
                } => {
                    let manifest = BuildManifest::read(&manifest_file).await?;
                    let rendered = madorc::generate::generate_k8s_manifest(&manifest, &environment, &namespace);
                    (manifest_file, environment, rendered, "madorc_k8s_jobs.yml".into())
                }
            };
            tokio::fs::write(&output, rendered).await.map_err(|e| {
                MadError::runtime(format!("failed to write generated artifact: {e}"))
                    .with_field("path", output.display())
            })?;
            println!(
                "generated {} for environment '{environment}' from {}",
                output.display(),
                manifest_file.display()
            );
            Ok(AppExitCode::Success)
        }
        Command::ExportConfig {
            tags,
            models_dir,
            output,
            additional_context,
            additional_context_file,
        } => {
            let config = Configuration {
                tags,
                models_dir,
                additional_context,
                additional_context_file,
                ..Configuration::default()
            };
            let count = orchestrator::export_config(&config, &output).await?;
            println!("wrote {count} model(s) to {}", output.display());
            Ok(AppExitCode::Success)
        }
    }
}

/// `--host-arch` wins; otherwise falls back to `MADORC_GPU_ARCH` detection.
/// Neither present is a validation error rather than silently filtering
/// everything out.
fn resolve_host_arch(host_arch: Option<String>) -> Result<String> {
    host_arch
        .or_else(|| HostFacts::detect().gpu_architecture)
        .ok_or_else(|| {
            MadError::validation("no --host-arch given and MADORC_GPU_ARCH is not set")
                .with_suggestion("pass --host-arch <arch>, e.g. --host-arch gfx942")
        })
}

fn print_build_report(report: &BuildReport) {
    println!(
        "{}: {} discovered, {} built, {} skipped, {} pushed, {} push failures",
        "build".bold(),
        report.models_discovered,
        report.built,
        report.skipped,
        report.successful_pushes,
        report.failed_pushes
    );
    for (model, dockerfile) in &report.failed_builds {
        println!("  {} {model} ({dockerfile})", "failed:".red());
    }
}

fn print_run_report(report: &RunReport) {
    println!(
        "{}: {} nodes, {} succeeded, {} failed, {:.1}s total",
        "run".bold(),
        report.total_nodes,
        report.successful,
        report.failed,
        report.total_duration_secs
    );
}

fn exit_for_build(report: &BuildReport) -> AppExitCode {
    if report.has_failures() {
        AppExitCode::Failure
    } else {
        AppExitCode::Success
    }
}

fn exit_for_run(report: &RunReport) -> AppExitCode {
    if report.failed > 0 {
        AppExitCode::Failure
    } else {
        AppExitCode::Success
    }
}
