use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use colored::*;
use itertools::Itertools;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use simrun::config::Command;
use simrun::{
    load_jobs, load_machines, remote_dir_for, template_registry, Config, ConnectionManager,
    Coordinator, ExecutionMode, MachineConfig, RemoteRun, RunOutcome, SimrunError,
};

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn pick<'a>(
    machines: &'a BTreeMap<String, MachineConfig>,
    name: &str,
) -> Result<&'a MachineConfig, SimrunError> {
    machines.get(name).ok_or_else(|| {
        SimrunError::Config(format!(
            "no machine named '{}' (known: {})",
            name,
            machines.keys().join(", ")
        ))
    })
}

fn require_remote(name: &str, machine: &MachineConfig) -> Result<(), SimrunError> {
    if machine.execution == ExecutionMode::Local {
        return Err(SimrunError::Config(format!(
            "machine '{}' runs locally, there is nothing to connect to",
            name
        )));
    }
    Ok(())
}

async fn run_jobs(
    coordinator: &mut Coordinator,
    jobs_file: &str,
    machine: &MachineConfig,
) -> Result<(), SimrunError> {
    let specs = load_jobs(jobs_file)?;
    let host = machine.target();
    let mut registry = template_registry();
    let mut jobs = Vec::new();
    for spec in &specs {
        jobs.extend(spec.expand(&mut registry, &host, machine.scheduler)?);
    }
    info!(jobs = jobs.len(), file = jobs_file, "loaded jobs");

    for mut job in jobs {
        match coordinator.run(&mut job, machine).await? {
            RunOutcome::Delegated {
                script,
                submit_command,
            } => {
                println!(
                    "{} wrote {}, run it with: cd {} && {}",
                    job.name.bold(),
                    script.display(),
                    job.local_dir.display(),
                    submit_command.green()
                );
            }
            RunOutcome::Remote(run) => print_remote_run(&job.name, &run),
        }
    }
    Ok(())
}

fn print_remote_run(name: &str, run: &RemoteRun) {
    let state = run
        .status
        .as_ref()
        .map(|s| s.state.to_string())
        .unwrap_or_else(|| "FINISHED".to_string());
    println!(
        "{} {} job {} {} -> {}",
        run.host.prettify(),
        name.bold(),
        run.job_id.as_deref().unwrap_or("-"),
        state.green(),
        run.local_output.display()
    );
    for line in run.submission_output.lines() {
        println!("  {}", line.dimmed());
    }
    for log in &run.logs {
        println!("  {} {}", "log".dimmed(), log.display());
    }
}

/// Picks up previously submitted jobs one directory at a time.
async fn resume(
    coordinator: &mut Coordinator,
    machine: &MachineConfig,
    directories: &[PathBuf],
) -> Result<(), SimrunError> {
    for directory in directories {
        let run = coordinator.resume(directory, machine).await?;
        print_remote_run(&directory.display().to_string(), &run);
    }
    Ok(())
}

async fn check(coordinator: &mut Coordinator, machine: &MachineConfig) -> Result<(), SimrunError> {
    let host = machine.target();
    let session = coordinator
        .connections()
        .connect(&host, &machine.auth, &machine.connect)
        .await?;
    let output = session.run("echo 'connection test'").await?;
    println!(
        "{} connected with {} authentication: {}",
        host.prettify(),
        session.method(),
        output.stdout.trim().green()
    );
    Ok(())
}

async fn push(
    coordinator: &mut Coordinator,
    machine: &MachineConfig,
    directory: &Path,
    remote: Option<&str>,
) -> Result<(), SimrunError> {
    let host = machine.target();
    let session = coordinator
        .connections()
        .connect(&host, &machine.auth, &machine.connect)
        .await?;
    let remote_dir = match remote {
        Some(remote) => remote.to_string(),
        None => remote_dir_for(&machine.remote_dir, directory),
    };

    let transfers = coordinator.transfers();
    transfers.set_policy(machine.transfer.clone());
    let records = transfers
        .put_directory(&session, directory, &remote_dir, &machine.assets.subdir)
        .await?;
    for record in &records {
        let mark = match &record.checksums {
            None => "sent".normal(),
            Some(_) if record.verified() => "verified".green(),
            Some(_) => "MISMATCH".red(),
        };
        println!(
            "{} {} -> {} [{}]",
            host.prettify(),
            record.local.display(),
            record.remote,
            mark
        );
    }
    Ok(())
}

async fn dispatch(cli: &Config, coordinator: &mut Coordinator) -> Result<(), SimrunError> {
    let machines = load_machines(&cli.machines_file)?;
    match &cli.command {
        Command::Run { jobs_file, machine } => {
            run_jobs(coordinator, jobs_file, pick(&machines, machine)?).await
        }
        Command::Check { machine: name } => {
            let machine = pick(&machines, name)?;
            require_remote(name, machine)?;
            check(coordinator, machine).await
        }
        Command::Push {
            directory,
            machine: name,
            remote,
        } => {
            let machine = pick(&machines, name)?;
            require_remote(name, machine)?;
            push(coordinator, machine, directory, remote.as_deref()).await
        }
        Command::Resume {
            directories,
            machine: name,
        } => {
            let machine = pick(&machines, name)?;
            require_remote(name, machine)?;
            resume(coordinator, machine, directories).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_logging();
    let cli = Config::parse();
    let mut coordinator = Coordinator::new(ConnectionManager::openssh());

    let result = tokio::select! {
        result = dispatch(&cli, &mut coordinator) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    coordinator.shutdown().await;

    match result {
        Some(Ok(())) => ExitCode::SUCCESS,
        Some(Err(e)) => {
            eprintln!("{} {}", "[simrun]".bold().red(), e);
            ExitCode::FAILURE
        }
        None => {
            warn!("interrupted, jobs already submitted keep running on the remote side");
            ExitCode::from(130)
        }
    }
}
