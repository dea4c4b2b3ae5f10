//! Entry point for the on-target agent and the coordinator CLI.
//!
//! `disnix-agent --serve` runs as the on-target process, reading one
//! newline-delimited JSON request per line on stdin and writing one
//! response per line on stdout — the same stdio-transport idiom the
//! teacher uses for its MCP server. `disnix-agent deploy` drives a full
//! lock -> transition -> commit-profiles -> unlock cycle from the
//! coordinator side against a manifest file (spec §2).

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use coordination::agent::{AgentOperations, DysnomiaAgent};
use coordination::interface::{ClientInterface, SubprocessClientInterface};
use coordination::lock;
use coordination::manifest::Manifest;
use coordination::profile::{set_target_profiles, update_coordinator_profile};
use coordination::transition::{transition_with_interrupt, TransitionFlags, TransitionOutcome};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

#[derive(Parser)]
#[command(name = "disnix-agent", about = "On-target agent and deployment coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the on-target agent, serving requests over stdio.
    Serve {
        #[arg(long, default_value = "/var/lib/disnix")]
        state_dir: PathBuf,
        #[arg(long, default_value = "dysnomia")]
        dysnomia_binary: String,
    },
    /// Drive a transition from the current profile to `manifest`.
    Deploy {
        manifest: PathBuf,
        #[arg(long)]
        old_manifest: Option<PathBuf>,
        #[arg(long, default_value = "default")]
        profile: String,
        #[arg(long, default_value = "/var/lib/disnix/profiles")]
        profiles_dir: PathBuf,
        #[arg(long, default_value = "/var/lib/disnix/coordinator-profile")]
        coordinator_profile_path: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        no_rollback: bool,
        #[arg(long)]
        client_interface: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum AgentRequest {
    Activate { service: String, container: String, service_type: String, package: String },
    Deactivate { service: String, container: String, service_type: String, package: String },
    Snapshot { container: String, service_type: String, package: String },
    Restore { container: String, service_type: String, package: String, snapshot_id: String },
    DeleteState { container: String, service_type: String, package: String },
    Lock { profile: String },
    Unlock { profile: String },
    QueryInstalled,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum AgentResponse {
    Ok { job_id: Option<u64> },
    Installed { entries: Vec<String> },
    Error { message: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { state_dir, dysnomia_binary } => serve(state_dir, dysnomia_binary).await,
        Command::Deploy {
            manifest,
            old_manifest,
            profile,
            profiles_dir,
            coordinator_profile_path,
            dry_run,
            no_rollback,
            client_interface,
        } => deploy(manifest, old_manifest, profile, profiles_dir, coordinator_profile_path, dry_run, no_rollback, client_interface).await,
    }
}

async fn serve(state_dir: PathBuf, dysnomia_binary: String) -> anyhow::Result<()> {
    let agent = DysnomiaAgent::new(dysnomia_binary, state_dir)?;
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = tokio::io::BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<AgentRequest>(&line) {
            Ok(request) => handle_request(&agent, request).await,
            Err(err) => AgentResponse::Error { message: err.to_string() },
        };
        let encoded = serde_json::to_string(&response)?;
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn handle_request(agent: &DysnomiaAgent, request: AgentRequest) -> AgentResponse {
    match request {
        AgentRequest::Activate { service, container, service_type, package } => {
            match agent.activate(&service, &container, &service_type, &package).await {
                Ok(job_id) => AgentResponse::Ok { job_id: Some(job_id.0) },
                Err(err) => AgentResponse::Error { message: err.to_string() },
            }
        }
        AgentRequest::Deactivate { service, container, service_type, package } => {
            match agent.deactivate(&service, &container, &service_type, &package).await {
                Ok(job_id) => AgentResponse::Ok { job_id: Some(job_id.0) },
                Err(err) => AgentResponse::Error { message: err.to_string() },
            }
        }
        AgentRequest::Snapshot { container, service_type, package } => {
            match agent.snapshot(&container, &service_type, &package).await {
                Ok(job_id) => AgentResponse::Ok { job_id: Some(job_id.0) },
                Err(err) => AgentResponse::Error { message: err.to_string() },
            }
        }
        AgentRequest::Restore { container, service_type, package, snapshot_id } => {
            match agent.restore(&container, &service_type, &package, &snapshot_id).await {
                Ok(job_id) => AgentResponse::Ok { job_id: Some(job_id.0) },
                Err(err) => AgentResponse::Error { message: err.to_string() },
            }
        }
        AgentRequest::DeleteState { container, service_type, package } => {
            match agent.delete_state(&container, &service_type, &package).await {
                Ok(job_id) => AgentResponse::Ok { job_id: Some(job_id.0) },
                Err(err) => AgentResponse::Error { message: err.to_string() },
            }
        }
        AgentRequest::Lock { profile } => match agent.lock_profile(&profile).await {
            Ok(()) => AgentResponse::Ok { job_id: None },
            Err(err) => AgentResponse::Error { message: err.to_string() },
        },
        AgentRequest::Unlock { profile } => match agent.unlock_profile(&profile).await {
            Ok(()) => AgentResponse::Ok { job_id: None },
            Err(err) => AgentResponse::Error { message: err.to_string() },
        },
        AgentRequest::QueryInstalled => AgentResponse::Installed {
            entries: agent
                .query_installed()
                .await
                .iter()
                .map(|e| format!("{};{};{}", e.package, e.container, e.service_type))
                .collect(),
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn deploy(
    manifest_path: PathBuf,
    old_manifest_path: Option<PathBuf>,
    profile: String,
    profiles_dir: PathBuf,
    coordinator_profile_path: PathBuf,
    dry_run: bool,
    no_rollback: bool,
    client_interface_binary: Option<String>,
) -> anyhow::Result<()> {
    let manifest_file = std::fs::File::open(&manifest_path)?;
    let new_manifest = Manifest::load_xml(std::io::BufReader::new(manifest_file))?;

    let old_manifest = old_manifest_path
        .map(|path| -> anyhow::Result<Manifest> {
            let file = std::fs::File::open(path)?;
            Ok(Manifest::load_xml(std::io::BufReader::new(file))?)
        })
        .transpose()?;

    let interface: Arc<dyn ClientInterface> = Arc::new(SubprocessClientInterface::new(
        client_interface_binary.unwrap_or_else(|| "disnix-client".to_string()),
    ));

    let interrupt = Arc::new(AtomicBool::new(false));

    lock::lock(interface.clone(), &new_manifest, &profile, interrupt.clone()).await?;

    let flags = TransitionFlags { dry_run, no_rollback, ..Default::default() };
    let outcome = transition_with_interrupt(interface.clone(), &new_manifest, old_manifest.as_ref(), flags, interrupt).await;
    tracing::info!(?outcome, "transition complete");

    if outcome == TransitionOutcome::Success && !dry_run {
        set_target_profiles(&new_manifest, &profiles_dir).await?;
        update_coordinator_profile(&new_manifest, &coordinator_profile_path).await?;
    }

    lock::unlock(interface, &new_manifest, &profile).await;

    match outcome {
        TransitionOutcome::Success => Ok(()),
        other => anyhow::bail!("transition did not succeed: {other:?}"),
    }
}
