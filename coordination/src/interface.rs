//! Remote invocation layer (spec §4.4).
//!
//! Every operation the transition, migration and lock engines perform on a
//! target goes through a single `disnix-client`-shaped subprocess call.
//! `build_args` mirrors `client-interface.c`'s argument assembly for each
//! verb so the wire contract with the on-target agent stays stable
//! regardless of which `ClientInterface` backs it.

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::manifest::Target;
use crate::process::ProcessOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInterfaceVerb {
    Activate,
    Deactivate,
    Snapshot,
    Restore,
    DeleteState,
    Lock,
    Unlock,
    SetProfile,
    QueryRequisites,
    QueryAllSnapshots,
    QueryLatestSnapshot,
    PrintMissingSnapshots,
    ResolveSnapshots,
    ImportSnapshots,
    ExportSnapshots,
    CleanSnapshots,
    Query,
    PrintInvalid,
    CollectGarbage,
}

impl ClientInterfaceVerb {
    fn as_arg(self) -> &'static str {
        use ClientInterfaceVerb::*;
        match self {
            Activate => "--activate",
            Deactivate => "--deactivate",
            Snapshot => "--snapshot",
            Restore => "--restore",
            DeleteState => "--delete-state",
            Lock => "--lock",
            Unlock => "--unlock",
            SetProfile => "--set",
            QueryRequisites => "--query-requisites",
            QueryAllSnapshots => "--query-all-snapshots",
            QueryLatestSnapshot => "--query-latest-snapshot",
            PrintMissingSnapshots => "--print-missing-snapshots",
            ResolveSnapshots => "--resolve-snapshots",
            ImportSnapshots => "--import-snapshots",
            ExportSnapshots => "--export-snapshots",
            CleanSnapshots => "--clean-snapshots",
            Query => "--query-all-states",
            PrintInvalid => "--print-invalid",
            CollectGarbage => "--collect-garbage",
        }
    }

    /// Whether this verb's result is a line-delimited list rather than a
    /// bare exit status, per the result column of spec §4.4's table.
    fn returns_lines(self) -> bool {
        use ClientInterfaceVerb::*;
        matches!(
            self,
            QueryRequisites
                | QueryAllSnapshots
                | QueryLatestSnapshot
                | PrintMissingSnapshots
                | ResolveSnapshots
                | ExportSnapshots
                | Query
                | PrintInvalid
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    Local,
    Remote,
}

/// A single remote call. Only the fields relevant to `verb` are read by
/// `build_args`; the rest stay `None`/empty.
#[derive(Debug, Clone, Default)]
pub struct RemoteCall {
    pub verb_slot: Option<ClientInterfaceVerb>,
    pub target_address: String,
    pub container: Option<String>,
    pub service_type: Option<String>,
    pub component: Option<String>,
    pub package: Option<String>,
    pub profile: Option<String>,
    pub profile_path: Option<String>,
    pub arguments: Vec<String>,
    pub ids: Vec<String>,
    pub paths: Vec<String>,
    pub keep: Option<u32>,
    pub locality: Option<Locality>,
}

impl RemoteCall {
    pub fn new(verb: ClientInterfaceVerb, target: &Target) -> Self {
        Self {
            verb_slot: Some(verb),
            target_address: target.key().unwrap_or(&target.name).to_string(),
            ..Default::default()
        }
    }

    pub fn verb(&self) -> ClientInterfaceVerb {
        self.verb_slot.expect("RemoteCall always constructed via ::new with a verb")
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = Some(service_type.into());
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn with_profile_path(mut self, profile_path: impl Into<String>) -> Self {
        self.profile_path = Some(profile_path.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_paths(mut self, paths: Vec<String>) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_keep(mut self, keep: u32) -> Self {
        self.keep = Some(keep);
        self
    }

    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }

    /// Key used by `SimulatedClientInterface` to target a specific failure:
    /// whichever of container/profile/component identifies this call.
    fn discriminator(&self) -> Option<String> {
        self.container.clone().or_else(|| self.profile.clone()).or_else(|| self.component.clone())
    }
}

/// Builds the argv for `disnix-client` from a `RemoteCall`, per verb, per
/// the table in spec §4.4.
pub fn build_args(call: &RemoteCall) -> Vec<String> {
    use ClientInterfaceVerb::*;
    let verb = call.verb();
    let mut args = vec![verb.as_arg().to_string()];
    match verb {
        Activate | Deactivate | Snapshot | Restore | DeleteState => {
            if let Some(container) = &call.container {
                args.push("--container".to_string());
                args.push(container.clone());
            }
            if let Some(service_type) = &call.service_type {
                args.push("--type".to_string());
                args.push(service_type.clone());
            }
            for arg in &call.arguments {
                args.push("--arguments".to_string());
                args.push(arg.clone());
            }
            args.push("--target".to_string());
            args.push(call.target_address.clone());
            if let Some(package) = &call.package {
                args.push(package.clone());
            }
        }
        Lock | Unlock => {
            args.push("--target".to_string());
            args.push(call.target_address.clone());
            if let Some(profile) = &call.profile {
                args.push("--profile".to_string());
                args.push(profile.clone());
            }
        }
        SetProfile => {
            args.push("--target".to_string());
            args.push(call.target_address.clone());
            if let Some(profile) = &call.profile {
                args.push("--profile".to_string());
                args.push(profile.clone());
            }
            if let Some(path) = &call.profile_path {
                args.push(path.clone());
            }
        }
        QueryRequisites => {
            args.push("--target".to_string());
            args.push(call.target_address.clone());
            args.extend(call.paths.iter().cloned());
        }
        QueryAllSnapshots | QueryLatestSnapshot => {
            args.push("--target".to_string());
            args.push(call.target_address.clone());
            if let Some(container) = &call.container {
                args.push("--container".to_string());
                args.push(container.clone());
            }
            if let Some(component) = &call.component {
                args.push("--component".to_string());
                args.push(component.clone());
            }
        }
        PrintMissingSnapshots | ResolveSnapshots => {
            args.push("--target".to_string());
            args.push(call.target_address.clone());
            args.extend(call.ids.iter().cloned());
        }
        ImportSnapshots => {
            args.push("--target".to_string());
            args.push(call.target_address.clone());
            match call.locality {
                Some(Locality::Local) => args.push("--local".to_string()),
                Some(Locality::Remote) => args.push("--remote".to_string()),
                None => {}
            }
            if let Some(container) = &call.container {
                args.push("--container".to_string());
                args.push(container.clone());
            }
            if let Some(component) = &call.component {
                args.push("--component".to_string());
                args.push(component.clone());
            }
            args.extend(call.paths.iter().cloned());
        }
        ExportSnapshots => {
            args.push("--target".to_string());
            args.push(call.target_address.clone());
            args.extend(call.paths.iter().cloned());
        }
        CleanSnapshots => {
            args.push("--target".to_string());
            args.push(call.target_address.clone());
            if let Some(keep) = call.keep {
                args.push("--keep".to_string());
                args.push(keep.to_string());
            }
            if let Some(container) = &call.container {
                args.push("--container".to_string());
                args.push(container.clone());
            }
            if let Some(component) = &call.component {
                args.push("--component".to_string());
                args.push(component.clone());
            }
        }
        Query | PrintInvalid | CollectGarbage => {
            args.push("--target".to_string());
            args.push(call.target_address.clone());
        }
    }
    args
}

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("failed to spawn client interface process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("client interface exited with status {0}")]
    NonZeroExit(i32),

    #[error("client interface output was not valid UTF-8")]
    InvalidOutput,
}

#[async_trait]
pub trait ClientInterface: Send + Sync {
    async fn invoke(&self, call: RemoteCall) -> Result<ProcessOutcome, InterfaceError>;
}

/// Invokes a real `disnix-client` binary locally, or over `ssh` when the
/// target address differs from the local host. Mirrors the teacher's
/// `run_slurm_cmd`, which wraps the same command in `ssh` conditionally.
pub struct SubprocessClientInterface {
    pub client_interface_binary: String,
    pub ssh_binary: String,
    pub local_hostname: Option<String>,
}

impl SubprocessClientInterface {
    pub fn new(client_interface_binary: impl Into<String>) -> Self {
        Self {
            client_interface_binary: client_interface_binary.into(),
            ssh_binary: "ssh".to_string(),
            local_hostname: None,
        }
    }

    fn is_local(&self, target_address: &str) -> bool {
        self.local_hostname.as_deref() == Some(target_address) || target_address == "localhost"
    }
}

#[async_trait]
impl ClientInterface for SubprocessClientInterface {
    async fn invoke(&self, call: RemoteCall) -> Result<ProcessOutcome, InterfaceError> {
        let verb = call.verb();
        let args = build_args(&call);
        let mut command = if self.is_local(&call.target_address) {
            let mut cmd = Command::new(&self.client_interface_binary);
            cmd.args(&args);
            cmd
        } else {
            let mut cmd = Command::new(&self.ssh_binary);
            cmd.arg(&call.target_address).arg(&self.client_interface_binary).args(&args);
            cmd
        };

        let output = command.output().await?;
        if !output.status.success() {
            return Err(InterfaceError::NonZeroExit(output.status.code().unwrap_or(-1)));
        }

        if verb.returns_lines() {
            let text = String::from_utf8(output.stdout).map_err(|_| InterfaceError::InvalidOutput)?;
            let lines = text.lines().map(str::to_string).collect();
            Ok(ProcessOutcome::Lines(lines))
        } else {
            Ok(ProcessOutcome::Status(true))
        }
    }
}

/// Builds and logs the argument list without touching a remote target,
/// for `--dry-run` invocations of the transition engine.
pub struct DryRunClientInterface;

#[async_trait]
impl ClientInterface for DryRunClientInterface {
    async fn invoke(&self, call: RemoteCall) -> Result<ProcessOutcome, InterfaceError> {
        let args = build_args(&call);
        tracing::info!(target_address = %call.target_address, ?args, "dry-run: would invoke client interface");
        Ok(ProcessOutcome::Status(true))
    }
}

/// Returns pre-programmed outcomes keyed by `(verb, target_address,
/// discriminator)`, for exercising rollback paths under test without a real
/// remote target.
#[derive(Default)]
pub struct SimulatedClientInterface {
    pub failures: std::sync::Mutex<std::collections::HashSet<(ClientInterfaceVerb, String, Option<String>)>>,
}

impl SimulatedClientInterface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, verb: ClientInterfaceVerb, target_address: impl Into<String>, discriminator: Option<String>) {
        self.failures
            .lock()
            .expect("simulated client interface lock poisoned")
            .insert((verb, target_address.into(), discriminator));
    }
}

#[async_trait]
impl ClientInterface for SimulatedClientInterface {
    async fn invoke(&self, call: RemoteCall) -> Result<ProcessOutcome, InterfaceError> {
        let key = (call.verb(), call.target_address.clone(), call.discriminator());
        if self.failures.lock().expect("simulated client interface lock poisoned").contains(&key) {
            return Err(InterfaceError::NonZeroExit(1));
        }
        if call.verb().returns_lines() {
            Ok(ProcessOutcome::Lines(Vec::new()))
        } else {
            Ok(ProcessOutcome::Status(true))
        }
    }
}
