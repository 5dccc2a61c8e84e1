use crate::cli::CliArgs;
use crate::model::{WorkloadKind, WorkloadRef};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_ENV: &str = "ORCA_BRIDGE_CONFIG";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorStrategy {
    /// First pod matching `<instance_label>=<workload>`, in listing order.
    LabelSelector,
    /// Ordinal pod `<workload>-0` of a stateful workload.
    Ordinal,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionConfig {
    pub list_command: Vec<String>,
    /// `{label}` is replaced by the session label; appended when absent.
    pub attach_command: Vec<String>,
    /// Non-interactive injection; the command text is the final argument.
    pub inject_command: Vec<String>,
    pub marker: String,
    pub separator: char,
    pub termination: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StatusConfig {
    pub interval: Duration,
    pub managed_by_key: String,
    pub managed_by_value: String,
    pub owner_key: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BridgeConfig {
    pub listen: String,
    pub context: Option<String>,
    pub namespace: String,
    pub workload: String,
    pub container: String,
    pub kind: WorkloadKind,
    pub locator: LocatorStrategy,
    pub instance_label: String,
    pub session: SessionConfig,
    pub status: StatusConfig,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct BridgeConfigFile {
    listen: Option<String>,
    namespace: Option<String>,
    workload: Option<String>,
    container: Option<String>,
    kind: Option<String>,
    locator: Option<LocatorStrategy>,
    instance_label: Option<String>,
    #[serde(default)]
    session: SessionSpec,
    #[serde(default)]
    status: StatusSpec,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SessionSpec {
    list_command: Option<Vec<String>>,
    attach_command: Option<Vec<String>>,
    inject_command: Option<Vec<String>>,
    marker: Option<String>,
    separator: Option<char>,
    termination: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StatusSpec {
    #[serde(alias = "interval")]
    interval_secs: Option<u64>,
    managed_by_key: Option<String>,
    managed_by_value: Option<String>,
    owner_key: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
            context: None,
            namespace: "default".to_string(),
            workload: "minecraft-server".to_string(),
            container: "minecraft-server".to_string(),
            kind: WorkloadKind::StatefulSet,
            locator: LocatorStrategy::LabelSelector,
            instance_label: "app".to_string(),
            session: SessionConfig {
                list_command: vec!["screen".to_string(), "-ls".to_string()],
                attach_command: vec!["screen".to_string(), "-x".to_string()],
                inject_command: vec![
                    "screen".to_string(),
                    "-S".to_string(),
                    "{label}".to_string(),
                    "-X".to_string(),
                    "stuff".to_string(),
                ],
                marker: "minecraft".to_string(),
                separator: '.',
                termination: "exit".to_string(),
            },
            status: StatusConfig {
                interval: Duration::from_secs(10),
                managed_by_key: "managed-by".to_string(),
                managed_by_value: "mindworld".to_string(),
                owner_key: "owner".to_string(),
            },
            source: None,
        }
    }
}

impl BridgeConfig {
    pub fn resolve(args: &CliArgs) -> Result<Self> {
        let env = std::env::vars().collect::<HashMap<_, _>>();
        let path = args
            .config
            .clone()
            .or_else(|| discover_config_path(&env));
        let file = match path.as_deref() {
            Some(path) => Some(load_file(path)?),
            None => None,
        };
        let config = Self::layered(file, &env, args, path.as_deref())?;
        config.validate()?;
        Ok(config)
    }

    fn layered(
        file: Option<BridgeConfigFile>,
        env: &HashMap<String, String>,
        args: &CliArgs,
        path: Option<&Path>,
    ) -> Result<Self> {
        let mut config = Self {
            source: path.map(|path| path.display().to_string()),
            ..Self::default()
        };

        if let Some(file) = file {
            config.apply_file(file)?;
        }

        if let Some(value) = env_value(env, "NAMESPACE") {
            config.namespace = value;
        }
        if let Some(value) = env_value(env, "STATEFULSET_NAME") {
            config.workload = value;
        }
        if let Some(value) = env_value(env, "CONTAINER_NAME") {
            config.container = value;
        }

        if let Some(value) = non_empty(args.listen.as_deref()) {
            config.listen = value;
        }
        if let Some(value) = non_empty(args.namespace.as_deref()) {
            config.namespace = value;
        }
        if let Some(value) = non_empty(args.workload.as_deref()) {
            config.workload = value;
        }
        if let Some(value) = non_empty(args.container.as_deref()) {
            config.container = value;
        }
        if let Some(token) = non_empty(args.kind.as_deref()) {
            config.kind = parse_kind(&token)?;
        }
        if let Some(secs) = args.status_interval_secs {
            config.status.interval = Duration::from_secs(secs);
        }
        config.context = non_empty(args.context.as_deref());

        Ok(config)
    }

    fn apply_file(&mut self, file: BridgeConfigFile) -> Result<()> {
        if let Some(value) = non_empty(file.listen.as_deref()) {
            self.listen = value;
        }
        if let Some(value) = non_empty(file.namespace.as_deref()) {
            self.namespace = value;
        }
        if let Some(value) = non_empty(file.workload.as_deref()) {
            self.workload = value;
        }
        if let Some(value) = non_empty(file.container.as_deref()) {
            self.container = value;
        }
        if let Some(token) = non_empty(file.kind.as_deref()) {
            self.kind = parse_kind(&token)?;
        }
        if let Some(locator) = file.locator {
            self.locator = locator;
        }
        if let Some(value) = non_empty(file.instance_label.as_deref()) {
            self.instance_label = value;
        }

        let session = file.session;
        if let Some(command) = session.list_command {
            self.session.list_command = command;
        }
        if let Some(command) = session.attach_command {
            self.session.attach_command = command;
        }
        if let Some(command) = session.inject_command {
            self.session.inject_command = command;
        }
        if let Some(marker) = session.marker {
            self.session.marker = marker;
        }
        if let Some(separator) = session.separator {
            self.session.separator = separator;
        }
        if let Some(termination) = session.termination {
            self.session.termination = termination;
        }

        let status = file.status;
        if let Some(secs) = status.interval_secs {
            self.status.interval = Duration::from_secs(secs);
        }
        if let Some(value) = non_empty(status.managed_by_key.as_deref()) {
            self.status.managed_by_key = value;
        }
        if let Some(value) = non_empty(status.managed_by_value.as_deref()) {
            self.status.managed_by_value = value;
        }
        if let Some(value) = non_empty(status.owner_key.as_deref()) {
            self.status.owner_key = value;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.status.interval < Duration::from_secs(1) {
            anyhow::bail!("status interval must be at least one second");
        }
        if self.session.marker.trim().is_empty() {
            anyhow::bail!("session marker must not be empty");
        }
        if self.session.list_command.is_empty()
            || self.session.attach_command.is_empty()
            || self.session.inject_command.is_empty()
        {
            anyhow::bail!("session list, attach and inject commands must not be empty");
        }
        if self.instance_label.trim().is_empty() {
            anyhow::bail!("instance label key must not be empty");
        }
        Ok(())
    }

    pub fn default_workload(&self) -> WorkloadRef {
        WorkloadRef::new(&self.namespace, &self.workload, &self.container)
    }
}

fn load_file(path: &Path) -> Result<BridgeConfigFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read bridge config {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse bridge config {}", path.display()))
}

fn parse_kind(token: &str) -> Result<WorkloadKind> {
    WorkloadKind::from_token(token)
        .with_context(|| format!("unsupported workload kind '{token}'"))
}

fn env_value(env: &HashMap<String, String>, key: &str) -> Option<String> {
    non_empty(env.get(key).map(String::as_str))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn discover_config_path(env: &HashMap<String, String>) -> Option<PathBuf> {
    if let Some(path) = env_value(env, CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("orca-bridge.yaml"),
        PathBuf::from("orca-bridge.yml"),
        PathBuf::from(".orca-bridge.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Some(home) = env_value(env, "HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/orca/bridge.yaml"),
            PathBuf::from(&home).join(".config/orca/bridge.yml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}
