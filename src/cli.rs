use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "orca-bridge",
    version,
    about = "Browser console and status bridge for game servers running on Kubernetes."
)]
pub struct CliArgs {
    /// Address to serve HTTP and WebSocket routes on
    #[arg(long)]
    pub listen: Option<String>,

    /// Default namespace for workloads
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Default workload name for the legacy /ws/console/ route
    #[arg(short, long)]
    pub workload: Option<String>,

    /// Default container name inside the workload's pods
    #[arg(short, long)]
    pub container: Option<String>,

    /// Workload kind reported by the status feeds (deployment, statefulset)
    #[arg(long)]
    pub kind: Option<String>,

    /// Status poll interval in seconds
    #[arg(long)]
    pub status_interval_secs: Option<u64>,

    /// Kubeconfig context to use instead of the current one
    #[arg(long)]
    pub context: Option<String>,

    /// Path to a YAML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}
