//! Binary CLI surface. Not part of the reconciliation pipeline itself,
//! but every binary needs one to start at all, in the `Command<Run>`
//! shape used across both binaries, trimmed of the
//! `stackable_telemetry`/product-config plumbing this workspace doesn't
//! carry.

use clap::{Args, Parser};

#[derive(Debug, Parser)]
#[command(name = "fleet-manager", about = "Fleet management-plane control loop")]
pub enum Command {
    /// Print every custom resource definition's generated schema as YAML.
    Crd,
    /// Run the control loop.
    Run(RunArguments),
}

#[derive(Debug, Args)]
pub struct RunArguments {
    /// Namespace holding `Registration`, `Cluster`, and `ClusterGroup`
    /// objects.
    #[arg(long, env, default_value = "fleet-system")]
    pub registration_namespace: String,

    /// The API server URL baked into agent kubeconfigs at registration
    /// time.
    #[arg(long, env)]
    pub api_server_url: String,

    /// Base64-encoded API server CA bundle, likewise baked into agent
    /// kubeconfigs.
    #[arg(long, env)]
    pub api_server_ca_base64: String,

    /// Bound on concurrently-running Deployment-adjacent reconciles.
    #[arg(long, env, default_value_t = 50)]
    pub worker_concurrency: usize,

    #[arg(long, env, default_value = "5m")]
    pub gc_interval: humantime::Duration,

    #[arg(long, env, default_value = "60s")]
    pub registration_sweep_interval: humantime::Duration,

    #[arg(long, env, default_value = "info")]
    pub log_filter: String,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_well_formed() {
        Command::command().debug_assert();
    }
}
