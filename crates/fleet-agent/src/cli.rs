//! Binary CLI surface, mirroring `fleet-manager`'s `cli::Command<Run>`
//! shape.

use clap::{Args, Parser};

#[derive(Debug, Parser)]
#[command(name = "fleet-agent", about = "Per-cluster Fleet agent: deployer, drift trigger, status ticker")]
pub enum Command {
    /// Run the agent loop.
    Run(RunArguments),
}

#[derive(Debug, Args)]
pub struct RunArguments {
    /// This agent's stable `Cluster` name on the management plane.
    #[arg(long, env)]
    pub cluster_name: String,

    /// This agent's stable client-id, presented during the bootstrap
    /// handshake and hashed to derive `cluster_name` on first join.
    #[arg(long, env)]
    pub client_id: String,

    /// Namespace, on the *local* cluster, holding the `fleet-agent-bootstrap`
    /// and (once joined) `fleet-agent` secrets.
    #[arg(long, env, default_value = "fleet-system")]
    pub local_namespace: String,

    /// Namespace on the management plane holding the `Cluster` /
    /// `ClusterGroup` objects and the `Registration` handshake.
    #[arg(long, env, default_value = "fleet-system")]
    pub registration_namespace: String,

    /// This cluster's assigned namespace on the management plane,
    /// holding its `Deployment` objects.
    #[arg(long, env)]
    pub agent_namespace: String,

    /// Cluster status ticker interval.
    #[arg(long, env, default_value = "15m")]
    pub checkin_interval: humantime::Duration,

    /// Bound on concurrently-running Deploy/Monitor/Cleanup handler
    /// invocations.
    #[arg(long, env, default_value_t = 50)]
    pub worker_concurrency: usize,

    /// Interval for the stray-Helm-release sweep (a jittered
    /// background GC, roughly every 15 minutes).
    #[arg(long, env, default_value = "15m")]
    pub stray_release_sweep_interval: humantime::Duration,

    /// The upstream `shouldRedeploy` name-prefix quirk, kept on by default for behavioral parity.
    #[arg(long, env, default_value_t = true)]
    pub always_redeploy_fleet_agent_prefix: bool,

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
