// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Poolvisor - PgBouncer sidecar and cluster failover commands.
//!
//! Command tree:
//!
//! ```text
//! poolvisor [--namespace <ns>]
//!   pgbouncer run [--pooler-name ..] [--pgbouncer-binary ..] [--configs-dir ..] ...
//!   promote <cluster> <instance>
//!   fence on|off <cluster> <instance|*>
//!   hibernate on|off <cluster>
//! ```
//!
//! The tree is built by [`build_cli`] and executed by [`dispatch`], which
//! receives its cluster backend and output writer through [`Deps`].

use std::io::Write;
use std::sync::Arc;

use clap::parser::ValueSource;
use clap::{Arg, ArgMatches, Command};
use poolvisor_core::cluster::{
    ClusterStateMutator, ClusterStore, FenceTarget, HibernationMode, InstanceLookup,
    MutationError, ObjectKey,
};
use poolvisor_core::supervisor::SupervisorError;
use poolvisor_kube::{KubeClient, KubeConfig, KubeError};

pub mod commands;
pub mod config;

pub use config::{ConfigError, RunConfig};

/// Errors surfaced by commands.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CliError {
    /// Sidecar configuration is missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Cluster mutation failed.
    #[error(transparent)]
    Mutation(#[from] MutationError),

    /// Sidecar runtime could not be started.
    #[error(transparent)]
    Runtime(#[from] poolvisor_core::Error),

    /// PgBouncer exited unsuccessfully.
    #[error("pgbouncer failed: {0}")]
    Pooler(#[from] SupervisorError),

    /// Kubernetes client could not be configured.
    #[error(transparent)]
    Kube(#[from] KubeError),

    /// Writing command output failed.
    #[error("Failed to write output: {0}")]
    Output(#[from] std::io::Error),

    /// A required argument was not supplied.
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    /// No known command matched.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

/// Store and lookup the cluster commands operate on.
#[derive(Clone)]
pub struct ClusterBackend {
    /// Cluster object store.
    pub store: Arc<dyn ClusterStore>,
    /// Instance existence check.
    pub lookup: Arc<dyn InstanceLookup>,
}

impl ClusterBackend {
    /// Backend from explicit parts.
    pub fn new(store: Arc<dyn ClusterStore>, lookup: Arc<dyn InstanceLookup>) -> Self {
        Self { store, lookup }
    }

    /// Backend talking to the Kubernetes API configured from the environment.
    pub fn kube_from_env() -> Result<Self, CliError> {
        let client = Arc::new(KubeClient::new(&KubeConfig::from_env()?)?);
        Ok(Self::new(client.clone(), client))
    }

    fn mutator(&self) -> ClusterStateMutator {
        ClusterStateMutator::new(self.store.clone(), self.lookup.clone())
    }
}

/// Deferred backend construction, so `pgbouncer run` never needs one.
pub type Connector<'a> = Box<dyn FnOnce() -> Result<ClusterBackend, CliError> + Send + 'a>;

/// Dependencies handed to [`dispatch`].
pub struct Deps<'a> {
    connect: Connector<'a>,
    out: &'a mut (dyn Write + Send),
}

impl<'a> Deps<'a> {
    /// Dependencies connecting to the backend on first use.
    pub fn new(out: &'a mut (dyn Write + Send), connect: Connector<'a>) -> Self {
        Self { connect, out }
    }

    /// Dependencies with an already built backend.
    pub fn with_backend(out: &'a mut (dyn Write + Send), backend: ClusterBackend) -> Self {
        Self::new(out, Box::new(move || Ok(backend)))
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Format for the selected command.
    ///
    /// `requested` is the value of `POOLVISOR_LOG_FORMAT`. Without it the
    /// sidecar logs JSON and the cluster commands log text.
    pub fn select(matches: &ArgMatches, requested: Option<&str>) -> Self {
        match requested.map(str::to_ascii_lowercase).as_deref() {
            Some("json") => LogFormat::Json,
            Some("text") => LogFormat::Text,
            _ if is_sidecar(matches) => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

fn is_sidecar(matches: &ArgMatches) -> bool {
    matches!(
        matches.subcommand(),
        Some(("pgbouncer", sub)) if matches!(sub.subcommand(), Some(("run", _)))
    )
}

/// `pgbouncer run` flags: environment variable, argument id, help.
const RUN_ARGS: [(&str, &str, &str); 7] = [
    ("POOLER_NAME", "pooler-name", "Pooler this sidecar serves"),
    ("PGBOUNCER_BINARY", "pgbouncer-binary", "PgBouncer executable"),
    ("PGBOUNCER_CONFIGS_DIR", "configs-dir", "PgBouncer configuration directory"),
    ("PGBOUNCER_SOCKET_DIR", "socket-dir", "PgBouncer unix socket directory"),
    ("PGBOUNCER_SOURCE_DIR", "source-dir", "Rendered configuration directory"),
    ("POOLVISOR_METRICS_PORT", "metrics-port", "Metrics endpoint port"),
    ("POOLVISOR_RECONCILE_INTERVAL_SECS", "reconcile-interval", "Seconds between passes"),
];

/// Build the full command tree.
pub fn build_cli() -> Command {
    let run = RUN_ARGS.iter().fold(
        Command::new("run").about("Run PgBouncer under supervision"),
        |cmd, (env, id, help)| cmd.arg(Arg::new(*id).long(*id).env(*env).help(*help)),
    );

    let cluster = || Arg::new("cluster").required(true).help("Cluster name");
    let instance = || Arg::new("instance").required(true);

    Command::new("poolvisor")
        .about("PgBouncer sidecar supervisor and cluster failover commands")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("namespace")
                .long("namespace")
                .short('n')
                .env("NAMESPACE")
                .default_value("default")
                .global(true)
                .help("Namespace of the cluster"),
        )
        .subcommand(
            Command::new("pgbouncer")
                .about("PgBouncer sidecar commands")
                .subcommand_required(true)
                .subcommand(run),
        )
        .subcommand(
            Command::new("promote")
                .about("Promote an instance to primary")
                .arg(cluster())
                .arg(instance().help("Instance to promote")),
        )
        .subcommand(
            Command::new("fence")
                .about("Fence or unfence instances")
                .subcommand_required(true)
                .subcommand(
                    Command::new("on")
                        .about("Fence an instance, or all with '*'")
                        .arg(cluster())
                        .arg(instance().help("Instance name or '*'")),
                )
                .subcommand(
                    Command::new("off")
                        .about("Unfence an instance, or all with '*'")
                        .arg(cluster())
                        .arg(instance().help("Instance name or '*'")),
                ),
        )
        .subcommand(
            Command::new("hibernate")
                .about("Hibernate or wake a cluster")
                .subcommand_required(true)
                .subcommand(Command::new("on").about("Hibernate the cluster").arg(cluster()))
                .subcommand(Command::new("off").about("Wake the cluster").arg(cluster())),
        )
}

/// Run the command selected in `matches`.
pub async fn dispatch(matches: &ArgMatches, deps: Deps<'_>) -> Result<(), CliError> {
    let Deps { connect, out } = deps;

    match matches.subcommand() {
        Some(("pgbouncer", sub)) => match sub.subcommand() {
            Some(("run", args)) => commands::run::execute(run_config(args)?).await,
            other => Err(unknown("pgbouncer", other)),
        },
        Some(("promote", args)) => {
            let key = cluster_key(args)?;
            let instance = required(args, "instance")?;
            let mutator = connect()?.mutator();
            commands::promote::execute(&mutator, &key, instance, out).await
        }
        Some(("fence", sub)) => {
            let (enable, args) = match sub.subcommand() {
                Some(("on", args)) => (true, args),
                Some(("off", args)) => (false, args),
                other => return Err(unknown("fence", other)),
            };
            let key = cluster_key(args)?;
            let target = FenceTarget::parse(required(args, "instance")?);
            let mutator = connect()?.mutator();
            commands::fence::execute(&mutator, &key, &target, enable, out).await
        }
        Some(("hibernate", sub)) => {
            let (mode, args) = match sub.subcommand() {
                Some(("on", args)) => (HibernationMode::On, args),
                Some(("off", args)) => (HibernationMode::Off, args),
                other => return Err(unknown("hibernate", other)),
            };
            let key = cluster_key(args)?;
            let mutator = connect()?.mutator();
            commands::hibernate::execute(&mutator, &key, mode, out).await
        }
        other => Err(unknown("poolvisor", other)),
    }
}

/// Sidecar configuration from `pgbouncer run` flags, which clap already
/// backs with their environment variables.
fn run_config(args: &ArgMatches) -> Result<RunConfig, CliError> {
    let config = RunConfig::from_lookup(|name| {
        if name == "NAMESPACE" {
            // The global default is for cluster commands; the sidecar must be told.
            return match args.value_source("namespace") {
                Some(ValueSource::DefaultValue) | None => None,
                Some(_) => args.get_one::<String>("namespace").cloned(),
            };
        }
        let (_, id, _) = RUN_ARGS.iter().find(|(env, _, _)| *env == name)?;
        args.get_one::<String>(id).cloned()
    })?;
    Ok(config)
}

fn cluster_key(args: &ArgMatches) -> Result<ObjectKey, CliError> {
    let namespace = required(args, "namespace")?;
    let cluster = required(args, "cluster")?;
    Ok(ObjectKey::new(namespace, cluster))
}

fn required<'m>(args: &'m ArgMatches, id: &'static str) -> Result<&'m str, CliError> {
    args.get_one::<String>(id)
        .map(String::as_str)
        .ok_or(CliError::MissingArgument(id))
}

fn unknown(parent: &str, sub: Option<(&str, &ArgMatches)>) -> CliError {
    match sub {
        Some((name, _)) => CliError::UnknownCommand(format!("{} {}", parent, name)),
        None => CliError::UnknownCommand(parent.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tree_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_namespace_is_global() {
        let matches = build_cli()
            .try_get_matches_from(["poolvisor", "fence", "on", "-n", "db", "pg", "*"])
            .unwrap();
        let (_, fence) = matches.subcommand().unwrap();
        let (_, on) = fence.subcommand().unwrap();

        let key = cluster_key(on).unwrap();
        assert_eq!(key, ObjectKey::new("db", "pg"));
        assert_eq!(required(on, "instance").unwrap(), "*");
    }

    #[test]
    fn test_missing_positional_is_rejected() {
        let result = build_cli().try_get_matches_from(["poolvisor", "promote", "pg"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_log_format_defaults_by_command() {
        let run = build_cli()
            .try_get_matches_from(["poolvisor", "pgbouncer", "run"])
            .unwrap();
        let promote = build_cli()
            .try_get_matches_from(["poolvisor", "promote", "pg", "pg-2"])
            .unwrap();

        assert_eq!(LogFormat::select(&run, None), LogFormat::Json);
        assert_eq!(LogFormat::select(&promote, None), LogFormat::Text);
        assert_eq!(LogFormat::select(&run, Some("text")), LogFormat::Text);
        assert_eq!(LogFormat::select(&promote, Some("JSON")), LogFormat::Json);
        assert_eq!(LogFormat::select(&run, Some("bogus")), LogFormat::Json);
    }

    #[test]
    fn test_run_flags_feed_config() {
        let matches = build_cli()
            .try_get_matches_from([
                "poolvisor",
                "--namespace",
                "db",
                "pgbouncer",
                "run",
                "--pooler-name",
                "pooler-rw",
                "--configs-dir",
                "/tmp/configs",
                "--metrics-port",
                "9000",
            ])
            .unwrap();
        let (_, pgbouncer) = matches.subcommand().unwrap();
        let (_, run) = pgbouncer.subcommand().unwrap();

        let config = run_config(run).unwrap();
        assert_eq!(config.pooler_name, "pooler-rw");
        assert_eq!(config.namespace, "db");
        assert_eq!(
            config.config_path(),
            std::path::PathBuf::from("/tmp/configs/pgbouncer.ini")
        );
        assert_eq!(config.metrics_port, 9000);
    }
}
