//! storctl
//!
//! Command line front end of the storage controller core. Opens the
//! controller database, runs one request through the request executor and
//! prints the outcome as JSON.

use clap::{Parser, Subcommand};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_controller_core::{
    AccessContext, CoreConfig, Error, NodeArgs, NodeName, NodeType, NumberPool, Repository, RequestExecutor,
    ResourceArgs, ResourceDefinitionArgs, ResourceName, Result, VolumeDefinitionArgs, VolumeNumber,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage controller core - entity repository tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "STORCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Controller database file (overrides the configuration file)
    #[arg(long, env = "STORCTL_DATABASE")]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print repository statistics and every cached entity
    Inspect,

    /// Create a node
    CreateNode {
        name: String,
        /// controller, satellite, combined or auxiliary
        #[arg(long, default_value = "satellite")]
        node_type: String,
    },

    /// Delete a node without resources
    DeleteNode { name: String },

    /// Set a property on a node
    SetNodeProp {
        name: String,
        key: String,
        value: String,
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Create a resource definition with one volume and deploy it on nodes
    CreateResource {
        name: String,
        /// Volume size in KiB
        #[arg(long, default_value = "1048576")]
        size_kib: u64,
        /// Nodes to deploy on
        #[arg(long = "node")]
        nodes: Vec<String>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => CoreConfig::from_file(path)?,
        None => CoreConfig::default(),
    };
    if let Some(database) = &args.database {
        config.database_path = Some(database.clone());
    }
    config.validate()?;

    info!("Starting storctl");
    info!("  Version: {}", storage_controller_core::VERSION);
    info!("  Mode: {:?}", config.mode);
    info!("  Database: {:?}", config.database_path);

    let repo = Repository::from_config(&config)?;
    let executor = RequestExecutor::from_config(repo.clone(), &config);

    let output = match args.command {
        Command::Inspect => inspect(&repo)?,
        Command::CreateNode { name, node_type } => {
            let name = NodeName::new(name)?;
            let node_type: NodeType = node_type.parse()?;
            executor
                .execute("create-node", move |repo, ctx| {
                    let args = NodeArgs {
                        node_type,
                        ..Default::default()
                    };
                    let node = repo
                        .get_node(&AccessContext::system(), ctx, &name, args, true, true)?
                        .ok_or_else(|| not_found("node", &name))?;
                    Ok(json!({ "created": node.name().value(), "uuid": node.uuid() }))
                })
                .await?
        }
        Command::DeleteNode { name } => {
            let name = NodeName::new(name)?;
            executor
                .execute("delete-node", move |repo, ctx| {
                    let node = repo.node(&name)?.ok_or_else(|| not_found("node", &name))?;
                    repo.delete_node(&AccessContext::system(), ctx, &node)?;
                    Ok(json!({ "deleted": name.value() }))
                })
                .await?
        }
        Command::SetNodeProp {
            name,
            key,
            value,
            namespace,
        } => {
            let name = NodeName::new(name)?;
            executor
                .execute("set-node-prop", move |repo, ctx| {
                    let acc = AccessContext::system();
                    let node = repo.node(&name)?.ok_or_else(|| not_found("node", &name))?;
                    ctx.attach(&node)?;
                    let previous = node.props_mut(&acc)?.set_prop(&key, &value, namespace.as_deref())?;
                    Ok(json!({ "node": name.value(), "key": key, "value": value, "previous": previous }))
                })
                .await?
        }
        Command::CreateResource {
            name,
            size_kib,
            nodes,
        } => {
            let name = ResourceName::new(name)?;
            let nodes = nodes
                .into_iter()
                .map(NodeName::new)
                .collect::<Result<Vec<_>>>()?;
            executor
                .execute("create-resource", move |repo, ctx| {
                    let acc = AccessContext::system();
                    let rsc_dfn = repo
                        .get_resource_definition(&acc, ctx, &name, ResourceDefinitionArgs::default(), true, true)?
                        .ok_or_else(|| not_found("resource definition", &name))?;
                    let vlm_args = VolumeDefinitionArgs {
                        size_kib,
                        ..Default::default()
                    };
                    let vlm_dfn = repo
                        .get_volume_definition(&acc, ctx, &rsc_dfn, VolumeNumber::new(0)?, vlm_args, true, true)?
                        .ok_or_else(|| not_found("volume definition", &name))?;
                    for node_name in &nodes {
                        let node = repo.node(node_name)?.ok_or_else(|| not_found("node", node_name))?;
                        repo.get_resource(&acc, ctx, &node, &rsc_dfn, ResourceArgs::default(), true, true)?;
                    }
                    Ok(json!({
                        "created": name.value(),
                        "minor_number": vlm_dfn.minor_number(&acc)?.value(),
                        "nodes": nodes.iter().map(|n| n.value().to_string()).collect::<Vec<_>>(),
                    }))
                })
                .await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

// =============================================================================
// Inspect
// =============================================================================

fn inspect(repo: &Arc<Repository>) -> Result<serde_json::Value> {
    let acc = AccessContext::system();

    let mut nodes = BTreeMap::new();
    for node in repo.nodes() {
        nodes.insert(
            node.name().value().to_string(),
            json!({
                "uuid": node.uuid(),
                "type": node.node_type(&acc)?.to_string(),
                "resources": node.resource_count(),
                "props": node.props(&acc)?.map(),
            }),
        );
    }

    let mut resource_definitions = BTreeMap::new();
    for rsc_dfn in repo.resource_definitions() {
        let mut volumes = Vec::new();
        for vlm_dfn in rsc_dfn.volume_definitions(&acc)? {
            volumes.push(json!({
                "volume_number": vlm_dfn.volume_number().value(),
                "size_kib": vlm_dfn.volume_size(&acc)?,
                "minor_number": vlm_dfn.minor_number(&acc)?.value(),
            }));
        }
        let deployed_on = rsc_dfn
            .resources(&acc)?
            .iter()
            .map(|rsc| rsc.node().name().value().to_string())
            .collect::<Vec<_>>();
        resource_definitions.insert(
            rsc_dfn.name().value().to_string(),
            json!({
                "uuid": rsc_dfn.uuid(),
                "volumes": volumes,
                "deployed_on": deployed_on,
            }),
        );
    }

    Ok(json!({
        "mode": repo.mode(),
        "stats": repo.stats(),
        "minors_allocated": repo.minor_pool().allocated_count(),
        "nodes": nodes,
        "resource_definitions": resource_definitions,
    }))
}

fn not_found(kind: &'static str, key: impl std::fmt::Display) -> Error {
    Error::NotFound {
        kind,
        key: key.to_string(),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so stdout carries only the JSON result.
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
