use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use deckhand_cluster::ClusterClient;
use deckhand_core::store::{Document, Repository};
use deckhand_core::{Deployment, Key, MetaDefaults};
use deckhand_diff::Changes;
use deckhand_entity::Entity;

#[derive(Parser, Debug)]
#[command(name = "deckctl", version, about = "Stage and reconcile Kubernetes resources")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Default namespace for objects that don't set one
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Flatten manifests into the deployable object set and print it
    Render {
        /// Manifest files (multi-document YAML)
        #[arg(short = 'f', long = "file", num_args = 1.., required = true)]
        files: Vec<PathBuf>,
    },
    /// List every image referenced by the manifests
    Images {
        #[arg(short = 'f', long = "file", num_args = 1.., required = true)]
        files: Vec<PathBuf>,
    },
    /// Create (or with --update, reconcile) the flattened objects in the cluster
    Apply {
        #[arg(short = 'f', long = "file", num_args = 1.., required = true)]
        files: Vec<PathBuf>,
        /// Patch objects that already exist instead of failing on them
        #[arg(long = "update", action = ArgAction::SetTrue)]
        update: bool,
    },
    /// Report drift between staged, committed and live objects
    Status {
        #[arg(short = 'f', long = "file", num_args = 1.., required = true)]
        files: Vec<PathBuf>,
        /// Committed snapshot to compare against (multi-document YAML)
        #[arg(long = "head")]
        head: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("DECKHAND_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DECKHAND_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DECKHAND_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let defaults = MetaDefaults { namespace: cli.namespace.clone(), ..Default::default() };

    match cli.command {
        Commands::Render { files } => {
            let tree = build_tree(load_files(&files)?, defaults)?;
            let deployment = tree.deployment()?;
            match cli.output {
                Output::Human => {
                    for (_, object) in deployment.iter() {
                        println!("---");
                        print!("{}", serde_yaml::to_string(object)?);
                    }
                }
                Output::Json => {
                    let objects: Vec<_> = deployment.iter().map(|(_, o)| o).collect();
                    println!("{}", serde_json::to_string_pretty(&objects)?);
                }
            }
        }
        Commands::Images { files } => {
            let tree = build_tree(load_files(&files)?, defaults)?;
            let images = tree.images();
            match cli.output {
                Output::Human => {
                    for image in &images {
                        println!("{}", image);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&images)?),
            }
        }
        Commands::Apply { files, update } => {
            let tree = build_tree(load_files(&files)?, defaults)?;
            let deployment = tree.deployment()?;
            info!(objects = deployment.len(), update, "apply invoked");
            let client = ClusterClient::connect().await?;
            client.deploy(&deployment, update).await?;
            println!("deployed {} object(s)", deployment.len());
        }
        Commands::Status { files, head } => {
            let repo = FileRepo { files, head };
            let docs: Vec<(String, Value)> = repo
                .index()?
                .into_values()
                .map(|d| (d.path, d.object))
                .collect();
            let index = build_tree(docs, defaults)?.deployment()?;
            let head = repo.head()?;

            let keys: BTreeSet<Key> = index.keys().chain(head.keys()).cloned().collect();
            let client = ClusterClient::connect().await?;
            let live = client.live(keys.iter()).await?;

            let stat = deckhand_diff::stat(&index, &head, &live);
            match cli.output {
                Output::Human => {
                    render_changes("From Index (staged vs cluster)", &stat.cluster);
                    render_changes("From HEAD (staged vs committed)", &stat.index);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&stat)?),
            }
        }
    }

    Ok(())
}

fn render_changes(title: &str, changes: &Changes) {
    println!("{}:", title);
    if changes.is_empty() {
        println!("  (clean)");
        return;
    }
    for key in &changes.new {
        println!("  new       {}", key);
    }
    for key in &changes.modified {
        println!("  modified  {}", key);
    }
    for key in &changes.deleted {
        println!("  deleted   {}", key);
    }
}

/// Load multi-document YAML manifests as `(source, object)` pairs.
fn load_files(paths: &[PathBuf]) -> Result<Vec<(String, Value)>> {
    let mut docs = Vec::new();
    for path in paths {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        docs.extend(parse_documents(&path.display().to_string(), &text)?);
    }
    Ok(docs)
}

fn parse_documents(source: &str, text: &str) -> Result<Vec<(String, Value)>> {
    let mut docs = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(doc)
            .with_context(|| format!("parsing {} (document {})", source, i))?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(value).context("converting YAML to JSON")?;
        let label = if i == 0 { source.to_string() } else { format!("{}#{}", source, i) };
        docs.push((label, json));
    }
    Ok(docs)
}

/// Assemble the entity tree: apps/v1 Deployments become controllers, v1
/// Pods become pod entities, everything else rides along as free-standing
/// objects on the application root.
fn build_tree(docs: Vec<(String, Value)>, defaults: MetaDefaults) -> Result<Entity> {
    let mut controllers = Vec::new();
    let mut pods = Vec::new();
    let mut extra = Vec::new();
    for (source, doc) in docs {
        let api_version = doc.get("apiVersion").and_then(Value::as_str).unwrap_or("");
        let kind = doc.get("kind").and_then(Value::as_str).unwrap_or("");
        match (api_version, kind) {
            ("apps/v1", "Deployment") => {
                let typed: k8s_openapi::api::apps::v1::Deployment = serde_json::from_value(doc)
                    .with_context(|| format!("{}: invalid apps/v1 Deployment", source))?;
                controllers.push(Entity::controller(typed, MetaDefaults::default(), &source, Vec::new())?);
            }
            ("v1", "Pod") => {
                let typed: k8s_openapi::api::core::v1::Pod = serde_json::from_value(doc)
                    .with_context(|| format!("{}: invalid v1 Pod", source))?;
                pods.push(Entity::pod(typed, MetaDefaults::default(), &source, Vec::new())?);
            }
            _ => extra.push(doc),
        }
    }
    let mut root = Entity::application(defaults, "deckctl", extra)?;
    for controller in controllers {
        root.attach(controller)?;
    }
    for pod in pods {
        root.attach(pod)?;
    }
    Ok(root)
}

/// File-backed take on the version-store contract: the staged index is the
/// manifest list, the committed head is an already-flattened snapshot file.
struct FileRepo {
    files: Vec<PathBuf>,
    head: Option<PathBuf>,
}

impl Repository for FileRepo {
    fn index(&self) -> Result<BTreeMap<String, Document>, deckhand_core::Error> {
        let mut out = BTreeMap::new();
        for path in &self.files {
            let source = path.display().to_string();
            let text = std::fs::read_to_string(path)
                .map_err(|e| deckhand_core::Error::Validation(format!("reading {}: {}", source, e)))?;
            let docs = parse_documents(&source, &text)
                .map_err(|e| deckhand_core::Error::Validation(e.to_string()))?;
            for (label, object) in docs {
                out.insert(label.clone(), Document { path: label, object });
            }
        }
        Ok(out)
    }

    fn head(&self) -> Result<Deployment, deckhand_core::Error> {
        let mut out = Deployment::new();
        let Some(path) = &self.head else { return Ok(out) };
        let source = path.display().to_string();
        let text = std::fs::read_to_string(path)
            .map_err(|e| deckhand_core::Error::Validation(format!("reading {}: {}", source, e)))?;
        let docs = parse_documents(&source, &text)
            .map_err(|e| deckhand_core::Error::Validation(e.to_string()))?;
        for (_, object) in docs {
            out.add(object)?;
        }
        Ok(out)
    }
}
