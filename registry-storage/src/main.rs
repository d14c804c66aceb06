//! Registry server and maintenance tool

use std::error::Error;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use registry_storage::{
    GcOptions, GcReport, Registry, RegistryBuilder, RegistryConfig, RegistryOptions,
    RepositoryName,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use storage::StorageConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "registry-server", about = "Container registry storage engine")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the registry API
    Serve {
        /// Address to listen on, overriding the configuration file
        #[arg(long)]
        listen: Option<String>,
    },

    /// Delete manifests and blobs that are no longer reachable
    GarbageCollect {
        /// Report what would be deleted without deleting anything
        #[arg(long)]
        dry_run: bool,

        /// Keep manifests that no tag points at
        #[arg(long)]
        keep_untagged: bool,

        /// Only collect this repository
        #[arg(long)]
        repository: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ServerConfig {
    #[serde(default = "default_storage")]
    storage: StorageConfig,
    #[serde(default = "default_bucket")]
    bucket: String,
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default)]
    registry: RegistryOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            bucket: default_bucket(),
            listen: default_listen(),
            registry: RegistryOptions::default(),
        }
    }
}

fn default_storage() -> StorageConfig {
    StorageConfig::Memory {
        bucket: default_bucket(),
    }
}

fn default_bucket() -> String {
    "registry".to_owned()
}

fn default_listen() -> String {
    "127.0.0.1:5000".to_owned()
}

impl ServerConfig {
    async fn load(path: Option<&Utf8PathBuf>) -> Result<Self, Box<dyn Error>> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let text = tokio::fs::read_to_string(path).await?;
        let document: toml_edit::DocumentMut = text.parse()?;
        let value = table_to_json(document.as_table());
        Ok(serde_json::from_value(value)?)
    }
}

fn table_to_json(table: &toml_edit::Table) -> Value {
    Value::Object(
        table
            .iter()
            .map(|(key, item)| (key.to_owned(), item_to_json(item)))
            .collect::<Map<_, _>>(),
    )
}

fn item_to_json(item: &toml_edit::Item) -> Value {
    match item {
        toml_edit::Item::None => Value::Null,
        toml_edit::Item::Value(value) => value_to_json(value),
        toml_edit::Item::Table(table) => table_to_json(table),
        toml_edit::Item::ArrayOfTables(tables) => {
            Value::Array(tables.iter().map(table_to_json).collect())
        }
    }
}

fn value_to_json(value: &toml_edit::Value) -> Value {
    match value {
        toml_edit::Value::String(s) => Value::from(s.value().as_str()),
        toml_edit::Value::Integer(i) => Value::from(*i.value()),
        toml_edit::Value::Float(f) => Value::from(*f.value()),
        toml_edit::Value::Boolean(b) => Value::from(*b.value()),
        toml_edit::Value::Datetime(d) => Value::from(d.value().to_string()),
        toml_edit::Value::Array(array) => Value::Array(array.iter().map(value_to_json).collect()),
        toml_edit::Value::InlineTable(table) => Value::Object(
            table
                .iter()
                .map(|(key, value)| (key.to_owned(), value_to_json(value)))
                .collect::<Map<_, _>>(),
        ),
    }
}

async fn open(config: ServerConfig) -> Result<(Registry, String), Box<dyn Error>> {
    let storage = config.storage.build().await?;
    let registry_config = RegistryConfig::try_from(config.registry)?;
    let registry = RegistryBuilder::new()
        .storage(storage)
        .bucket(config.bucket)
        .config(registry_config)
        .build()?;
    Ok((registry, config.listen))
}

fn print_report(report: &GcReport) {
    for deletion in &report.manifests_deleted {
        println!(
            "{}: manifest {} eligible for deletion",
            deletion.repository, deletion.digest
        );
    }
    for (scope, digest) in &report.blobs_deleted {
        println!("{scope}: blob {digest} eligible for deletion");
    }
    for (repository, digest) in &report.links_removed {
        println!("{repository}: link {digest} eligible for deletion");
    }
    println!(
        "{} blobs marked, {} blobs and {} manifests eligible for deletion",
        report.marked,
        report.blobs_deleted.len(),
        report.manifests_deleted.len()
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = ServerConfig::load(args.config.as_ref()).await?;

    match args.command {
        Command::Serve { listen } => {
            let (registry, configured) = open(config).await?;
            let addr = listen.unwrap_or(configured);
            let app = registry_storage::api::router(registry);

            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!("registry listening on http://{}", addr);
            axum::serve(listener, app).await?;
        }
        Command::GarbageCollect {
            dry_run,
            keep_untagged,
            repository,
        } => {
            let (registry, _) = open(config).await?;
            let collector = registry.garbage_collector(GcOptions {
                remove_untagged: !keep_untagged,
                dry_run,
            });
            let report = match repository {
                Some(name) => collector.run_repository(&RepositoryName::new(name)?).await?,
                None => collector.run().await?,
            };
            print_report(&report);
        }
    }

    Ok(())
}
