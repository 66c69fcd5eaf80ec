use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use courier_core::config::load_courier_config;
use courier_core::document::{Asset, AssetKind, DocumentKey, DocumentKind};
use courier_core::fetch::{Fetcher, FfprobeProber, MediaProber};
use courier_core::index::HttpDocumentIndex;
use courier_core::store::{
    storage_key, EncodePoller, HttpObjectStore, HttpStreamProvider, StreamProvider, Uploader,
};
use courier_core::TransferCoordinator;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] courier_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("document is missing its (site, post_id) key")]
    MissingKey,
    #[error("media probe failed: {0}")]
    Probe(String),
    #[error("fetch setup failed: {0}")]
    Fetch(#[from] courier_core::fetch::FetchError),
    #[error(transparent)]
    Transfer(#[from] courier_core::TransferError),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Courier command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main courier.toml
    #[arg(long, default_value = "configs/courier.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validates the node configuration and prints a summary
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Lists the assets embedded in a document file
    Assets(AssetsArgs),
    /// Shows the storage keys a document's assets would land on
    Keys(AssetsArgs),
    /// Diffs two document files and lists orphaned asset locations
    Orphans(OrphansArgs),
    /// Probes a local media file for stream properties
    Probe(ProbeArgs),
    /// Runs one document mutation through the full transfer pipeline
    Submit(AssetsArgs),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Loads and validates the config file
    Check,
}

#[derive(Args, Debug)]
pub struct AssetsArgs {
    /// Path to a JSON document file
    pub document: PathBuf,
    /// Document variant
    #[arg(long, value_enum, default_value_t = KindArg::Video)]
    pub kind: KindArg,
}

#[derive(Args, Debug)]
pub struct OrphansArgs {
    /// The previously indexed document
    pub previous: PathBuf,
    /// The incoming document
    pub current: PathBuf,
    /// Document variant
    #[arg(long, value_enum, default_value_t = KindArg::Video)]
    pub kind: KindArg,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Path to a local media file
    pub file: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Video,
    Post,
    Course,
}

impl From<KindArg> for DocumentKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Video => DocumentKind::Video,
            KindArg::Post => DocumentKind::Post,
            KindArg::Course => DocumentKind::Course,
        }
    }
}

pub fn run(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init()
        .ok();

    match &cli.command {
        Commands::Config(ConfigCommands::Check) => {
            let summary = config_check(&cli.config)?;
            render(&summary, cli.format)
        }
        Commands::Assets(args) => {
            let report = asset_report(args)?;
            render(&report, cli.format)
        }
        Commands::Keys(args) => {
            let report = key_report(args)?;
            render(&report, cli.format)
        }
        Commands::Orphans(args) => {
            let report = orphan_report(args)?;
            render(&report, cli.format)
        }
        Commands::Probe(args) => {
            let report = probe_file(args)?;
            render(&report, cli.format)
        }
        Commands::Submit(args) => {
            let report = submit_document(&cli.config, args)?;
            render(&report, cli.format)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub node_name: String,
    pub environment: String,
    pub storage_bucket: String,
    pub stream_enabled: bool,
    pub index_endpoint: String,
}

fn config_check(path: &PathBuf) -> Result<ConfigSummary> {
    let config = load_courier_config(path)?;
    Ok(ConfigSummary {
        node_name: config.service.node_name,
        environment: config.service.environment,
        storage_bucket: config.storage.bucket,
        stream_enabled: config.stream.enabled,
        index_endpoint: config.index.endpoint,
    })
}

impl DisplayFallback for ConfigSummary {
    fn display(&self) -> String {
        format!(
            "node {} ({})\nstorage bucket: {}\nstream uploads: {}\nindex: {}",
            self.node_name,
            self.environment,
            self.storage_bucket,
            if self.stream_enabled { "on" } else { "off" },
            self.index_endpoint,
        )
    }
}

#[derive(Debug, Serialize)]
pub struct AssetRow {
    pub kind: String,
    pub download_url: String,
    pub content_hash: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AssetReport {
    pub key: DocumentKey,
    pub assets: Vec<AssetRow>,
}

fn load_document(path: &PathBuf) -> Result<Value> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn kind_label(kind: &AssetKind) -> String {
    match kind {
        AssetKind::Source { unit_index, source_index } => format!(
            "source[{}][{}]",
            unit_index.map(|i| i.to_string()).unwrap_or_else(|| "?".into()),
            source_index.map(|i| i.to_string()).unwrap_or_else(|| "?".into()),
        ),
        AssetKind::Transcript { unit_index } => format!("transcript[{unit_index}]"),
        AssetKind::Srt { unit_index } => format!("srt[{unit_index}]"),
        AssetKind::Thumbnail { size, .. } => format!("thumbnail.{}", size.as_str()),
    }
}

fn extract_assets(args: &AssetsArgs) -> Result<(DocumentKey, Vec<Asset>)> {
    let document = load_document(&args.document)?;
    let key = DocumentKey::from_value(&document).ok_or(AppError::MissingKey)?;
    let kind: DocumentKind = args.kind.into();
    Ok((key, kind.model().get_assets(&document)))
}

fn asset_report(args: &AssetsArgs) -> Result<AssetReport> {
    let (key, assets) = extract_assets(args)?;
    Ok(AssetReport {
        key,
        assets: assets
            .into_iter()
            .map(|asset| AssetRow {
                kind: kind_label(&asset.kind),
                download_url: asset.download_url,
                content_hash: asset.content_hash,
            })
            .collect(),
    })
}

impl DisplayFallback for AssetReport {
    fn display(&self) -> String {
        let mut out = format!("document {} ({} assets)", self.key, self.assets.len());
        for row in &self.assets {
            out.push_str(&format!(
                "\n  {:<16} {}  md5={}",
                row.kind,
                row.download_url,
                row.content_hash.as_deref().unwrap_or("-"),
            ));
        }
        out
    }
}

#[derive(Debug, Serialize)]
pub struct KeyRow {
    pub kind: String,
    pub storage_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct KeyReport {
    pub key: DocumentKey,
    pub keys: Vec<KeyRow>,
}

fn key_report(args: &AssetsArgs) -> Result<KeyReport> {
    let document = load_document(&args.document)?;
    let key = DocumentKey::from_value(&document).ok_or(AppError::MissingKey)?;
    let date = courier_core::document::publish_date(&document).unwrap_or_else(Utc::now);
    let kind: DocumentKind = args.kind.into();
    let keys = kind
        .model()
        .get_assets(&document)
        .into_iter()
        .map(|asset| KeyRow {
            kind: kind_label(&asset.kind),
            storage_key: asset.content_hash.as_ref().map(|hash| {
                let extension = asset
                    .download_url
                    .rsplit('.')
                    .next()
                    .unwrap_or("bin")
                    .to_string();
                storage_key(&key, date, hash, &extension)
            }),
        })
        .collect();
    Ok(KeyReport { key, keys })
}

impl DisplayFallback for KeyReport {
    fn display(&self) -> String {
        let mut out = format!("document {}", self.key);
        for row in &self.keys {
            out.push_str(&format!(
                "\n  {:<16} {}",
                row.kind,
                row.storage_key.as_deref().unwrap_or("(no hash yet)"),
            ));
        }
        out
    }
}

#[derive(Debug, Serialize)]
pub struct OrphanReport {
    pub orphaned_locations: Vec<String>,
}

fn orphan_report(args: &OrphansArgs) -> Result<OrphanReport> {
    let previous = load_document(&args.previous)?;
    let current = load_document(&args.current)?;
    let kind: DocumentKind = args.kind.into();
    let model = kind.model();
    let orphans = courier_core::document::orphaned_assets(
        &model.get_assets(&previous),
        &model.get_assets(&current),
    );
    Ok(OrphanReport {
        orphaned_locations: orphans
            .into_iter()
            .filter(|asset| asset.has_download_url())
            .map(|asset| asset.download_url)
            .collect(),
    })
}

impl DisplayFallback for OrphanReport {
    fn display(&self) -> String {
        if self.orphaned_locations.is_empty() {
            return "no orphaned assets".to_string();
        }
        let mut out = format!("{} orphaned asset(s)", self.orphaned_locations.len());
        for location in &self.orphaned_locations {
            out.push_str(&format!("\n  {location}"));
        }
        out
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitReport {
    pub key: DocumentKey,
    pub index_id: String,
    pub assets: usize,
    pub removed_locations: Vec<String>,
}

fn submit_document(config_path: &PathBuf, args: &AssetsArgs) -> Result<SubmitReport> {
    let config = load_courier_config(config_path)?;
    let document = load_document(&args.document)?;
    let key = DocumentKey::from_value(&document).ok_or(AppError::MissingKey)?;
    let kind: DocumentKind = args.kind.into();

    let client = reqwest::Client::new();
    let store = Arc::new(HttpObjectStore::new(
        client.clone(),
        config.storage.endpoint.clone(),
        config.storage.bucket.clone(),
        config.storage.public_base_url.clone(),
    ));
    let provider: Option<Arc<dyn StreamProvider>> = config
        .stream
        .enabled
        .then(|| {
            Arc::new(HttpStreamProvider::new(
                client.clone(),
                config.stream.endpoint.clone(),
            )) as Arc<dyn StreamProvider>
        });
    let uploader = Uploader::new(
        store,
        provider,
        EncodePoller::new(config.stream.poll_interval(), config.stream.max_polls),
    );
    let index = Arc::new(HttpDocumentIndex::new(client, config.index.clone()));
    let fetcher = Fetcher::new(&config)?;
    let coordinator = TransferCoordinator::new(fetcher, uploader, index, &config);

    let runtime = tokio::runtime::Runtime::new()?;
    let finalized = runtime.block_on(coordinator.submit(kind, document))?;
    Ok(SubmitReport {
        key,
        assets: kind.model().get_assets(&finalized.document).len(),
        index_id: finalized.index_id,
        removed_locations: finalized.removed_locations,
    })
}

impl DisplayFallback for SubmitReport {
    fn display(&self) -> String {
        let mut out = format!(
            "document {} indexed as {} ({} assets)",
            self.key, self.index_id, self.assets,
        );
        if !self.removed_locations.is_empty() {
            out.push_str(&format!(
                "\nremoved {} orphaned location(s)",
                self.removed_locations.len()
            ));
        }
        out
    }
}

#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub file: PathBuf,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub duration: Option<f64>,
    pub bitrate: Option<u64>,
}

fn probe_file(args: &ProbeArgs) -> Result<ProbeReport> {
    let runtime = tokio::runtime::Runtime::new()?;
    let prober = FfprobeProber::new("ffprobe");
    let props = runtime
        .block_on(prober.probe(&args.file))
        .map_err(|err| AppError::Probe(err.to_string()))?;
    Ok(ProbeReport {
        file: args.file.clone(),
        width: props.width,
        height: props.height,
        duration: props.duration,
        bitrate: props.bitrate,
    })
}

impl DisplayFallback for ProbeReport {
    fn display(&self) -> String {
        format!(
            "{}: {}x{}, {:.1}s, {} b/s",
            self.file.display(),
            self.width.unwrap_or(0),
            self.height.unwrap_or(0),
            self.duration.unwrap_or(0.0),
            self.bitrate.unwrap_or(0),
        )
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_doc(dir: &tempfile::TempDir, name: &str, value: &Value) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
        path
    }

    #[test]
    fn asset_report_lists_video_assets() {
        let dir = tempfile::tempdir().unwrap();
        let doc = json!({
            "site": "publisher",
            "post_id": 42,
            "unit": [
                { "source": [ { "downloadUrl": "http://origin/v.mp4", "md5": "abc" } ],
                  "srt": { "srcUrl": "http://origin/v.srt" } }
            ]
        });
        let path = write_doc(&dir, "doc.json", &doc);
        let report = asset_report(&AssetsArgs {
            document: path,
            kind: KindArg::Video,
        })
        .unwrap();
        assert_eq!(report.key.to_string(), "publisher_42");
        assert_eq!(report.assets.len(), 2);
        assert_eq!(report.assets[0].kind, "source[0][0]");
        assert_eq!(report.assets[1].kind, "srt[0]");
    }

    #[test]
    fn orphan_report_diffs_documents() {
        let dir = tempfile::tempdir().unwrap();
        let previous = json!({
            "site": "publisher", "post_id": 1,
            "unit": [ { "source": [
                { "downloadUrl": "https://assets/a.mp4", "md5": "keep" },
                { "downloadUrl": "https://assets/b.mp4", "md5": "gone" }
            ] } ]
        });
        let current = json!({
            "site": "publisher", "post_id": 1,
            "unit": [ { "source": [
                { "downloadUrl": "https://assets/a.mp4", "md5": "keep" }
            ] } ]
        });
        let report = orphan_report(&OrphansArgs {
            previous: write_doc(&dir, "prev.json", &previous),
            current: write_doc(&dir, "cur.json", &current),
            kind: KindArg::Video,
        })
        .unwrap();
        assert_eq!(report.orphaned_locations, vec!["https://assets/b.mp4"]);
    }

    #[test]
    fn missing_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_doc(&dir, "doc.json", &json!({ "title": "no key" }));
        let err = asset_report(&AssetsArgs {
            document: path,
            kind: KindArg::Post,
        })
        .unwrap_err();
        assert!(matches!(err, AppError::MissingKey));
    }
}
