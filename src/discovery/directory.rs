use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::{error::AppError, models::CandidatePeer, utils::parse_peer_uri};

/// Source of candidate peers for a scan
#[async_trait]
pub trait SeedDirectory: Send + Sync {
    /// Every known candidate, in directory order
    async fn candidates(&self) -> Result<Vec<CandidatePeer>, AppError>;
}

/// Fixed candidate list, mostly useful for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct StaticSeedDirectory {
    peers: Vec<CandidatePeer>,
}

impl StaticSeedDirectory {
    pub fn new(peers: Vec<CandidatePeer>) -> Self {
        Self { peers }
    }

    /// Build from `(uri, region)` pairs, skipping URIs that do not parse
    pub fn from_uris<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
    {
        let peers = entries
            .into_iter()
            .filter_map(|(uri, region)| candidate_from_uri(uri, region.map(str::to_string)))
            .collect();
        Self { peers }
    }
}

#[async_trait]
impl SeedDirectory for StaticSeedDirectory {
    async fn candidates(&self) -> Result<Vec<CandidatePeer>, AppError> {
        Ok(self.peers.clone())
    }
}

/// Seed list read from a JSON file on every scan
#[derive(Debug, Clone)]
pub struct JsonSeedDirectory {
    path: PathBuf,
}

impl JsonSeedDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SeedDirectory for JsonSeedDirectory {
    async fn candidates(&self) -> Result<Vec<CandidatePeer>, AppError> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        let peers = parse_seed_json(&text)?;
        tracing::debug!(
            "Loaded {} candidates from {}",
            peers.len(),
            self.path.display()
        );
        Ok(peers)
    }
}

#[derive(Debug, Deserialize)]
struct SeedEntry {
    uri: String,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SeedEntryOrUri {
    Entry(SeedEntry),
    Uri(String),
}

/// Accepted seed layouts: a flat list or a map keyed by region
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SeedDocument {
    List(Vec<SeedEntryOrUri>),
    ByRegion(BTreeMap<String, Vec<SeedEntryOrUri>>),
}

/// Parse a seed document, dropping entries whose URI is unusable
pub fn parse_seed_json(text: &str) -> Result<Vec<CandidatePeer>, AppError> {
    let document: SeedDocument = serde_json::from_str(text)
        .map_err(|e| AppError::ConfigError(format!("Invalid seed directory: {}", e)))?;

    let entries: Vec<(String, Option<String>)> = match document {
        SeedDocument::List(items) => items
            .into_iter()
            .map(|item| match item {
                SeedEntryOrUri::Entry(entry) => (entry.uri, entry.region),
                SeedEntryOrUri::Uri(uri) => (uri, None),
            })
            .collect(),
        SeedDocument::ByRegion(regions) => regions
            .into_iter()
            .flat_map(|(region, items)| {
                items.into_iter().map(move |item| match item {
                    SeedEntryOrUri::Entry(entry) => {
                        (entry.uri, entry.region.or_else(|| Some(region.clone())))
                    }
                    SeedEntryOrUri::Uri(uri) => (uri, Some(region.clone())),
                })
            })
            .collect(),
    };

    Ok(entries
        .into_iter()
        .filter_map(|(uri, region)| candidate_from_uri(&uri, region))
        .collect())
}

fn candidate_from_uri(uri: &str, region: Option<String>) -> Option<CandidatePeer> {
    match parse_peer_uri(uri) {
        Ok(endpoint) => Some(CandidatePeer {
            uri: uri.trim().to_string(),
            protocol: endpoint.protocol,
            region,
        }),
        Err(e) => {
            tracing::debug!("Skipping seed entry: {}", e);
            None
        }
    }
}
