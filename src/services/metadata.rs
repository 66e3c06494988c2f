use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::sites::assemble::parse_date;
use super::sites::dmm::Dmm;
use super::sites::javbus::JavBus;
use super::sites::mgstage::MgStage;
use super::sites::{
    AdapterStatus, InfoOptions, InfoResponse, SearchOptions, SiteAdapter, SiteContext,
};
use crate::models::{MovieRecord, RawCandidate};

pub const KNOWN_SITES: [&str; 3] = ["javbus", "dmm", "mgstage"];

/// Outcome of one site's search within an aggregate search
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteOutcome {
    pub site: String,
    pub status: AdapterStatus,
    pub message: Option<String>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSearch {
    /// All sites' candidates, best first; ties keep site order
    pub candidates: Vec<RawCandidate>,
    pub sites: Vec<SiteOutcome>,
}

/// Instantiate adapters by site key, in the given order
pub fn build_adapters(
    ctx: Arc<SiteContext>,
    enabled: &[String],
    base_urls: &HashMap<String, String>,
) -> Vec<Arc<dyn SiteAdapter>> {
    let mut adapters: Vec<Arc<dyn SiteAdapter>> = Vec::new();
    for name in enabled {
        let key = name.trim().to_lowercase();
        let base = base_urls.get(&key).cloned();
        match key.as_str() {
            "javbus" => adapters.push(Arc::new(JavBus::new(ctx.clone(), base))),
            "dmm" => adapters.push(Arc::new(Dmm::new(ctx.clone(), base))),
            "mgstage" => adapters.push(Arc::new(MgStage::new(ctx.clone(), base))),
            other => tracing::warn!("Unknown site '{}' in configuration, skipping", other),
        }
    }
    adapters
}

pub struct MetadataService {
    adapters: Vec<Arc<dyn SiteAdapter>>,
}

impl MetadataService {
    pub fn new(adapters: Vec<Arc<dyn SiteAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn site_names(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    fn adapter(&self, site: &str) -> Option<&Arc<dyn SiteAdapter>> {
        self.adapters.iter().find(|a| a.name() == site)
    }

    /// Search every site concurrently and merge the ranked candidates
    pub async fn search(&self, keyword: &str, options: &SearchOptions) -> AggregateSearch {
        tracing::debug!("Searching {} site(s) for '{}'", self.adapters.len(), keyword);

        let responses = join_all(
            self.adapters
                .iter()
                .map(|adapter| adapter.search(keyword, options)),
        )
        .await;

        let mut candidates = Vec::new();
        let mut sites = Vec::with_capacity(responses.len());
        for (adapter, response) in self.adapters.iter().zip(responses) {
            sites.push(SiteOutcome {
                site: adapter.name().to_string(),
                status: response.status,
                message: response.message,
                count: response.candidates.len(),
            });
            candidates.extend(response.candidates);
        }

        candidates.sort_by(|a, b| {
            b.match_score
                .partial_cmp(&a.match_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        AggregateSearch { candidates, sites }
    }

    pub async fn info(&self, site: &str, external_id: &str, options: &InfoOptions) -> InfoResponse {
        match self.adapter(site) {
            Some(adapter) => adapter.info(external_id, options).await,
            None => InfoResponse {
                status: AdapterStatus::NoMatch,
                message: Some(format!("Site '{}' is not enabled", site)),
                record: None,
            },
        }
    }

    /// Search, then fetch candidates in rank order until one yields a record
    pub async fn lookup(&self, keyword: &str, options: &InfoOptions) -> Option<MovieRecord> {
        let found = self.search(keyword, &options.search).await;
        if found.candidates.is_empty() {
            tracing::info!("No candidates for '{}'", keyword);
            return None;
        }

        for candidate in &found.candidates {
            let mut info_options = options.clone();
            info_options.prior_small = candidate.raw_image_url.clone();

            let response = self
                .info(&candidate.site, &candidate.external_id, &info_options)
                .await;
            match (response.status, response.record) {
                (AdapterStatus::Success, Some(mut record)) => {
                    fill_from_candidate(&mut record, candidate);
                    tracing::info!(
                        "Found '{}' on {}: {}",
                        keyword,
                        candidate.site,
                        record.identifier
                    );
                    return Some(record);
                }
                (status, _) => {
                    tracing::debug!(
                        "{} info for {} gave {:?}: {}",
                        candidate.site,
                        candidate.external_id,
                        status,
                        response.message.unwrap_or_default()
                    );
                }
            }
        }

        None
    }
}

/// Detail pages sometimes lack what the search card showed
fn fill_from_candidate(record: &mut MovieRecord, candidate: &RawCandidate) {
    if record.title.trim().is_empty() {
        record.title = candidate.raw_title.clone();
    }
    if record.originaltitle.trim().is_empty() {
        record.originaltitle = record.title.clone();
    }
    if record.premiered.is_none() {
        record.premiered = candidate.raw_date_text.as_deref().and_then(parse_date);
    }
}
