// Site adapters
// Each source site implements two raw operations (search a keyword, fetch a
// detail page). Ranking, status mapping, translation and record assembly are
// shared and live here, so adapters stay thin HTML extractors.

pub mod assemble;
pub mod dmm;
pub mod html;
pub mod javbus;
pub mod mgstage;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::classifier::ImageClassifier;
use super::http::{HttpSession, Page};
use super::identifier::{same_code, SiteRules};
use super::persistence::PersistenceGateway;
use crate::models::{ActorRef, BackendKind, CropMode, MovieRecord, Rating, RawCandidate};

/// Candidates scoring below this are dropped unless the search is manual
pub const MIN_MATCH_SCORE: f64 = 60.0;

#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    #[error("Not found")]
    NotFound,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected page structure: {0}")]
    Structure(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for SiteError {
    fn from(e: anyhow::Error) -> Self {
        SiteError::Network(format!("{:#}", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStatus {
    Success,
    NoMatch,
    Error,
    Exception,
}

impl SiteError {
    pub fn status(&self) -> AdapterStatus {
        match self {
            SiteError::NotFound => AdapterStatus::NoMatch,
            SiteError::Network(_) | SiteError::Structure(_) => AdapterStatus::Error,
            SiteError::Internal(_) => AdapterStatus::Exception,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOptions {
    pub translate: bool,
    /// Overrides the session's default proxy
    pub proxy: Option<String>,
    pub image_mode: BackendKind,
    /// Manual searches keep low-scoring candidates
    pub manual: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoOptions {
    #[serde(flatten)]
    pub search: SearchOptions,
    pub max_fanart: usize,
    pub want_extras: bool,
    /// Search-result thumbnail of the chosen candidate
    pub prior_small: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub status: AdapterStatus,
    pub message: Option<String>,
    pub candidates: Vec<RawCandidate>,
}

impl SearchResponse {
    fn success(candidates: Vec<RawCandidate>) -> Self {
        Self {
            status: AdapterStatus::Success,
            message: None,
            candidates,
        }
    }

    fn failed(status: AdapterStatus, message: String) -> Self {
        Self {
            status,
            message: Some(message),
            candidates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoResponse {
    pub status: AdapterStatus,
    pub message: Option<String>,
    pub record: Option<MovieRecord>,
}

impl InfoResponse {
    fn failed(status: AdapterStatus, message: String) -> Self {
        Self {
            status,
            message: Some(message),
            record: None,
        }
    }
}

/// Fields scraped from one detail page, before normalization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDetail {
    pub external_id: String,
    /// Product code text as printed on the page
    pub code_text: Option<String>,
    pub title: String,
    pub originaltitle: Option<String>,
    pub tagline: Option<String>,
    pub plot: Option<String>,
    pub actors: Vec<ActorRef>,
    pub genres: Vec<String>,
    pub studio: Option<String>,
    pub director: Option<String>,
    pub date_text: Option<String>,
    pub runtime_text: Option<String>,
    pub rating: Option<Rating>,
    pub small: Option<String>,
    pub large: Option<String>,
    pub gallery: Vec<String>,
    pub trailer: Option<String>,
}

/// Translation backend for titles and plots
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str) -> String;
}

pub struct NoopTranslator;

#[async_trait]
impl Translator for NoopTranslator {
    async fn translate(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Per-label image handling overrides, keyed by uppercase label
#[derive(Debug, Clone, Default)]
pub struct LabelPolicy {
    pub force_small_poster: HashSet<String>,
    pub crop_overrides: HashMap<String, CropMode>,
    pub remap: HashMap<String, String>,
}

impl LabelPolicy {
    pub fn forces_small(&self, label: &str) -> bool {
        self.force_small_poster.contains(&label.to_uppercase())
    }

    pub fn crop_for(&self, label: &str) -> Option<CropMode> {
        self.crop_overrides.get(&label.to_uppercase()).copied()
    }
}

/// Collaborators every adapter works with
pub struct SiteContext {
    pub session: Arc<HttpSession>,
    pub classifier: Arc<ImageClassifier>,
    pub gateway: Arc<PersistenceGateway>,
    pub translator: Arc<dyn Translator>,
    pub labels: LabelPolicy,
}

impl SiteContext {
    /// GET a page, mapping 404 to `NotFound` and other failures to `Network`
    pub async fn fetch_page(&self, url: &str, proxy: Option<&str>) -> Result<Page, SiteError> {
        let page = self.session.get(url, proxy).await?;
        if page.status == reqwest::StatusCode::NOT_FOUND {
            return Err(SiteError::NotFound);
        }
        if !page.is_success() {
            return Err(SiteError::Network(format!("HTTP {} for {}", page.status, url)));
        }
        Ok(page)
    }
}

#[async_trait]
pub trait SiteAdapter: Send + Sync {
    /// Short lowercase site key ("javbus")
    fn name(&self) -> &'static str;

    fn rules(&self) -> &SiteRules;

    fn context(&self) -> &SiteContext;

    /// Unranked search hits
    async fn search_raw(
        &self,
        keyword: &str,
        options: &SearchOptions,
    ) -> Result<Vec<RawCandidate>, SiteError>;

    async fn fetch_detail(
        &self,
        external_id: &str,
        options: &SearchOptions,
    ) -> Result<RawDetail, SiteError>;

    /// Ranked search. Never fails: problems come back as a status.
    async fn search(&self, keyword: &str, options: &SearchOptions) -> SearchResponse {
        let outcome = AssertUnwindSafe(self.search_raw(keyword, options))
            .catch_unwind()
            .await;

        let candidates = match outcome {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => {
                tracing::debug!("{} search for '{}' failed: {}", self.name(), keyword, e);
                return SearchResponse::failed(e.status(), e.to_string());
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!("{} search for '{}' panicked: {}", self.name(), keyword, message);
                return SearchResponse::failed(AdapterStatus::Exception, message);
            }
        };

        let mut ranked = rank_candidates(candidates, keyword, options.manual, self.rules());
        if ranked.is_empty() {
            return SearchResponse::failed(
                AdapterStatus::NoMatch,
                format!("No {} result for '{}'", self.name(), keyword),
            );
        }

        if options.translate {
            for candidate in &mut ranked {
                candidate.raw_title = self.context().translator.translate(&candidate.raw_title).await;
            }
        }

        SearchResponse::success(ranked)
    }

    /// Fetch, classify and persist one record
    async fn info(&self, external_id: &str, options: &InfoOptions) -> InfoResponse {
        let outcome = AssertUnwindSafe(async {
            let detail = self.fetch_detail(external_id, &options.search).await?;
            Ok::<_, SiteError>(
                assemble::assemble_record(self.context(), self.name(), self.rules(), detail, options)
                    .await,
            )
        })
        .catch_unwind()
        .await;

        match outcome {
            Ok(Ok(record)) => InfoResponse {
                status: AdapterStatus::Success,
                message: None,
                record: Some(record),
            },
            Ok(Err(e)) => {
                tracing::debug!("{} info for '{}' failed: {}", self.name(), external_id, e);
                InfoResponse::failed(e.status(), e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!("{} info for '{}' panicked: {}", self.name(), external_id, message);
                InfoResponse::failed(AdapterStatus::Exception, message)
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "adapter panicked".to_string()
    }
}

/// Score every candidate, drop weak ones unless manual, and sort best first.
/// The sort is stable, so equal scores keep the order the site returned.
pub fn rank_candidates(
    candidates: Vec<RawCandidate>,
    keyword: &str,
    manual: bool,
    rules: &SiteRules,
) -> Vec<RawCandidate> {
    let mut scored: Vec<RawCandidate> = candidates
        .into_iter()
        .map(|mut c| {
            c.match_score = match_score(keyword, &c.external_id, &c.raw_title, rules);
            c
        })
        .filter(|c| manual || c.match_score >= MIN_MATCH_SCORE)
        .collect();

    scored.sort_by(|a, b| {
        b.match_score
            .partial_cmp(&a.match_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored
}

/// 100 when the codes agree, otherwise the better of code and title similarity
pub fn match_score(keyword: &str, code: &str, title: &str, rules: &SiteRules) -> f64 {
    if same_code(keyword, code, rules) {
        return 100.0;
    }

    let by_code = similarity(&compact(keyword), &compact(code));
    let by_title = similarity(
        keyword.trim().to_lowercase().as_str(),
        title.trim().to_lowercase().as_str(),
    );
    by_code.max(by_title).clamp(0.0, 100.0)
}

fn compact(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Tiered similarity in [0, 100]: prefix, containment and word overlap get
/// fixed bands, anything else falls back to normalized edit distance.
fn similarity(query: &str, target: &str) -> f64 {
    if query.is_empty() || target.is_empty() {
        return 0.0;
    }
    if query == target {
        return 100.0;
    }

    let (q_len, t_len) = (query.chars().count() as f64, target.chars().count() as f64);
    let ratio = q_len.min(t_len) / q_len.max(t_len);

    if target.starts_with(query) {
        return 80.0 + ratio * 15.0;
    }
    if query.starts_with(target) || target.contains(query) {
        return 60.0 + ratio * 25.0;
    }

    let query_words: Vec<&str> = query.split_whitespace().collect();
    let target_words: Vec<&str> = target.split_whitespace().collect();
    if query_words.len() > 1 {
        let hits = query_words
            .iter()
            .filter(|w| target_words.contains(w))
            .count();
        let overlap = hits as f64 / query_words.len() as f64;
        if overlap > 0.5 {
            return 50.0 + overlap * 40.0;
        }
    }

    let distance = levenshtein(query, target) as f64;
    (1.0 - distance / q_len.max(t_len)) * 100.0
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
