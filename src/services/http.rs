// Shared HTTP session
// One per process. Holds a cookie-carrying client per proxy identity, a
// time-boxed GET cache and the age-gate verification state of each site.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::{Client, StatusCode, Url};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::image_ops::{read_file, ImageFetcher};
use crate::models::ImageRef;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0 Safari/537.36";

/// Upper bound on cached responses; the oldest entry is evicted first
const MAX_CACHE_ENTRIES: usize = 512;

/// Upper bound on live proxy identities; the least recently used is dropped
/// together with its cookies and verification state
const MAX_PROXY_CLIENTS: usize = 16;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Used when a request does not name its own proxy
    pub proxy: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
    pub cache_ttl: Duration,
    /// Total body bytes the response cache may hold
    pub cache_max_bytes: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(6 * 3600),
            cache_max_bytes: 64 * 1024 * 1024,
        }
    }
}

/// A fetched page or image
#[derive(Debug, Clone)]
pub struct Page {
    /// URL after redirects
    pub url: String,
    pub status: StatusCode,
    pub body: Arc<Vec<u8>>,
}

impl Page {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

struct CachedPage {
    page: Page,
    stored_at: Instant,
}

/// (url, proxy)
type CacheKey = (String, String);

#[derive(Default)]
struct PageCache {
    entries: HashMap<CacheKey, CachedPage>,
    bytes: usize,
}

impl PageCache {
    fn remove(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.bytes -= entry.page.body.len();
        }
    }

    fn evict_oldest(&mut self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.stored_at)
            .map(|(k, _)| k.clone());
        match oldest {
            Some(key) => {
                self.remove(&key);
                true
            }
            None => false,
        }
    }
}

struct ProxyClient {
    client: Client,
    jar: Arc<Jar>,
    /// Sites whose age gate was passed with this client's cookies
    verified: Mutex<HashSet<String>>,
}

struct ClientSlot {
    client: Arc<ProxyClient>,
    last_used: Instant,
}

pub struct HttpSession {
    options: SessionOptions,
    clients: Mutex<HashMap<String, ClientSlot>>,
    cache: Mutex<PageCache>,
}

impl HttpSession {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            clients: Mutex::new(HashMap::new()),
            cache: Mutex::new(PageCache::default()),
        }
    }

    /// The proxy a request actually goes through: its own, else the session default
    pub fn effective_proxy(&self, proxy: Option<&str>) -> Option<String> {
        proxy
            .or(self.options.proxy.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
    }

    fn proxy_key(&self, proxy: Option<&str>) -> String {
        self.effective_proxy(proxy).unwrap_or_default()
    }

    async fn client(&self, proxy: Option<&str>) -> Result<Arc<ProxyClient>> {
        let key = self.proxy_key(proxy);
        let mut clients = self.clients.lock().await;
        if let Some(slot) = clients.get_mut(&key) {
            slot.last_used = Instant::now();
            return Ok(slot.client.clone());
        }

        let jar = Arc::new(Jar::default());
        let mut builder = Client::builder()
            .cookie_provider(jar.clone())
            .user_agent(self.options.user_agent.as_str())
            .timeout(self.options.timeout)
            .redirect(reqwest::redirect::Policy::limited(10));
        if !key.is_empty() {
            builder = builder
                .proxy(reqwest::Proxy::all(&key).with_context(|| format!("Invalid proxy '{}'", key))?);
        }

        let entry = Arc::new(ProxyClient {
            client: builder.build().context("Failed to build HTTP client")?,
            jar,
            verified: Mutex::new(HashSet::new()),
        });

        if clients.len() >= MAX_PROXY_CLIENTS {
            let idle = clients
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| k.clone());
            if let Some(idle) = idle {
                tracing::debug!("Dropping idle HTTP client for proxy '{}'", idle);
                clients.remove(&idle);
            }
        }

        tracing::debug!("Created HTTP client for proxy '{}'", key);
        clients.insert(
            key,
            ClientSlot {
                client: entry.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(entry)
    }

    /// GET with the response cache. Only successful responses are cached.
    pub async fn get(&self, url: &str, proxy: Option<&str>) -> Result<Page> {
        let cache_key = (url.to_string(), self.proxy_key(proxy));
        if let Some(page) = self.cached(&cache_key).await {
            tracing::debug!("HTTP cache hit: {}", url);
            return Ok(page);
        }

        let page = self.get_uncached(url, proxy).await?;
        if page.is_success() {
            self.store(cache_key, page.clone()).await;
        }
        Ok(page)
    }

    pub async fn get_uncached(&self, url: &str, proxy: Option<&str>) -> Result<Page> {
        let client = self.client(proxy).await?;
        tracing::debug!("GET {}", url);

        let response = client
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;

        let status = response.status();
        let final_url = response.url().to_string();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of {}", url))?;

        Ok(Page {
            url: final_url,
            status,
            body: Arc::new(body.to_vec()),
        })
    }

    /// Add a cookie ("name=value; Domain=...") to the jar used with `proxy`
    pub async fn set_cookie(&self, url: &str, cookie: &str, proxy: Option<&str>) -> Result<()> {
        let parsed = Url::parse(url).with_context(|| format!("Invalid cookie URL {}", url))?;
        let client = self.client(proxy).await?;
        client.jar.add_cookie_str(cookie, &parsed);
        Ok(())
    }

    /// Whether `site` passed its age gate through this proxy identity.
    /// Switching proxies means verifying again.
    pub async fn is_verified(&self, site: &str, proxy: Option<&str>) -> bool {
        let key = self.proxy_key(proxy);
        let client = self
            .clients
            .lock()
            .await
            .get(&key)
            .map(|slot| slot.client.clone());
        match client {
            Some(client) => client.verified.lock().await.contains(site),
            None => false,
        }
    }

    pub async fn mark_verified(&self, site: &str, proxy: Option<&str>) {
        match self.client(proxy).await {
            Ok(client) => {
                client.verified.lock().await.insert(site.to_string());
            }
            Err(e) => tracing::warn!("Cannot record {} verification: {:#}", site, e),
        }
    }

    async fn cached(&self, key: &CacheKey) -> Option<Page> {
        let cache = self.cache.lock().await;
        cache
            .entries
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.options.cache_ttl)
            .map(|entry| entry.page.clone())
    }

    /// Insert a response, evicting the oldest entries to stay within both the
    /// entry and byte limits. Bodies over a quarter of the byte limit are not cached.
    async fn store(&self, key: CacheKey, page: Page) {
        let size = page.body.len();
        let max_bytes = self.options.cache_max_bytes;
        if size > max_bytes / 4 {
            tracing::debug!("Not caching {} ({} bytes)", page.url, size);
            return;
        }

        let mut cache = self.cache.lock().await;
        cache.remove(&key);
        while cache.entries.len() >= MAX_CACHE_ENTRIES || cache.bytes + size > max_bytes {
            if !cache.evict_oldest() {
                break;
            }
        }
        cache.bytes += size;
        cache.entries.insert(
            key,
            CachedPage {
                page,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop expired cache entries, returning how many were removed
    pub async fn sweep_expired(&self) -> usize {
        let ttl = self.options.cache_ttl;
        let mut cache = self.cache.lock().await;
        let expired: Vec<CacheKey> = cache
            .entries
            .iter()
            .filter(|(_, entry)| entry.stored_at.elapsed() >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            cache.remove(key);
        }
        expired.len()
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.entries.len()
    }

    pub async fn cache_bytes(&self) -> usize {
        self.cache.lock().await.bytes
    }

    /// Image fetcher bound to one proxy choice
    pub fn fetcher(&self, proxy: Option<&str>) -> SessionFetcher<'_> {
        SessionFetcher {
            session: self,
            proxy: proxy.map(str::to_string),
        }
    }
}

/// Fetches URLs through the session and local paths from disk
pub struct SessionFetcher<'a> {
    session: &'a HttpSession,
    proxy: Option<String>,
}

#[async_trait]
impl ImageFetcher for SessionFetcher<'_> {
    async fn fetch(&self, reference: &ImageRef) -> Option<Vec<u8>> {
        match reference {
            ImageRef::Path(path) => read_file(path).await,
            ImageRef::Url(url) => match self.session.get(url, self.proxy.as_deref()).await {
                Ok(page) if page.is_success() => Some(page.body.as_ref().clone()),
                Ok(page) => {
                    tracing::debug!("Image request {} returned {}", url, page.status);
                    None
                }
                Err(e) => {
                    tracing::debug!("Image request {} failed: {:#}", url, e);
                    None
                }
            },
        }
    }
}
