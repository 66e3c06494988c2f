// Configuration module for avmeta
// Handles XDG-compliant directory paths and TOML configuration file

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::{BackendKind, CropMode};
use crate::services::http::{SessionOptions, DEFAULT_USER_AGENT};
use crate::services::metadata::KNOWN_SITES;
use crate::services::sites::LabelPolicy;

const APP_NAME: &str = "avmeta";
const CONFIG_FILENAME: &str = "config.toml";

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Server configuration
    pub server: ServerConfig,

    /// Directory paths (overrides XDG defaults)
    pub paths: PathsConfig,

    /// Outbound HTTP session
    pub http: HttpConfig,

    /// Image classification and delivery
    pub images: ImagesConfig,

    /// Per-label overrides
    pub labels: LabelsConfig,

    /// Source sites
    pub sites: SitesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server port (default: 8097)
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    pub bind_address: String,

    /// Public base URL for stored images, e.g. "https://media.example/images".
    /// Defaults to this server's /images route.
    pub public_image_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8097,
            bind_address: "0.0.0.0".to_string(),
            public_image_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Override data directory
    pub data_dir: Option<PathBuf>,

    /// Override cache directory (local image store)
    pub cache_dir: Option<PathBuf>,

    /// Override config directory
    pub config_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Default proxy for all site traffic (http://, https:// or socks5://)
    pub proxy: Option<String>,

    /// How long fetched pages stay cached (default: 6)
    pub cache_ttl_hours: u64,

    /// Memory the response cache may use, in MiB (default: 64)
    pub cache_max_mb: usize,

    /// Per-request timeout (default: 30)
    pub timeout_secs: u64,

    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            cache_ttl_hours: 6,
            cache_max_mb: 64,
            timeout_secs: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    /// "proxy" or "local_store" (default: local_store)
    pub backend: BackendKind,

    /// Maximum fanart images per record (default: 10)
    pub max_fanart: usize,

    /// First path component inside the local store (default: "movies")
    pub segment: String,

    /// Relay URL template for the proxy backend; `{url}`, `{crop}` and
    /// `{proxy}` are substituted. Unset means images are delivered as-is.
    pub proxy_template: Option<String>,

    /// Known "now printing" covers; images matching one are discarded
    pub placeholders: Vec<PathBuf>,

    /// Re-download images even when a stored copy exists (default: false)
    pub force_refresh: bool,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::LocalStore,
            max_fanart: 10,
            segment: "movies".to_string(),
            proxy_template: None,
            placeholders: Vec::new(),
            force_refresh: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LabelsConfig {
    /// Labels whose small thumbnail is already a clean poster
    pub force_small_poster: Vec<String>,

    /// Label -> crop anchor ("left", "right", "center")
    pub crop_overrides: HashMap<String, CropMode>,

    /// Label -> label, applied after parsing a product code
    pub remap: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SitesConfig {
    /// Sites to query, in priority order
    pub enabled: Vec<String>,

    /// Site key -> base URL override (mirrors)
    pub base_urls: HashMap<String, String>,
}

impl Default for SitesConfig {
    fn default() -> Self {
        Self {
            enabled: KNOWN_SITES.iter().map(|s| s.to_string()).collect(),
            base_urls: HashMap::new(),
        }
    }
}

/// Application paths following XDG Base Directory Specification on Unix
/// On other platforms, falls back to the current directory or platform-specific locations
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory for configuration files (config.toml)
    /// XDG: $XDG_CONFIG_HOME/avmeta or ~/.config/avmeta
    pub config_dir: PathBuf,

    /// Directory for persistent data
    /// XDG: $XDG_DATA_HOME/avmeta or ~/.local/share/avmeta
    pub data_dir: PathBuf,

    /// Directory for cache files (stored images)
    /// XDG: $XDG_CACHE_HOME/avmeta or ~/.cache/avmeta
    pub cache_dir: PathBuf,
}

impl AppPaths {
    /// Create application paths using XDG directories (or fallbacks)
    ///
    /// Priority order:
    /// 1. Environment variables (AVMETA_CONFIG_DIR, AVMETA_DATA_DIR, AVMETA_CACHE_DIR)
    /// 2. Config file overrides
    /// 3. XDG directories (Linux/Unix)
    /// 4. Platform-specific directories (macOS, Windows)
    /// 5. Current directory fallback
    pub fn new(config_overrides: &PathsConfig) -> Self {
        Self {
            config_dir: Self::resolve(
                "AVMETA_CONFIG_DIR",
                &config_overrides.config_dir,
                dirs::config_dir(),
                None,
            ),
            data_dir: Self::resolve(
                "AVMETA_DATA_DIR",
                &config_overrides.data_dir,
                dirs::data_dir(),
                None,
            ),
            cache_dir: Self::resolve(
                "AVMETA_CACHE_DIR",
                &config_overrides.cache_dir,
                dirs::cache_dir(),
                Some("cache"),
            ),
        }
    }

    /// Create application paths using current directory (portable mode)
    pub fn current_dir() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            config_dir: cwd.clone(),
            data_dir: cwd.clone(),
            cache_dir: cwd.join("cache"),
        }
    }

    fn resolve(
        env_var: &str,
        config_override: &Option<PathBuf>,
        platform_dir: Option<PathBuf>,
        cwd_subdir: Option<&str>,
    ) -> PathBuf {
        // 1. Check environment variable
        if let Ok(path) = std::env::var(env_var) {
            return PathBuf::from(path);
        }

        // 2. Check config file override
        if let Some(ref path) = config_override {
            return path.clone();
        }

        // 3. Use XDG/platform dir
        if let Some(dir) = platform_dir {
            return dir.join(APP_NAME);
        }

        // 4. Fallback to current directory
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        match cwd_subdir {
            Some(sub) => cwd.join(sub),
            None => cwd,
        }
    }

    /// Root of the local image store
    pub fn image_store_dir(&self) -> PathBuf {
        self.cache_dir.join("images")
    }

    /// Get the config file path
    pub fn config_file_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILENAME)
    }

    /// Ensure all directories exist
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.config_dir).await?;
        tokio::fs::create_dir_all(&self.data_dir).await?;
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tokio::fs::create_dir_all(self.image_store_dir()).await?;
        Ok(())
    }

    /// Log the configured paths
    pub fn log_paths(&self) {
        tracing::info!("Configuration directory: {}", self.config_dir.display());
        tracing::info!("Data directory: {}", self.data_dir.display());
        tracing::info!("Cache directory: {}", self.cache_dir.display());
        tracing::debug!("Image store: {}", self.image_store_dir().display());
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new(&PathsConfig::default())
    }
}

/// Application configuration - combines TOML file with environment overrides
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Application paths
    pub paths: AppPaths,

    /// Server port
    pub port: u16,

    /// Bind address
    pub bind_address: String,

    /// Public base URL for stored images (optional)
    pub public_image_url: Option<String>,

    pub http: HttpConfig,

    pub images: ImagesConfig,

    pub labels: LabelsConfig,

    pub sites: SitesConfig,
}

impl AppConfig {
    /// Load configuration from TOML file and environment
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. TOML config file
    /// 3. Default values
    pub fn load() -> Self {
        // Check if we should use portable mode (current directory for everything)
        let portable_mode = env_flag("AVMETA_PORTABLE").unwrap_or(false);

        if portable_mode {
            tracing::info!("Running in portable mode (using current directory)");
            let config_file = Self::load_config_file(&AppPaths::current_dir().config_dir);
            return Self::build(config_file, AppPaths::current_dir());
        }

        // First, determine config directory to find config.toml
        let config_dir = Self::find_config_dir();

        // Try to load config file
        let config_file = Self::load_config_file(&config_dir);

        // Build final configuration with environment overrides
        let paths = AppPaths::new(&config_file.paths);
        Self::build(config_file, paths)
    }

    /// Find the config directory (for locating config.toml)
    fn find_config_dir() -> PathBuf {
        // Environment variable takes priority
        if let Ok(path) = std::env::var("AVMETA_CONFIG_DIR") {
            return PathBuf::from(path);
        }

        // Then XDG config dir
        if let Some(dir) = dirs::config_dir() {
            return dir.join(APP_NAME);
        }

        // Fallback to current directory
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    /// Load and parse the TOML config file
    fn load_config_file(config_dir: &std::path::Path) -> ConfigFile {
        let config_path = config_dir.join(CONFIG_FILENAME);

        if !config_path.exists() {
            tracing::debug!(
                "No config file found at {}, using defaults",
                config_path.display()
            );
            return ConfigFile::default();
        }

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse config file {}: {}. Using defaults.",
                        config_path.display(),
                        e
                    );
                    ConfigFile::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read config file {}: {}. Using defaults.",
                    config_path.display(),
                    e
                );
                ConfigFile::default()
            }
        }
    }

    /// Build configuration from config file with environment overrides
    fn build(config_file: ConfigFile, paths: AppPaths) -> Self {
        // Port: env > config > default
        let port = std::env::var("AVMETA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(config_file.server.port);

        // Bind address: env > config > default
        let bind_address = std::env::var("AVMETA_BIND_ADDRESS")
            .unwrap_or_else(|_| config_file.server.bind_address.clone());

        let public_image_url = std::env::var("AVMETA_PUBLIC_IMAGE_URL")
            .ok()
            .or(config_file.server.public_image_url);

        // Proxy: env > config
        let mut http = config_file.http;
        if let Ok(proxy) = std::env::var("AVMETA_PROXY") {
            http.proxy = Some(proxy);
        }

        // Image backend: env > config
        let mut images = config_file.images;
        if let Ok(value) = std::env::var("AVMETA_IMAGE_BACKEND") {
            match value.parse() {
                Ok(backend) => images.backend = backend,
                Err(e) => tracing::warn!("Ignoring AVMETA_IMAGE_BACKEND: {}", e),
            }
        }
        if let Some(force) = env_flag("AVMETA_FORCE_REFRESH") {
            images.force_refresh = force;
        }

        Self {
            paths,
            port,
            bind_address,
            public_image_url,
            http,
            images,
            labels: config_file.labels,
            sites: config_file.sites,
        }
    }

    /// Options for the shared HTTP session
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            proxy: self.http.proxy.clone().filter(|p| !p.trim().is_empty()),
            user_agent: self.http.user_agent.clone(),
            timeout: Duration::from_secs(self.http.timeout_secs.max(1)),
            cache_ttl: Duration::from_secs(self.http.cache_ttl_hours * 3600),
            cache_max_bytes: self.http.cache_max_mb * 1024 * 1024,
        }
    }

    /// Label overrides with keys normalized to uppercase
    pub fn label_policy(&self) -> LabelPolicy {
        LabelPolicy {
            force_small_poster: self
                .labels
                .force_small_poster
                .iter()
                .map(|l| l.trim().to_uppercase())
                .collect::<HashSet<_>>(),
            crop_overrides: self
                .labels
                .crop_overrides
                .iter()
                .map(|(label, mode)| (label.trim().to_uppercase(), *mode))
                .collect(),
            remap: self.labels.remap.clone(),
        }
    }

    /// Base URL that local store paths are joined onto
    pub fn image_base_url(&self) -> String {
        match &self.public_image_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let host = if self.bind_address == "0.0.0.0" {
                    "localhost"
                } else {
                    self.bind_address.as_str()
                };
                format!("http://{}:{}/images", host, self.port)
            }
        }
    }

    /// Log configuration status
    pub fn log_config(&self) {
        self.paths.log_paths();
        tracing::info!("Server listening on {}:{}", self.bind_address, self.port);
        tracing::info!("Sites: {}", self.sites.enabled.join(", "));

        match self.images.backend {
            BackendKind::LocalStore => tracing::info!(
                "Images: local store at {} (max {} fanart)",
                self.paths.image_store_dir().display(),
                self.images.max_fanart
            ),
            BackendKind::Proxy => tracing::info!(
                "Images: proxy backend ({})",
                if self.images.proxy_template.is_some() {
                    "templated relay"
                } else {
                    "direct URLs"
                }
            ),
        }

        if let Some(ref proxy) = self.http.proxy {
            tracing::info!("Outbound proxy: {}", proxy);
        }
        if self.images.force_refresh {
            tracing::info!("Image force refresh: ENABLED");
        }
        if !self.images.placeholders.is_empty() {
            tracing::debug!("Placeholder images: {}", self.images.placeholders.len());
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_dir_paths() {
        let paths = AppPaths::current_dir();
        assert!(paths.config_dir.is_absolute() || paths.config_dir == PathBuf::from("."));
        assert!(paths.cache_dir.ends_with("cache"));
        assert!(paths.image_store_dir().ends_with("cache/images"));
    }

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();
        assert_eq!(config.server.port, 8097);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.http.cache_ttl_hours, 6);
        assert_eq!(config.images.backend, BackendKind::LocalStore);
        assert_eq!(config.images.max_fanart, 10);
        assert_eq!(config.images.segment, "movies");
        assert!(!config.images.force_refresh);
        assert_eq!(config.sites.enabled, vec!["javbus", "dmm", "mgstage"]);
    }

    #[test]
    fn test_parse_config_toml() {
        let toml_str = r#"
[server]
port = 9000
bind_address = "127.0.0.1"

[http]
proxy = "socks5://127.0.0.1:1080"
cache_ttl_hours = 1

[images]
backend = "proxy"
max_fanart = 4
proxy_template = "https://relay.example/i?u={url}&c={crop}"

[labels]
force_small_poster = ["abp"]
crop_overrides = { SIRO = "center" }
remap = { TKSOE = "SOE" }

[sites]
enabled = ["dmm"]
base_urls = { dmm = "https://mirror.example" }
"#;
        let config: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.http.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
        assert_eq!(config.images.backend, BackendKind::Proxy);
        assert_eq!(config.images.max_fanart, 4);
        assert_eq!(config.labels.crop_overrides.get("SIRO"), Some(&CropMode::Center));
        assert_eq!(config.sites.enabled, vec!["dmm"]);
        assert_eq!(
            config.sites.base_urls.get("dmm").map(String::as_str),
            Some("https://mirror.example")
        );
    }

    #[test]
    fn test_partial_config_toml() {
        // Test that partial configs work (only specify what you need)
        let toml_str = r#"
[images]
force_refresh = true
"#;
        let config: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 8097); // default
        assert_eq!(config.images.max_fanart, 10); // default
        assert!(config.images.force_refresh); // from file
    }

    #[test]
    fn test_label_policy_uppercases_keys() {
        let toml_str = r#"
[labels]
force_small_poster = [" abp "]
crop_overrides = { siro = "left" }
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let config = AppConfig::build(file, AppPaths::current_dir());
        let policy = config.label_policy();
        assert!(policy.forces_small("ABP"));
        assert!(policy.forces_small("abp"));
        assert_eq!(policy.crop_for("SIRO"), Some(CropMode::Left));
    }

    #[test]
    fn test_session_options_from_config() {
        let file: ConfigFile =
            toml::from_str("[http]\ncache_ttl_hours = 2\ntimeout_secs = 5\ncache_max_mb = 8\n").unwrap();
        let config = AppConfig::build(file, AppPaths::current_dir());
        let options = config.session_options();
        assert_eq!(options.cache_ttl, Duration::from_secs(7200));
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.cache_max_bytes, 8 * 1024 * 1024);
    }
}
