// Image persistence gateway
// Turns a classified image reference into something a frontend can load:
// either a templated relay URL (proxy backend) or a transcoded file in the
// local image store addressed by product code and role.

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;

use super::image_ops::{crop_anchor, ImageFetcher};
use crate::models::{
    BackendKind, CanonicalIdentifier, CropMode, DeliveryReference, ImageRef, ImageSlot,
    PersistedImage, StorageKey, StoredFormat,
};

/// Builds delivery URLs for an external image relay
pub trait ImageProxy: Send + Sync {
    fn delivery_url(&self, source_url: &str, crop: Option<CropMode>, proxy: Option<&str>) -> String;
}

/// Used when no relay is configured: the source URL is delivered as-is
pub struct NullImageProxy;

impl ImageProxy for NullImageProxy {
    fn delivery_url(&self, source_url: &str, _crop: Option<CropMode>, _proxy: Option<&str>) -> String {
        source_url.to_string()
    }
}

/// Relay addressed by a URL template with `{url}`, `{crop}` and `{proxy}`
/// placeholders, e.g. `https://relay.example/i?u={url}&c={crop}`
pub struct TemplateImageProxy {
    template: String,
}

impl TemplateImageProxy {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl ImageProxy for TemplateImageProxy {
    fn delivery_url(&self, source_url: &str, crop: Option<CropMode>, proxy: Option<&str>) -> String {
        self.template
            .replace("{url}", &urlencoding::encode(source_url))
            .replace("{crop}", crop.map(|c| c.as_str()).unwrap_or(""))
            .replace("{proxy}", &urlencoding::encode(proxy.unwrap_or("")))
    }
}

/// Pick the relay implementation from configuration
pub fn image_proxy_from_template(template: Option<&str>) -> Arc<dyn ImageProxy> {
    match template.map(str::trim).filter(|t| !t.is_empty()) {
        Some(template) => Arc::new(TemplateImageProxy::new(template)),
        None => Arc::new(NullImageProxy),
    }
}

/// Files on disk under `{root}/{segment}/{bucket}/{LABEL}/{code}_{role}[_{i}].{ext}`
pub struct LocalStore {
    root: PathBuf,
    segment: String,
    force_refresh: bool,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, segment: impl Into<String>, force_refresh: bool) -> Self {
        Self {
            root: root.into(),
            segment: segment.into(),
            force_refresh,
        }
    }

    /// Relative path without extension, '/' separated
    pub fn relative_stem(&self, identifier: &CanonicalIdentifier, slot: ImageSlot) -> String {
        let label = sanitize_component(&identifier.label.to_uppercase());
        let index = slot.index().map(|i| format!("_{}", i)).unwrap_or_default();

        format!(
            "{}/{}/{}/{}_{}{}",
            self.segment,
            bucket(&label),
            label,
            sanitize_component(&identifier.storage_stem()),
            slot.role().as_str(),
            index
        )
    }

    /// A previously stored file for this stem, in any supported format
    async fn existing(&self, stem: &str) -> Option<(String, StoredFormat)> {
        for format in StoredFormat::ALL {
            let relative = format!("{}.{}", stem, format.extension());
            if fs::try_exists(self.root.join(&relative)).await.unwrap_or(false) {
                return Some((relative, format));
            }
        }
        None
    }

    async fn store(
        &self,
        fetcher: &dyn ImageFetcher,
        source: &ImageRef,
        stem: &str,
        crop: Option<CropMode>,
    ) -> Result<(String, StoredFormat)> {
        if !self.force_refresh {
            if let Some(found) = self.existing(stem).await {
                tracing::debug!("Image already stored: {}", found.0);
                return Ok(found);
            }
        }

        let bytes = fetcher
            .fetch(source)
            .await
            .with_context(|| format!("Failed to fetch {}", source))?;

        let format = resolve_format(&bytes, source)?;
        let (encoded, format) = tokio::task::spawn_blocking(move || transcode(&bytes, format, crop))
            .await
            .context("Transcode task failed")??;

        let relative = format!("{}.{}", stem, format.extension());
        let path = self.root.join(&relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&path, &encoded)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        // A refresh in a different format must not leave the old file winning the lookup
        for other in StoredFormat::ALL.into_iter().filter(|f| *f != format) {
            let stale = self.root.join(format!("{}.{}", stem, other.extension()));
            if fs::try_exists(&stale).await.unwrap_or(false) {
                if let Err(e) = fs::remove_file(&stale).await {
                    tracing::warn!("Failed to remove stale image {}: {}", stale.display(), e);
                }
            }
        }

        tracing::info!("Stored image {}", relative);
        Ok((relative, format))
    }
}

fn bucket(label: &str) -> String {
    match label.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => c.to_ascii_uppercase().to_string(),
        _ => "09".to_string(),
    }
}

fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Sniffed format first, then the source extension, then jpg
fn resolve_format(bytes: &[u8], source: &ImageRef) -> Result<StoredFormat> {
    if let Ok(sniffed) = image::guess_format(bytes) {
        return StoredFormat::from_image_format(sniffed)
            .with_context(|| format!("Unsupported image format {:?}", sniffed));
    }

    match source.extension() {
        Some(ext) => StoredFormat::from_extension(&ext)
            .with_context(|| format!("Unsupported image extension '{}'", ext)),
        None => Ok(StoredFormat::Jpg),
    }
}

fn transcode(
    bytes: &[u8],
    format: StoredFormat,
    crop: Option<CropMode>,
) -> Result<(Vec<u8>, StoredFormat)> {
    let decoded = image::load_from_memory_with_format(bytes, format.image_format())
        .context("Failed to decode image")?;

    let image = match crop {
        Some(anchor) => crop_anchor(&decoded, anchor),
        None => decoded,
    };

    match encode(&image, format.image_format()) {
        Ok(encoded) => Ok((encoded, format)),
        Err(e) => {
            tracing::debug!("Encoding as {:?} failed ({}), retrying as RGB jpg", format, e);
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            let encoded = encode(&rgb, ImageFormat::Jpeg).context("Failed to encode image")?;
            Ok((encoded, StoredFormat::Jpg))
        }
    }
}

fn encode(image: &DynamicImage, format: ImageFormat) -> image::ImageResult<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, format)?;
    Ok(out.into_inner())
}

/// What to persist and where it should end up
#[derive(Debug, Clone, Copy)]
pub struct PersistRequest<'a> {
    pub source: &'a ImageRef,
    pub slot: ImageSlot,
    pub identifier: &'a CanonicalIdentifier,
    /// Only honoured for the poster slot
    pub crop: Option<CropMode>,
    pub backend: BackendKind,
    /// Outbound proxy the relay should use when fetching the source
    pub proxy: Option<&'a str>,
}

pub struct PersistenceGateway {
    store: LocalStore,
    proxy: Arc<dyn ImageProxy>,
}

impl PersistenceGateway {
    pub fn new(store: LocalStore, proxy: Arc<dyn ImageProxy>) -> Self {
        Self { store, proxy }
    }

    /// Persist one image. Never fails: problems are logged and reported as `None`.
    pub async fn persist(
        &self,
        request: PersistRequest<'_>,
        fetcher: &dyn ImageFetcher,
    ) -> Option<PersistedImage> {
        let role = request.slot.role();
        let crop = match request.slot {
            ImageSlot::Poster => request.crop,
            _ => None,
        };
        let storage_key = StorageKey {
            ui_code: request.identifier.formatted.clone(),
            role,
            index: request.slot.index(),
        };

        let (delivery, format) = match request.backend {
            BackendKind::Proxy => {
                let Some(url) = request.source.as_url() else {
                    tracing::warn!("Cannot proxy a local image: {}", request.source);
                    return None;
                };
                let format = request
                    .source
                    .extension()
                    .and_then(|e| StoredFormat::from_extension(&e))
                    .unwrap_or(StoredFormat::Jpg);
                let delivery = self.proxy.delivery_url(url, crop, request.proxy);
                (DeliveryReference::Url(delivery), format)
            }
            BackendKind::LocalStore => {
                if request.identifier.formatted.trim().is_empty() {
                    tracing::warn!("No identifier to store {} under", request.source);
                    return None;
                }
                let stem = self.store.relative_stem(request.identifier, request.slot);
                match self.store.store(fetcher, request.source, &stem, crop).await {
                    Ok((relative, format)) => (DeliveryReference::RelativePath(relative), format),
                    Err(e) => {
                        tracing::warn!("Failed to persist {} for {}: {:#}", role.as_str(), request.identifier, e);
                        return None;
                    }
                }
            }
        };

        Some(PersistedImage {
            role,
            storage_key,
            delivery,
            format,
        })
    }
}
