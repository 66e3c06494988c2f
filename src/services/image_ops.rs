// Image primitives shared by the classifier and the persistence gateway:
// fetching by reference, tolerant decoding, poster crop geometry and
// perceptual hashes.

use async_trait::async_trait;
use image::{DynamicImage, GenericImageView};
use image_hasher::{HashAlg, HasherConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::models::{CropMode, ImageRef};

/// Height / width of a standard DVD cover front
pub const POSTER_RATIO: f64 = 1.4225;

/// Anything that can turn an image reference into raw bytes.
/// Failures are reported as `None`; callers treat them as "image absent".
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, reference: &ImageRef) -> Option<Vec<u8>>;
}

pub async fn read_file(path: &std::path::Path) -> Option<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::debug!("Failed to read image {}: {}", path.display(), e);
            None
        }
    }
}

/// Decode on the blocking pool; corrupt or unsupported data yields `None`
pub async fn decode(bytes: Vec<u8>) -> Option<DynamicImage> {
    tokio::task::spawn_blocking(move || image::load_from_memory(&bytes).ok())
        .await
        .ok()
        .flatten()
}

/// Opens each reference at most once for the lifetime of the loader.
/// Decode failures are remembered too, so a bad URL is not retried.
pub struct ImageLoader<'a> {
    fetcher: &'a dyn ImageFetcher,
    opened: HashMap<ImageRef, Option<Arc<DynamicImage>>>,
}

impl<'a> ImageLoader<'a> {
    pub fn new(fetcher: &'a dyn ImageFetcher) -> Self {
        Self {
            fetcher,
            opened: HashMap::new(),
        }
    }

    pub async fn open(&mut self, reference: &ImageRef) -> Option<Arc<DynamicImage>> {
        if let Some(cached) = self.opened.get(reference) {
            return cached.clone();
        }

        let image = match self.fetcher.fetch(reference).await {
            Some(bytes) => decode(bytes).await.map(Arc::new),
            None => None,
        };

        if image.is_none() {
            tracing::debug!("Image unavailable, treating as absent: {}", reference);
        }

        self.opened.insert(reference.clone(), image.clone());
        image
    }
}

/// Load placeholder reference images ("now printing" covers) from disk
pub async fn load_placeholders(paths: &[PathBuf]) -> Vec<Arc<DynamicImage>> {
    let mut images = Vec::new();
    for path in paths {
        let Some(bytes) = read_file(path).await else {
            tracing::warn!("Placeholder image not readable: {}", path.display());
            continue;
        };
        match decode(bytes).await {
            Some(image) => images.push(Arc::new(image)),
            None => tracing::warn!("Placeholder image not decodable: {}", path.display()),
        }
    }
    images
}

pub fn aspect_ratio(image: &DynamicImage) -> f64 {
    let (w, h) = image.dimensions();
    if h == 0 {
        return 0.0;
    }
    w as f64 / h as f64
}

/// Width of a poster cut from an image of the given height
pub fn poster_width(height: u32) -> u32 {
    (height as f64 / POSTER_RATIO) as u32
}

/// Cut a full-height poster out of a wide image at the given anchor.
/// Images already narrower than a poster are returned whole.
pub fn crop_anchor(image: &DynamicImage, anchor: CropMode) -> DynamicImage {
    let (w, h) = image.dimensions();
    let target = poster_width(h).clamp(1, w.max(1));
    if target >= w {
        return image.clone();
    }

    let x = match anchor {
        CropMode::Left => 0,
        CropMode::Right => w - target,
        CropMode::Center => (w - target) / 2,
    };
    image.crop_imm(x, 0, target, h)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    /// dhash: gradient between neighbouring pixels
    Difference,
    /// ahash: pixel above/below the mean
    Average,
    /// phash: mean hash over the DCT low frequencies
    Perceptual,
}

/// Hamming distance between 64-bit hashes of two images
pub fn hash_distance(a: &DynamicImage, b: &DynamicImage, kind: HashKind) -> u32 {
    let config = HasherConfig::new().hash_size(8, 8);
    let hasher = match kind {
        HashKind::Difference => config.hash_alg(HashAlg::Gradient),
        HashKind::Average => config.hash_alg(HashAlg::Mean),
        HashKind::Perceptual => config.hash_alg(HashAlg::Mean).preproc_dct(),
    }
    .to_hasher();

    hasher.hash_image(a).dist(&hasher.hash_image(b))
}
