// Image role classification
// Decides which scraped image is the portrait poster (and how to crop it),
// which is the wide landscape cover, and which gallery stills become fanart.
// Sources rarely tag their images, so the decision leans on aspect ratios
// and perceptual hashes. Every fetch or decode failure counts as "absent";
// classification always finishes with a best-effort answer.

use image::{DynamicImage, GenericImageView};
use std::sync::Arc;

use super::image_ops::{
    aspect_ratio, crop_anchor, hash_distance, HashKind, ImageFetcher, ImageLoader,
};
use crate::models::{CropMode, ImageRef};

/// Two images whose width/height ratios differ by more are not crops of one another
const ASPECT_TOLERANCE: f64 = 0.1;
/// dhash distance at or below which two images are the same picture
const DHASH_ACCEPT: u32 = 6;
/// dhash distance at or above which two images are different pictures
const DHASH_REJECT: u32 = 14;
/// Borderline dhash results pass when dhash + phash stays below this
const BORDERLINE_SUM: u32 = 20;
/// Max ahash/phash distance between a poster crop and the small image
const ANCHOR_THRESHOLD: u32 = 10;
/// Anchors are tried in this order; the first match wins
const ANCHOR_ORDER: [CropMode; 3] = [CropMode::Right, CropMode::Left, CropMode::Center];

/// Image evidence scraped from one detail page, plus per-label overrides
#[derive(Debug, Clone, Default)]
pub struct ClassifierInput {
    /// Low resolution thumbnail ("ps")
    pub small: Option<ImageRef>,
    /// High resolution cover ("pl")
    pub large: Option<ImageRef>,
    /// Sample stills in page order
    pub gallery: Vec<ImageRef>,
    /// Thumbnail already seen in search results; stands in for `small`
    pub prior_small_cache: Option<ImageRef>,
    pub crop_override: Option<CropMode>,
    pub force_small_as_poster: bool,
    pub max_fanart: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub poster: Option<ImageRef>,
    pub poster_crop: Option<CropMode>,
    pub landscape: Option<ImageRef>,
    pub fanart: Vec<ImageRef>,
}

type Opened = (ImageRef, Arc<DynamicImage>);

pub struct ImageClassifier {
    placeholders: Vec<Arc<DynamicImage>>,
}

impl ImageClassifier {
    pub fn new(placeholders: Vec<Arc<DynamicImage>>) -> Self {
        Self { placeholders }
    }

    pub fn placeholder_count(&self) -> usize {
        self.placeholders.len()
    }

    /// Classify one record's images. One-shot: each reference is opened at most once.
    pub async fn classify(
        &self,
        input: &ClassifierInput,
        fetcher: &dyn ImageFetcher,
    ) -> Classification {
        let mut loader = ImageLoader::new(fetcher);

        let mut small: Option<Opened> = None;
        for candidate in [input.small.as_ref(), input.prior_small_cache.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Some(image) = loader.open(candidate).await {
                small = Some((candidate.clone(), image));
                break;
            }
        }

        let large: Option<Opened> = match &input.large {
            Some(reference) => loader
                .open(reference)
                .await
                .map(|image| (reference.clone(), image)),
            None => None,
        };

        let landscape = match &large {
            Some((reference, image)) if self.is_placeholder(image) => {
                tracing::debug!("Large image is a placeholder, no landscape: {}", reference);
                None
            }
            Some((reference, _)) => Some(reference.clone()),
            None => None,
        };

        let (poster, poster_crop) = self
            .decide_poster(input, small.as_ref(), large.as_ref(), &mut loader)
            .await;

        let mut fanart = Vec::new();
        for reference in &input.gallery {
            if fanart.len() >= input.max_fanart {
                break;
            }
            if poster.as_ref() == Some(reference)
                || landscape.as_ref() == Some(reference)
                || fanart.contains(reference)
            {
                continue;
            }
            match loader.open(reference).await {
                Some(image) if !self.is_placeholder(&image) => fanart.push(reference.clone()),
                Some(_) => tracing::debug!("Skipping placeholder still: {}", reference),
                None => {}
            }
        }

        Classification {
            poster,
            poster_crop,
            landscape,
            fanart,
        }
    }

    async fn decide_poster(
        &self,
        input: &ClassifierInput,
        small: Option<&Opened>,
        large: Option<&Opened>,
        loader: &mut ImageLoader<'_>,
    ) -> (Option<ImageRef>, Option<CropMode>) {
        // 1. Labels known to ship a clean poster as the thumbnail
        if input.force_small_as_poster {
            if let Some((reference, _)) = small {
                return (Some(reference.clone()), None);
            }
        }

        // 2. User-chosen crop for this label
        if let (Some(mode), Some((reference, _))) = (input.crop_override, large) {
            return (Some(reference.clone()), Some(mode));
        }

        if let (Some((_, small_image)), Some((large_ref, large_image))) = (small, large) {
            // 3. Large is simply a higher resolution copy of small
            let (s, l) = (small_image.clone(), large_image.clone());
            if run_blocking(move || is_hq_poster(&s, &l)).await.unwrap_or(false) {
                return (Some(large_ref.clone()), None);
            }

            // 4. Small is a crop of large at one of the anchors
            let (s, l) = (small_image.clone(), large_image.clone());
            if let Some(anchor) = run_blocking(move || matching_anchor(&s, &l)).await.flatten() {
                return (Some(large_ref.clone()), Some(anchor));
            }
        }

        // 5. A sample still may be the high resolution poster
        if let Some((_, small_image)) = small {
            let mut probes: Vec<&ImageRef> = input.gallery.iter().take(1).collect();
            if let Some(last) = input.gallery.last() {
                if !probes.contains(&last) {
                    probes.push(last);
                }
            }

            for reference in probes {
                let Some(still) = loader.open(reference).await else {
                    continue;
                };
                let s = small_image.clone();
                if run_blocking(move || is_hq_poster(&s, &still)).await.unwrap_or(false) {
                    return (Some(reference.clone()), None);
                }
            }
        }

        // 6. Nothing better found
        (small.map(|(reference, _)| reference.clone()), None)
    }

    fn is_placeholder(&self, image: &DynamicImage) -> bool {
        self.placeholders
            .iter()
            .any(|placeholder| visually_similar(placeholder, image))
    }
}

async fn run_blocking<T, F>(f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.ok()
}

/// Same picture regardless of resolution: close aspect ratio and close dhash,
/// with a phash tie-break for borderline dhash distances.
pub fn visually_similar(a: &DynamicImage, b: &DynamicImage) -> bool {
    if (aspect_ratio(a) - aspect_ratio(b)).abs() > ASPECT_TOLERANCE {
        return false;
    }

    similar_by_distances(hash_distance(a, b, HashKind::Difference), || {
        hash_distance(a, b, HashKind::Perceptual)
    })
}

/// phash is only computed for borderline dhash distances
fn similar_by_distances(dhash: u32, phash: impl FnOnce() -> u32) -> bool {
    if dhash >= DHASH_REJECT {
        return false;
    }
    if dhash <= DHASH_ACCEPT {
        return true;
    }
    dhash + phash() < BORDERLINE_SUM
}

/// Whether `large` is a clean higher resolution version of `small`.
/// A "small" bigger than "large" in either axis means the site swapped the
/// meanings, and the pair is not comparable.
pub fn is_hq_poster(small: &DynamicImage, large: &DynamicImage) -> bool {
    let (sw, sh) = small.dimensions();
    let (lw, lh) = large.dimensions();
    if sw > lw || sh > lh {
        return false;
    }
    visually_similar(small, large)
}

/// Find the anchor at which a poster-shaped crop of `large` matches `small`.
/// ahash first over every anchor, then phash, since the two families miss
/// different kinds of cover art.
pub fn matching_anchor(small: &DynamicImage, large: &DynamicImage) -> Option<CropMode> {
    let crops: Vec<(CropMode, DynamicImage)> = ANCHOR_ORDER
        .iter()
        .map(|&anchor| (anchor, crop_anchor(large, anchor)))
        .collect();

    anchor_by_distances(|kind, anchor| {
        crops
            .iter()
            .find(|(a, _)| *a == anchor)
            .map_or(u32::MAX, |(_, crop)| hash_distance(crop, small, kind))
    })
}

fn anchor_by_distances(mut distance: impl FnMut(HashKind, CropMode) -> u32) -> Option<CropMode> {
    for kind in [HashKind::Average, HashKind::Perceptual] {
        for anchor in ANCHOR_ORDER {
            if distance(kind, anchor) <= ANCHOR_THRESHOLD {
                return Some(anchor);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::image_ops::testing::{png, zoned_cover, MemoryFetcher};
    use image::imageops::FilterType;

    const SMALL: &str = "https://img.example/abc012ps.png";
    const LARGE: &str = "https://img.example/abc012pl.png";

    fn r(url: &str) -> ImageRef {
        ImageRef::parse(url)
    }

    fn input(small: Option<&str>, large: Option<&str>) -> ClassifierInput {
        ClassifierInput {
            small: small.map(r),
            large: large.map(r),
            max_fanart: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_identical_small_and_large_uses_large_uncropped() {
        let bytes = png(&zoned_cover());
        let fetcher = MemoryFetcher::default()
            .with(SMALL, bytes.clone())
            .with(LARGE, bytes);

        let result = ImageClassifier::new(Vec::new())
            .classify(&input(Some(SMALL), Some(LARGE)), &fetcher)
            .await;

        assert_eq!(result.poster, Some(r(LARGE)));
        assert_eq!(result.poster_crop, None);
        assert_eq!(result.landscape, Some(r(LARGE)));
        assert!(result.fanart.is_empty());
    }

    #[tokio::test]
    async fn test_right_anchored_crop_detected() {
        let cover = zoned_cover();
        let small = crop_anchor(&cover, CropMode::Right);
        let fetcher = MemoryFetcher::default()
            .with(SMALL, png(&small))
            .with(LARGE, png(&cover));

        let result = ImageClassifier::new(Vec::new())
            .classify(&input(Some(SMALL), Some(LARGE)), &fetcher)
            .await;

        assert_eq!(result.poster, Some(r(LARGE)));
        assert_eq!(result.poster_crop, Some(CropMode::Right));
        assert_eq!(result.landscape, Some(r(LARGE)));
    }

    #[tokio::test]
    async fn test_center_anchored_crop_detected() {
        let cover = zoned_cover();
        let small = crop_anchor(&cover, CropMode::Center);
        let fetcher = MemoryFetcher::default()
            .with(SMALL, png(&small))
            .with(LARGE, png(&cover));

        let result = ImageClassifier::new(Vec::new())
            .classify(&input(Some(SMALL), Some(LARGE)), &fetcher)
            .await;

        assert_eq!(result.poster, Some(r(LARGE)));
        assert_eq!(result.poster_crop, Some(CropMode::Center));
    }

    #[tokio::test]
    async fn test_everything_undecodable_yields_empty_result() {
        let fetcher = MemoryFetcher::default()
            .with(SMALL, b"garbage".to_vec())
            .with("https://img.example/1.jpg", b"\xff\xd8broken".to_vec());

        let mut request = input(Some(SMALL), Some(LARGE));
        request.gallery = vec![r("https://img.example/1.jpg"), r("https://img.example/2.jpg")];
        request.prior_small_cache = Some(r("https://img.example/thumb.jpg"));

        let result = ImageClassifier::new(Vec::new())
            .classify(&request, &fetcher)
            .await;

        assert_eq!(result, Classification::default());
    }

    #[tokio::test]
    async fn test_force_small_wins_over_every_other_rule() {
        let bytes = png(&zoned_cover());
        let fetcher = MemoryFetcher::default()
            .with(SMALL, bytes.clone())
            .with(LARGE, bytes);

        let mut request = input(Some(SMALL), Some(LARGE));
        request.force_small_as_poster = true;
        request.crop_override = Some(CropMode::Left);

        let result = ImageClassifier::new(Vec::new())
            .classify(&request, &fetcher)
            .await;

        assert_eq!(result.poster, Some(r(SMALL)));
        assert_eq!(result.poster_crop, None);
        assert_eq!(result.landscape, Some(r(LARGE)));
    }

    #[tokio::test]
    async fn test_crop_override_wins_over_hash_match() {
        // Identical images would be accepted by step 3 without a crop
        let bytes = png(&zoned_cover());
        let fetcher = MemoryFetcher::default()
            .with(SMALL, bytes.clone())
            .with(LARGE, bytes);

        let mut request = input(Some(SMALL), Some(LARGE));
        request.crop_override = Some(CropMode::Left);

        let result = ImageClassifier::new(Vec::new())
            .classify(&request, &fetcher)
            .await;

        assert_eq!(result.poster, Some(r(LARGE)));
        assert_eq!(result.poster_crop, Some(CropMode::Left));
    }

    #[tokio::test]
    async fn test_prior_small_cache_stands_in_for_missing_small() {
        let cover = zoned_cover();
        let thumb = "https://img.example/search-thumb.png";
        let fetcher = MemoryFetcher::default()
            .with(thumb, png(&crop_anchor(&cover, CropMode::Right)))
            .with(LARGE, png(&cover));

        let mut request = input(None, Some(LARGE));
        request.prior_small_cache = Some(r(thumb));

        let result = ImageClassifier::new(Vec::new())
            .classify(&request, &fetcher)
            .await;

        assert_eq!(result.poster, Some(r(LARGE)));
        assert_eq!(result.poster_crop, Some(CropMode::Right));
    }

    #[tokio::test]
    async fn test_landscape_only_without_small_has_no_poster() {
        let fetcher = MemoryFetcher::default().with(LARGE, png(&zoned_cover()));

        let result = ImageClassifier::new(Vec::new())
            .classify(&input(None, Some(LARGE)), &fetcher)
            .await;

        assert_eq!(result.poster, None);
        assert_eq!(result.poster_crop, None);
        assert_eq!(result.landscape, Some(r(LARGE)));
    }

    #[tokio::test]
    async fn test_gallery_still_promoted_to_poster() {
        let poster = crop_anchor(&zoned_cover(), CropMode::Center);
        let poster_hq = poster.resize_exact(702, 1000, FilterType::Nearest);
        let other = image::DynamicImage::new_rgb8(640, 480);

        let first = "https://img.example/sample-1.png";
        let last = "https://img.example/sample-2.png";
        let fetcher = MemoryFetcher::default()
            .with(SMALL, png(&poster))
            .with(first, png(&poster_hq))
            .with(last, png(&other));

        let mut request = input(Some(SMALL), None);
        request.gallery = vec![r(first), r(last)];

        let result = ImageClassifier::new(Vec::new())
            .classify(&request, &fetcher)
            .await;

        assert_eq!(result.poster, Some(r(first)));
        assert_eq!(result.poster_crop, None);
        assert_eq!(result.landscape, None);
        assert_eq!(result.fanart, vec![r(last)]);
    }

    #[tokio::test]
    async fn test_placeholder_cover_is_not_a_landscape() {
        let cover = zoned_cover();
        let fetcher = MemoryFetcher::default().with(LARGE, png(&cover));

        let classifier = ImageClassifier::new(vec![Arc::new(cover)]);
        let result = classifier
            .classify(&input(None, Some(LARGE)), &fetcher)
            .await;

        assert_eq!(result.landscape, None);
        assert_eq!(result.poster, None);
    }

    #[tokio::test]
    async fn test_fanart_keeps_order_and_limit() {
        let still = png(&image::DynamicImage::new_rgb8(64, 48));
        let urls = [
            "https://img.example/s1.png",
            "https://img.example/s2.png",
            "https://img.example/s3.png",
        ];
        let fetcher = urls
            .iter()
            .fold(MemoryFetcher::default(), |f, url| f.with(url, still.clone()));

        let mut request = input(None, None);
        request.gallery = urls.iter().map(|u| r(u)).collect();
        request.max_fanart = 2;

        let result = ImageClassifier::new(Vec::new())
            .classify(&request, &fetcher)
            .await;

        assert_eq!(result.fanart, vec![r(urls[0]), r(urls[1])]);
        // The third still is never opened once the limit is reached
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_each_reference_fetched_once() {
        let bytes = png(&zoned_cover());
        let fetcher = MemoryFetcher::default()
            .with(SMALL, bytes.clone())
            .with(LARGE, bytes);

        let mut request = input(Some(SMALL), Some(LARGE));
        request.gallery = vec![r(LARGE), r(SMALL)];

        ImageClassifier::new(Vec::new())
            .classify(&request, &fetcher)
            .await;

        assert_eq!(fetcher.calls(), 2);
    }

    #[test]
    fn test_is_hq_poster_requires_small_not_bigger() {
        let poster = crop_anchor(&zoned_cover(), CropMode::Center);
        let bigger = poster.resize_exact(702, 1000, FilterType::Nearest);
        assert!(is_hq_poster(&poster, &bigger));
        assert!(!is_hq_poster(&bigger, &poster));
    }

    #[test]
    fn test_visually_similar_rejects_aspect_mismatch() {
        let cover = zoned_cover();
        let poster = crop_anchor(&cover, CropMode::Center);
        assert!(!visually_similar(&cover, &poster));
    }

    #[test]
    fn test_dhash_bands() {
        let no_phash = || -> u32 { panic!("phash computed outside the borderline band") };
        assert!(similar_by_distances(0, no_phash));
        assert!(similar_by_distances(6, no_phash));
        assert!(!similar_by_distances(14, no_phash));
        assert!(!similar_by_distances(30, no_phash));
    }

    #[test]
    fn test_borderline_dhash_settled_by_phash_sum() {
        assert!(similar_by_distances(7, || 12));
        assert!(!similar_by_distances(7, || 13));
        assert!(similar_by_distances(13, || 6));
        assert!(!similar_by_distances(13, || 7));
    }

    #[test]
    fn test_anchor_falls_back_to_phash() {
        let found = anchor_by_distances(|kind, anchor| match (kind, anchor) {
            (HashKind::Perceptual, CropMode::Left) => 10,
            _ => 11,
        });
        assert_eq!(found, Some(CropMode::Left));
    }

    #[test]
    fn test_ahash_match_beats_earlier_phash_anchor() {
        let found = anchor_by_distances(|kind, anchor| match (kind, anchor) {
            (HashKind::Average, CropMode::Center) => 4,
            (HashKind::Perceptual, CropMode::Right) => 0,
            _ => 30,
        });
        assert_eq!(found, Some(CropMode::Center));
        assert_eq!(anchor_by_distances(|_, _| 0), Some(CropMode::Right));
        assert_eq!(anchor_by_distances(|_, _| 11), None);
    }

    #[tokio::test]
    async fn test_crop_anchor_wins_over_gallery_still() {
        let cover = zoned_cover();
        let small = crop_anchor(&cover, CropMode::Right);
        let still_hq = small.resize_exact(702, 1000, FilterType::Nearest);

        let still = "https://img.example/sample-1.png";
        let fetcher = MemoryFetcher::default()
            .with(SMALL, png(&small))
            .with(LARGE, png(&cover))
            .with(still, png(&still_hq));

        let mut request = input(Some(SMALL), Some(LARGE));
        request.gallery = vec![r(still)];

        let result = ImageClassifier::new(Vec::new())
            .classify(&request, &fetcher)
            .await;

        assert_eq!(result.poster, Some(r(LARGE)));
        assert_eq!(result.poster_crop, Some(CropMode::Right));
        assert_eq!(result.fanart, vec![r(still)]);
    }
}
