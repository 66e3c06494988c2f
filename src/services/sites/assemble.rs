// Record assembly: raw detail page fields -> canonical MovieRecord.
// Runs normalization, image classification and persistence in order.

use chrono::NaiveDate;
use regex::Regex;
use std::sync::LazyLock;

use super::{InfoOptions, RawDetail, SiteContext};
use crate::models::{ImageRef, ImageSlot, MovieRecord, PersistedImage, Trailer};
use crate::services::classifier::{Classification, ClassifierInput};
use crate::services::identifier::{normalize, SiteRules};
use crate::services::persistence::PersistRequest;

static RE_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})").unwrap());
static RE_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// First YYYY-MM-DD, YYYY/MM/DD or YYYY.MM.DD date in the text
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let caps = RE_DATE.captures(text)?;
    let normalized = format!("{}-{}-{}", &caps[1], &caps[2], &caps[3]);
    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d").ok()
}

/// Minutes from text like "120分鐘" or "120min"
pub fn parse_runtime(text: &str) -> Option<u32> {
    RE_DIGITS
        .find(text)
        .and_then(|m| m.as_str().parse().ok())
        .filter(|&minutes| minutes > 0)
}

fn image_ref(value: Option<&str>) -> Option<ImageRef> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ImageRef::parse)
}

/// Many sites prefix the title with the product code
fn strip_code_prefix(title: &str, code: &str) -> String {
    let trimmed = title.trim();
    if code.is_empty() {
        return trimmed.to_string();
    }
    match trimmed.get(..code.len()) {
        Some(head) if head.eq_ignore_ascii_case(code) => trimmed[code.len()..].trim().to_string(),
        _ => trimmed.to_string(),
    }
}

pub async fn assemble_record(
    ctx: &SiteContext,
    site: &str,
    rules: &SiteRules,
    detail: RawDetail,
    options: &InfoOptions,
) -> MovieRecord {
    let code_source = detail
        .code_text
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or(&detail.external_id);
    let identifier = normalize(code_source, rules);

    let title = strip_code_prefix(&detail.title, &identifier.formatted);
    let mut record = MovieRecord {
        site: site.to_string(),
        external_id: detail.external_id.clone(),
        originaltitle: detail.originaltitle.clone().unwrap_or_else(|| title.clone()),
        title,
        tagline: detail.tagline.clone(),
        plot: detail.plot.clone(),
        studio: detail.studio.clone(),
        director: detail.director.clone(),
        premiered: detail.date_text.as_deref().and_then(parse_date),
        runtime: detail.runtime_text.as_deref().and_then(parse_runtime),
        ratings: detail.rating.clone().into_iter().collect(),
        identifier,
        ..Default::default()
    };

    for actor in detail.actors.iter().cloned() {
        record.push_actor(actor);
    }
    for genre in &detail.genres {
        record.push_genre(genre);
    }

    if options.search.translate {
        record.title = ctx.translator.translate(&record.title).await;
        if let Some(plot) = &record.plot {
            record.plot = Some(ctx.translator.translate(plot).await);
        }
    }

    let input = ClassifierInput {
        small: image_ref(detail.small.as_deref()),
        large: image_ref(detail.large.as_deref()),
        gallery: detail
            .gallery
            .iter()
            .filter_map(|g| image_ref(Some(g)))
            .collect(),
        prior_small_cache: image_ref(options.prior_small.as_deref()),
        crop_override: ctx.labels.crop_for(&record.identifier.label),
        force_small_as_poster: ctx.labels.forces_small(&record.identifier.label),
        max_fanart: options.max_fanart,
    };

    let proxy = options.search.proxy.as_deref();
    let fetcher = ctx.session.fetcher(proxy);
    let classification = ctx.classifier.classify(&input, &fetcher).await;
    record.images = persist_images(ctx, &record, &classification, options, &fetcher).await;

    if options.want_extras {
        if let Some(url) = detail.trailer.filter(|t| !t.trim().is_empty()) {
            record.extras.push(Trailer { url });
        }
    }

    tracing::debug!(
        "Assembled {} from {}: {} image(s)",
        record.identifier,
        site,
        record.images.len()
    );
    record
}

async fn persist_images(
    ctx: &SiteContext,
    record: &MovieRecord,
    classification: &Classification,
    options: &InfoOptions,
    fetcher: &crate::services::http::SessionFetcher<'_>,
) -> Vec<PersistedImage> {
    let mut jobs: Vec<(&ImageRef, ImageSlot)> = Vec::new();
    if let Some(poster) = &classification.poster {
        jobs.push((poster, ImageSlot::Poster));
    }
    if let Some(landscape) = &classification.landscape {
        jobs.push((landscape, ImageSlot::Landscape));
    }
    for (i, still) in classification.fanart.iter().enumerate() {
        jobs.push((still, ImageSlot::Fanart(i + 1)));
    }

    let mut images = Vec::with_capacity(jobs.len());
    for (source, slot) in jobs {
        let request = PersistRequest {
            source,
            slot,
            identifier: &record.identifier,
            crop: classification.poster_crop,
            backend: options.search.image_mode,
            proxy: options.search.proxy.as_deref(),
        };
        match ctx.gateway.persist(request, fetcher).await {
            Some(image) => images.push(image),
            None => tracing::debug!("No {:?} image for {}", slot, record.identifier),
        }
    }
    images
}
