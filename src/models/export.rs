// Flat record shape consumed by media-library frontends.
// Field names and the aspect tags are a compatibility surface: do not rename.

use serde::{Deserialize, Serialize};

use super::{DeliveryReference, ImageRole, MovieRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovieExport {
    pub title: String,
    pub originaltitle: String,
    pub tagline: Option<String>,
    pub plot: Option<String>,
    pub year: Option<i32>,
    /// "YYYY-MM-DD"
    pub premiered: Option<String>,
    /// Minutes
    pub runtime: Option<u32>,
    pub studio: Option<String>,
    pub director: Option<String>,
    pub genre: Vec<String>,
    pub actor: Vec<ActorExport>,
    pub ratings: Vec<RatingExport>,
    pub art: Vec<ArtExport>,
    pub trailer: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActorExport {
    pub name: String,
    pub thumb: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingExport {
    pub name: String,
    pub value: f64,
    pub max: f64,
    pub votes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtExport {
    pub aspect: ImageRole,
    pub url: String,
}

impl MovieExport {
    /// Build the export mapping. Relative paths from the local store are
    /// joined onto `image_base_url`.
    pub fn from_record(record: &MovieRecord, image_base_url: &str) -> Self {
        let base = image_base_url.trim_end_matches('/');

        let art = record
            .images
            .iter()
            .map(|image| ArtExport {
                aspect: image.role,
                url: match &image.delivery {
                    DeliveryReference::Url(url) => url.clone(),
                    DeliveryReference::RelativePath(path) => {
                        format!("{}/{}", base, path.trim_start_matches('/'))
                    }
                },
            })
            .collect();

        Self {
            title: record.title.clone(),
            originaltitle: record.originaltitle.clone(),
            tagline: record.tagline.clone(),
            plot: record.plot.clone(),
            year: record.year(),
            premiered: record
                .premiered
                .map(|d| d.format("%Y-%m-%d").to_string()),
            runtime: record.runtime,
            studio: record.studio.clone(),
            director: record.director.clone(),
            genre: record.genres.clone(),
            actor: record
                .actors
                .iter()
                .map(|a| ActorExport {
                    name: a.name.clone(),
                    thumb: a.thumb.clone(),
                })
                .collect(),
            ratings: record
                .ratings
                .iter()
                .map(|r| RatingExport {
                    name: r.name.clone(),
                    value: r.value,
                    max: r.max,
                    votes: r.votes,
                })
                .collect(),
            art,
            trailer: record.extras.first().map(|t| t.url.clone()),
        }
    }
}
