use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub mod export;

/// Canonical product code ("ui_code") naming one release.
///
/// `number` is `None` for pass-through identifiers, in which case `label`
/// holds the whole cleaned text and `formatted` is its uppercase form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalIdentifier {
    pub label: String,
    pub number: Option<u64>,
    pub suffix: Option<String>,
    pub formatted: String,
}

impl CanonicalIdentifier {
    pub fn is_pass_through(&self) -> bool {
        self.number.is_none()
    }

    /// Lowercase form used in storage file names
    pub fn storage_stem(&self) -> String {
        self.formatted.to_lowercase()
    }
}

impl fmt::Display for CanonicalIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted)
    }
}

/// Reference to an image: either a remote URL or a file on disk
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageRef {
    Url(String),
    Path(PathBuf),
}

impl ImageRef {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            ImageRef::Url(trimmed.to_string())
        } else if let Some(rest) = trimmed.strip_prefix("//") {
            // Protocol-relative links show up on several catalog pages
            ImageRef::Url(format!("https://{}", rest))
        } else {
            ImageRef::Path(PathBuf::from(trimmed))
        }
    }

    pub fn as_url(&self) -> Option<&str> {
        match self {
            ImageRef::Url(url) => Some(url),
            ImageRef::Path(_) => None,
        }
    }

    /// Lowercase file extension, ignoring any query string
    pub fn extension(&self) -> Option<String> {
        let name = match self {
            ImageRef::Url(url) => {
                let without_query = url.split(['?', '#']).next().unwrap_or(url);
                without_query.rsplit('/').next().unwrap_or(without_query).to_string()
            }
            ImageRef::Path(path) => path.file_name()?.to_string_lossy().to_string(),
        };
        Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::Url(url) => write!(f, "{}", url),
            ImageRef::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Horizontal anchor from which a portrait poster is cut out of a wide cover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropMode {
    Left,
    Right,
    Center,
}

impl CropMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CropMode::Left => "left",
            CropMode::Right => "right",
            CropMode::Center => "center",
        }
    }
}

impl FromStr for CropMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "l" | "left" => Ok(CropMode::Left),
            "r" | "right" => Ok(CropMode::Right),
            "c" | "center" | "centre" => Ok(CropMode::Center),
            other => Err(format!("unknown crop mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageRole {
    Poster,
    Landscape,
    Fanart,
}

impl ImageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageRole::Poster => "poster",
            ImageRole::Landscape => "landscape",
            ImageRole::Fanart => "fanart",
        }
    }
}

/// Role plus position; fanart slots are numbered from 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageSlot {
    Poster,
    Landscape,
    Fanart(usize),
}

impl ImageSlot {
    pub fn role(&self) -> ImageRole {
        match self {
            ImageSlot::Poster => ImageRole::Poster,
            ImageSlot::Landscape => ImageRole::Landscape,
            ImageSlot::Fanart(_) => ImageRole::Fanart,
        }
    }

    pub fn index(&self) -> Option<usize> {
        match self {
            ImageSlot::Fanart(i) => Some(*i),
            _ => None,
        }
    }
}

/// Output formats the local store writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredFormat {
    Jpg,
    Png,
    Webp,
}

impl StoredFormat {
    pub const ALL: [StoredFormat; 3] = [StoredFormat::Jpg, StoredFormat::Png, StoredFormat::Webp];

    pub fn extension(&self) -> &'static str {
        match self {
            StoredFormat::Jpg => "jpg",
            StoredFormat::Png => "png",
            StoredFormat::Webp => "webp",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" => Some(StoredFormat::Jpg),
            "png" => Some(StoredFormat::Png),
            "webp" => Some(StoredFormat::Webp),
            _ => None,
        }
    }

    pub fn from_image_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Jpeg => Some(StoredFormat::Jpg),
            image::ImageFormat::Png => Some(StoredFormat::Png),
            image::ImageFormat::WebP => Some(StoredFormat::Webp),
            _ => None,
        }
    }

    pub fn image_format(&self) -> image::ImageFormat {
        match self {
            StoredFormat::Jpg => image::ImageFormat::Jpeg,
            StoredFormat::Png => image::ImageFormat::Png,
            StoredFormat::Webp => image::ImageFormat::WebP,
        }
    }
}

/// Which delivery backend the persistence gateway should use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Proxy,
    #[default]
    LocalStore,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "proxy" => Ok(BackendKind::Proxy),
            "local_store" | "local" | "localstore" => Ok(BackendKind::LocalStore),
            other => Err(format!("unknown image backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey {
    pub ui_code: String,
    pub role: ImageRole,
    pub index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DeliveryReference {
    Url(String),
    RelativePath(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedImage {
    pub role: ImageRole,
    pub storage_key: StorageKey,
    pub delivery: DeliveryReference,
    pub format: StoredFormat,
}

/// One search hit from a site adapter, ranked then discarded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub site: String,
    pub external_id: String,
    pub raw_title: String,
    pub raw_image_url: Option<String>,
    pub raw_date_text: Option<String>,
    pub match_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorRef {
    pub name: String,
    pub thumb: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub name: String,
    pub value: f64,
    pub max: f64,
    pub votes: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trailer {
    pub url: String,
}

/// Canonical movie record assembled from one candidate and one detail page.
/// Every field has a usable default so partial pages never panic downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovieRecord {
    pub site: String,
    pub external_id: String,
    pub identifier: CanonicalIdentifier,
    pub title: String,
    pub originaltitle: String,
    pub tagline: Option<String>,
    pub plot: Option<String>,
    pub actors: Vec<ActorRef>,
    pub genres: Vec<String>,
    pub studio: Option<String>,
    pub director: Option<String>,
    pub premiered: Option<NaiveDate>,
    pub runtime: Option<u32>,
    pub ratings: Vec<Rating>,
    pub images: Vec<PersistedImage>,
    pub extras: Vec<Trailer>,
}

impl MovieRecord {
    pub fn year(&self) -> Option<i32> {
        use chrono::Datelike;
        self.premiered.map(|d| d.year())
    }

    pub fn image(&self, role: ImageRole) -> Option<&PersistedImage> {
        self.images.iter().find(|i| i.role == role)
    }

    /// Add an actor unless one with the same name is already present
    pub fn push_actor(&mut self, actor: ActorRef) {
        let name = actor.name.trim();
        if name.is_empty() || self.actors.iter().any(|a| a.name == name) {
            return;
        }
        self.actors.push(ActorRef {
            name: name.to_string(),
            thumb: actor.thumb,
        });
    }

    pub fn push_genre(&mut self, genre: &str) {
        let genre = genre.trim();
        if !genre.is_empty() && !self.genres.iter().any(|g| g == genre) {
            self.genres.push(genre.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ref_parse() {
        assert_eq!(
            ImageRef::parse("https://pics.example.com/a.jpg"),
            ImageRef::Url("https://pics.example.com/a.jpg".to_string())
        );
        assert_eq!(
            ImageRef::parse("//pics.example.com/a.jpg"),
            ImageRef::Url("https://pics.example.com/a.jpg".to_string())
        );
        assert_eq!(
            ImageRef::parse("/tmp/cover.png"),
            ImageRef::Path(PathBuf::from("/tmp/cover.png"))
        );
        assert_eq!(
            ImageRef::parse("//pics.example.com/a.jpg").as_url(),
            Some("https://pics.example.com/a.jpg")
        );
        assert_eq!(ImageRef::parse("/tmp/cover.png").as_url(), None);
    }

    #[test]
    fn test_image_ref_extension_ignores_query() {
        let r = ImageRef::parse("https://x.example/pics/abc123pl.JPG?v=2");
        assert_eq!(r.extension().as_deref(), Some("jpg"));
        let r = ImageRef::parse("https://x.example/pics/");
        assert_eq!(r.extension(), None);
    }

    #[test]
    fn test_crop_mode_from_str() {
        assert_eq!("r".parse::<CropMode>().unwrap(), CropMode::Right);
        assert_eq!("Center".parse::<CropMode>().unwrap(), CropMode::Center);
        assert!("diagonal".parse::<CropMode>().is_err());
    }

    #[test]
    fn test_record_dedups_actors_and_genres() {
        let mut record = MovieRecord::default();
        record.push_actor(ActorRef {
            name: "Aoi".to_string(),
            thumb: None,
        });
        record.push_actor(ActorRef {
            name: " Aoi ".to_string(),
            thumb: Some("x".to_string()),
        });
        record.push_genre("Drama");
        record.push_genre("Drama");
        record.push_genre("");
        assert_eq!(record.actors.len(), 1);
        assert_eq!(record.genres, vec!["Drama".to_string()]);
    }
}
