// JavBus adapter
// Search results are "movie-box" cards; detail pages carry a header/value
// info column, a wide cover and sample stills.

use async_trait::async_trait;
use scraper::{Html, Selector};
use std::sync::{Arc, LazyLock};

use super::html::{absolute_url, collapse, first_attr, first_text, non_placeholder, strip_header, text_of};
use super::{RawDetail, SearchOptions, SiteAdapter, SiteContext, SiteError};
use crate::models::{ActorRef, RawCandidate};
use crate::services::identifier::SiteRules;

pub const DEFAULT_BASE_URL: &str = "https://www.javbus.com";

static SEL_MOVIE_BOX: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a.movie-box").unwrap());
static SEL_IMG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img").unwrap());
static SEL_DATE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("date").unwrap());
static SEL_TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.container h3").unwrap());
static SEL_BIG_IMAGE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a.bigImage").unwrap());
static SEL_INFO_ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.info p").unwrap());
static SEL_HEADER: LazyLock<Selector> = LazyLock::new(|| Selector::parse("span.header").unwrap());
static SEL_LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").unwrap());
static SEL_GENRE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("span.genre label a").unwrap());
static SEL_AVATAR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a.avatar-box").unwrap());
static SEL_SPAN: LazyLock<Selector> = LazyLock::new(|| Selector::parse("span").unwrap());
static SEL_SAMPLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a.sample-box").unwrap());

pub struct JavBus {
    ctx: Arc<SiteContext>,
    base_url: String,
    rules: SiteRules,
}

impl JavBus {
    pub fn new(ctx: Arc<SiteContext>, base_url: Option<String>) -> Self {
        let rules = SiteRules::default().remap(&ctx.labels.remap);
        Self {
            ctx,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            rules,
        }
    }

    /// Without this cookie the site hides releases that have no magnet links
    async fn ensure_cookies(&self, proxy: Option<&str>) -> Result<(), SiteError> {
        if self.ctx.session.is_verified(self.name(), proxy).await {
            return Ok(());
        }
        self.ctx
            .session
            .set_cookie(&self.base_url, "existmag=all; Path=/", proxy)
            .await?;
        self.ctx.session.mark_verified(self.name(), proxy).await;
        Ok(())
    }
}

#[async_trait]
impl SiteAdapter for JavBus {
    fn name(&self) -> &'static str {
        "javbus"
    }

    fn rules(&self) -> &SiteRules {
        &self.rules
    }

    fn context(&self) -> &SiteContext {
        &self.ctx
    }

    async fn search_raw(
        &self,
        keyword: &str,
        options: &SearchOptions,
    ) -> Result<Vec<RawCandidate>, SiteError> {
        let proxy = options.proxy.as_deref();
        self.ensure_cookies(proxy).await?;

        let url = format!(
            "{}/search/{}",
            self.base_url,
            urlencoding::encode(keyword.trim())
        );
        let page = self.ctx.fetch_page(&url, proxy).await?;
        Ok(parse_search(&page.text(), &page.url))
    }

    async fn fetch_detail(
        &self,
        external_id: &str,
        options: &SearchOptions,
    ) -> Result<RawDetail, SiteError> {
        let proxy = options.proxy.as_deref();
        self.ensure_cookies(proxy).await?;

        let url = format!("{}/{}", self.base_url, external_id);
        let page = self.ctx.fetch_page(&url, proxy).await?;
        parse_detail(&page.text(), external_id, &page.url)
    }
}

pub fn parse_search(html: &str, page_url: &str) -> Vec<RawCandidate> {
    let doc = Html::parse_document(html);

    doc.select(&SEL_MOVIE_BOX)
        .filter_map(|card| {
            let href = card.value().attr("href")?;
            let external_id = href.trim_end_matches('/').rsplit('/').next()?.to_string();
            if external_id.is_empty() {
                return None;
            }

            let img = card.select(&SEL_IMG).next();
            let dates: Vec<String> = card.select(&SEL_DATE).map(text_of).collect();

            Some(RawCandidate {
                site: "javbus".to_string(),
                raw_title: img
                    .and_then(|i| i.value().attr("title"))
                    .map(collapse)
                    .unwrap_or_default(),
                raw_image_url: img
                    .and_then(|i| i.value().attr("src"))
                    .map(|src| absolute_url(page_url, src)),
                raw_date_text: dates.get(1).cloned(),
                external_id,
                match_score: 0.0,
            })
        })
        .collect()
}

/// "/pics/cover/7abc_b.jpg" -> "/pics/thumb/7abc.jpg"
fn thumb_for_cover(cover: &str) -> Option<String> {
    if !cover.contains("/pics/cover/") {
        return None;
    }
    Some(cover.replace("/pics/cover/", "/pics/thumb/").replace("_b.", "."))
}

pub fn parse_detail(html: &str, external_id: &str, page_url: &str) -> Result<RawDetail, SiteError> {
    let doc = Html::parse_document(html);

    let title = first_text(&doc, &SEL_TITLE)
        .ok_or_else(|| SiteError::Structure(format!("no title on {}", page_url)))?;

    let mut detail = RawDetail {
        external_id: external_id.to_string(),
        title,
        ..Default::default()
    };

    for row in doc.select(&SEL_INFO_ROW) {
        let Some(header) = row.select(&SEL_HEADER).next().map(text_of) else {
            continue;
        };
        let value = row
            .select(&SEL_LINK)
            .next()
            .map(text_of)
            .unwrap_or_else(|| strip_header(&text_of(row)));

        if header.contains("識別碼") || header.contains("ID") {
            detail.code_text = non_placeholder(strip_header(&text_of(row)));
        } else if header.contains("發行日期") || header.contains("Release") {
            detail.date_text = non_placeholder(value);
        } else if header.contains("長度") || header.contains("Length") {
            detail.runtime_text = non_placeholder(value);
        } else if header.contains("導演") || header.contains("Director") {
            detail.director = non_placeholder(value);
        } else if header.contains("製作商") || header.contains("Studio") {
            detail.studio = non_placeholder(value);
        }
    }

    detail.genres = doc.select(&SEL_GENRE).map(text_of).collect();

    for avatar in doc.select(&SEL_AVATAR) {
        let img = avatar.select(&SEL_IMG).next();
        let name = avatar
            .select(&SEL_SPAN)
            .next()
            .map(text_of)
            .or_else(|| img.and_then(|i| i.value().attr("title")).map(collapse))
            .unwrap_or_default();
        let thumb = img
            .and_then(|i| i.value().attr("src"))
            .filter(|src| !src.contains("nowprinting"))
            .map(|src| absolute_url(page_url, src));
        detail.actors.push(ActorRef { name, thumb });
    }

    detail.large = first_attr(&doc, &SEL_BIG_IMAGE, "href").map(|href| absolute_url(page_url, &href));
    detail.small = detail.large.as_deref().and_then(thumb_for_cover);
    detail.gallery = doc
        .select(&SEL_SAMPLE)
        .filter_map(|a| a.value().attr("href"))
        .map(|href| absolute_url(page_url, href))
        .collect();

    Ok(detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH: &str = r#"
        <div id="waterfall">
          <div class="item">
            <a class="movie-box" href="https://www.javbus.com/ABC-012">
              <div class="photo-frame"><img src="/pics/thumb/7xyz.jpg" title="A summer title"></div>
              <div class="photo-info"><span>A summer title <br><date>ABC-012</date> / <date>2021-03-09</date></span></div>
            </a>
          </div>
          <div class="item">
            <a class="movie-box" href="https://www.javbus.com/ABC-012_2021-05-01">
              <div class="photo-frame"><img src="/pics/thumb/8xyz.jpg" title="Re-release"></div>
              <div class="photo-info"><span>Re-release <br><date>ABC-012</date> / <date>2021-05-01</date></span></div>
            </a>
          </div>
        </div>"#;

    const DETAIL: &str = r#"
        <html><body><div class="container">
          <h3>ABC-012 A summer title</h3>
          <div class="row movie">
            <div class="col-md-9 screencap">
              <a class="bigImage" href="/pics/cover/7xyz_b.jpg"><img src="/pics/cover/7xyz_b.jpg"></a>
            </div>
            <div class="col-md-3 info">
              <p><span class="header">識別碼:</span> <span style="color:#CC0000;">ABC-012</span></p>
              <p><span class="header">發行日期:</span> 2021-03-09</p>
              <p><span class="header">長度:</span> 120分鐘</p>
              <p><span class="header">導演:</span> <a href="/director/1">Some Director</a></p>
              <p><span class="header">製作商:</span> <a href="/studio/2">Some Studio</a></p>
              <p class="header">類別:</p>
              <p>
                <span class="genre"><label><input type="checkbox"><a href="/genre/1">Drama</a></label></span>
                <span class="genre"><label><input type="checkbox"><a href="/genre/2">Romance</a></label></span>
              </p>
            </div>
          </div>
          <div id="star-div">
            <a class="avatar-box" href="/star/aa"><div class="photo-frame"><img src="/pics/actress/aa_a.jpg" title="Aoi"></div><span>Aoi</span></a>
            <a class="avatar-box" href="/star/bb"><div class="photo-frame"><img src="/imgs/actress/nowprinting.gif" title="Mei"></div><span>Mei</span></a>
          </div>
          <div id="sample-waterfall">
            <a class="sample-box" href="https://pics.example/sample/abc012jp-1.jpg"><div class="photo-frame"><img src="/pics/sample/1.jpg"></div></a>
            <a class="sample-box" href="https://pics.example/sample/abc012jp-2.jpg"><div class="photo-frame"><img src="/pics/sample/2.jpg"></div></a>
          </div>
        </div></body></html>"#;

    #[test]
    fn test_parse_search_cards() {
        let candidates = parse_search(SEARCH, "https://www.javbus.com/search/ABC-012");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].external_id, "ABC-012");
        assert_eq!(candidates[0].raw_title, "A summer title");
        assert_eq!(
            candidates[0].raw_image_url.as_deref(),
            Some("https://www.javbus.com/pics/thumb/7xyz.jpg")
        );
        assert_eq!(candidates[0].raw_date_text.as_deref(), Some("2021-03-09"));
        assert_eq!(candidates[1].external_id, "ABC-012_2021-05-01");
    }

    #[test]
    fn test_parse_detail_fields() {
        let detail = parse_detail(DETAIL, "ABC-012", "https://www.javbus.com/ABC-012").unwrap();

        assert_eq!(detail.title, "ABC-012 A summer title");
        assert_eq!(detail.code_text.as_deref(), Some("ABC-012"));
        assert_eq!(detail.date_text.as_deref(), Some("2021-03-09"));
        assert_eq!(detail.runtime_text.as_deref(), Some("120分鐘"));
        assert_eq!(detail.director.as_deref(), Some("Some Director"));
        assert_eq!(detail.studio.as_deref(), Some("Some Studio"));
        assert_eq!(detail.genres, vec!["Drama".to_string(), "Romance".to_string()]);

        assert_eq!(detail.actors.len(), 2);
        assert_eq!(detail.actors[0].name, "Aoi");
        assert_eq!(
            detail.actors[0].thumb.as_deref(),
            Some("https://www.javbus.com/pics/actress/aa_a.jpg")
        );
        assert_eq!(detail.actors[1].thumb, None);

        assert_eq!(
            detail.large.as_deref(),
            Some("https://www.javbus.com/pics/cover/7xyz_b.jpg")
        );
        assert_eq!(
            detail.small.as_deref(),
            Some("https://www.javbus.com/pics/thumb/7xyz.jpg")
        );
        assert_eq!(detail.gallery.len(), 2);
    }

    #[test]
    fn test_parse_detail_without_title_is_structure_error() {
        let result = parse_detail("<html><body><p>blocked</p></body></html>", "ABC-012", "https://x");
        assert!(matches!(result, Err(SiteError::Structure(_))));
    }
}
