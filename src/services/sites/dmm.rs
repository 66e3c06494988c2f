// DMM (FANZA) adapter
// Products are keyed by a content id: lowercase label + zero-padded number.
// Codes are looked up by probing detail pages with 5- then 6-digit padding;
// free text goes through the site search. Pages sit behind an age gate
// that is passed with a cookie.

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::{Arc, LazyLock};

use super::html::{absolute_url, first_attr, first_text, non_placeholder, strip_header, text_of};
use super::{RawDetail, SearchOptions, SiteAdapter, SiteContext, SiteError};
use crate::models::{ActorRef, Rating, RawCandidate};
use crate::services::http::Page;
use crate::services::identifier::{content_id_candidates, normalize, SiteRules};

pub const DEFAULT_BASE_URL: &str = "https://www.dmm.co.jp";

static RE_CID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"cid=([0-9a-z_]+)").unwrap());
static RE_SAMPLE_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-(\d+)\.(jpe?g)$").unwrap());
static RE_SCORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").unwrap());

static SEL_TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1#title").unwrap());
static SEL_PACKAGE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"#sample-video a[name="package-image"]"#).unwrap());
static SEL_PACKAGE_IMG: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"#sample-video a[name="package-image"] img"#).unwrap());
static SEL_ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table.mg-b20 tr").unwrap());
static SEL_HEADER_CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td.nw").unwrap());
static SEL_CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());
static SEL_LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").unwrap());
static SEL_PLOT: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.mg-b20.lh4").unwrap());
static SEL_SAMPLE_IMG: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("#sample-image-block img").unwrap());
static SEL_RATING: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("p.d-review__average strong").unwrap());
static SEL_LIST_ITEM: LazyLock<Selector> = LazyLock::new(|| Selector::parse("ul#list li").unwrap());
static SEL_LIST_LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("p.tmb a").unwrap());
static SEL_LIST_IMG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("span.img img").unwrap());

pub struct Dmm {
    ctx: Arc<SiteContext>,
    base_url: String,
    rules: SiteRules,
}

impl Dmm {
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

    fn detail_url(&self, cid: &str) -> String {
        format!("{}/digital/videoa/-/detail/=/cid={}/", self.base_url, cid)
    }

    async fn pass_age_gate(&self, proxy: Option<&str>) -> Result<(), SiteError> {
        if self.ctx.session.is_verified(self.name(), proxy).await {
            return Ok(());
        }
        self.ctx
            .session
            .set_cookie(&self.base_url, "age_check_done=1; Path=/", proxy)
            .await?;
        self.ctx.session.mark_verified(self.name(), proxy).await;
        tracing::debug!("DMM age gate cookie set");
        Ok(())
    }

    async fn fetch(&self, url: &str, proxy: Option<&str>) -> Result<Page, SiteError> {
        self.pass_age_gate(proxy).await?;
        let page = self.ctx.fetch_page(url, proxy).await?;
        if page.url.contains("age_check") {
            return Err(SiteError::Structure("age gate was not passed".to_string()));
        }
        Ok(page)
    }

    /// Probe detail pages for each padded content id; first hit wins
    async fn probe_content_ids(
        &self,
        keyword: &str,
        proxy: Option<&str>,
    ) -> Result<Vec<RawCandidate>, SiteError> {
        let identifier = normalize(keyword, &self.rules);
        for cid in content_id_candidates(&identifier) {
            match self.fetch(&self.detail_url(&cid), proxy).await {
                Ok(page) => {
                    let detail = parse_detail(&page.text(), &cid, &page.url)?;
                    return Ok(vec![RawCandidate {
                        site: self.name().to_string(),
                        external_id: cid,
                        raw_title: detail.title,
                        raw_image_url: detail.small,
                        raw_date_text: detail.date_text,
                        match_score: 0.0,
                    }]);
                }
                Err(SiteError::NotFound) => {
                    tracing::debug!("DMM has no content id {}", cid);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(SiteError::NotFound)
    }
}

#[async_trait]
impl SiteAdapter for Dmm {
    fn name(&self) -> &'static str {
        "dmm"
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

        if !normalize(keyword, &self.rules).is_pass_through() {
            return self.probe_content_ids(keyword, proxy).await;
        }

        let url = format!(
            "{}/digital/videoa/-/list/search/=/searchstr={}/",
            self.base_url,
            urlencoding::encode(keyword.trim())
        );
        let page = self.fetch(&url, proxy).await?;
        Ok(parse_search(&page.text(), &page.url))
    }

    async fn fetch_detail(
        &self,
        external_id: &str,
        options: &SearchOptions,
    ) -> Result<RawDetail, SiteError> {
        let page = self
            .fetch(&self.detail_url(external_id), options.proxy.as_deref())
            .await?;
        parse_detail(&page.text(), external_id, &page.url)
    }
}

pub fn parse_search(html: &str, page_url: &str) -> Vec<RawCandidate> {
    let doc = Html::parse_document(html);

    doc.select(&SEL_LIST_ITEM)
        .filter_map(|item| {
            let href = item.select(&SEL_LIST_LINK).next()?.value().attr("href")?;
            let cid = RE_CID.captures(href)?.get(1)?.as_str().to_string();
            let img = item.select(&SEL_LIST_IMG).next();

            Some(RawCandidate {
                site: "dmm".to_string(),
                external_id: cid,
                raw_title: img
                    .and_then(|i| i.value().attr("alt"))
                    .map(|t| t.trim().to_string())
                    .unwrap_or_default(),
                raw_image_url: img
                    .and_then(|i| i.value().attr("src"))
                    .map(|src| absolute_url(page_url, src)),
                raw_date_text: None,
                match_score: 0.0,
            })
        })
        .collect()
}

/// "abc00012-1.jpg" -> "abc00012jp-1.jpg" (full-size still)
fn full_size_sample(url: &str) -> String {
    RE_SAMPLE_INDEX.replace(url, "jp-${1}.${2}").to_string()
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

    for row in doc.select(&SEL_ROW) {
        let Some(header) = row.select(&SEL_HEADER_CELL).next().map(text_of) else {
            continue;
        };
        let Some(cell) = row.select(&SEL_CELL).nth(1) else {
            continue;
        };
        let links: Vec<String> = cell
            .select(&SEL_LINK)
            .map(text_of)
            .filter(|t| !t.is_empty())
            .collect();
        let value = non_placeholder(strip_header(&text_of(cell)));

        if header.starts_with("品番") {
            detail.code_text = value;
        } else if header.starts_with("配信開始日") || header.starts_with("発売日") {
            if detail.date_text.is_none() {
                detail.date_text = value;
            }
        } else if header.starts_with("収録時間") {
            detail.runtime_text = value;
        } else if header.starts_with("出演者") {
            detail.actors = links
                .into_iter()
                .map(|name| ActorRef { name, thumb: None })
                .collect();
        } else if header.starts_with("監督") {
            detail.director = links.into_iter().next().or(value);
        } else if header.starts_with("メーカー") {
            detail.studio = links.into_iter().next().or(value);
        } else if header.starts_with("ジャンル") {
            detail.genres = links;
        }
    }

    detail.plot = first_text(&doc, &SEL_PLOT);
    detail.large = first_attr(&doc, &SEL_PACKAGE, "href").map(|u| absolute_url(page_url, &u));
    detail.small = first_attr(&doc, &SEL_PACKAGE_IMG, "src").map(|u| absolute_url(page_url, &u));
    detail.gallery = doc
        .select(&SEL_SAMPLE_IMG)
        .filter_map(|img| img.value().attr("src"))
        .map(|src| full_size_sample(&absolute_url(page_url, src)))
        .collect();

    detail.rating = first_text(&doc, &SEL_RATING)
        .and_then(|text| RE_SCORE.find(&text).and_then(|m| m.as_str().parse().ok()))
        .map(|value| Rating {
            name: "dmm".to_string(),
            value,
            max: 5.0,
            votes: None,
        });

    Ok(detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETAIL: &str = r#"
        <html><body>
          <h1 id="title" class="item fn">夏の物語</h1>
          <div id="sample-video">
            <a name="package-image" href="https://pics.dmm.co.jp/digital/video/abc00012/abc00012pl.jpg">
              <img src="https://pics.dmm.co.jp/digital/video/abc00012/abc00012ps.jpg" alt="夏の物語">
            </a>
          </div>
          <table class="mg-b20">
            <tr><td class="nw">配信開始日：</td><td>2021/03/09</td></tr>
            <tr><td class="nw">商品発売日：</td><td>2021/03/19</td></tr>
            <tr><td class="nw">収録時間：</td><td>120分</td></tr>
            <tr><td class="nw">出演者：</td><td><span id="performer"><a href="/a/1">Aoi</a> <a href="/a/2">Mei</a></span></td></tr>
            <tr><td class="nw">監督：</td><td>----</td></tr>
            <tr><td class="nw">メーカー：</td><td><a href="/m/1">Some Studio</a></td></tr>
            <tr><td class="nw">ジャンル：</td><td><a href="/g/1">ドラマ</a>&nbsp;<a href="/g/2">恋愛</a></td></tr>
            <tr><td class="nw">品番：</td><td>abc00012</td></tr>
          </table>
          <div class="mg-b20 lh4">  あらすじ  </div>
          <div id="sample-image-block">
            <a name="sample-image" id="sample-image1"><img src="https://pics.dmm.co.jp/digital/video/abc00012/abc00012-1.jpg"></a>
            <a name="sample-image" id="sample-image2"><img src="https://pics.dmm.co.jp/digital/video/abc00012/abc00012-2.jpg"></a>
          </div>
          <p class="d-review__average"><strong>4.25点</strong></p>
        </body></html>"#;

    const SEARCH: &str = r#"
        <ul id="list">
          <li><div><p class="tmb"><a href="https://www.dmm.co.jp/digital/videoa/-/detail/=/cid=abc00012/?i3_ref=search">
            <span class="img"><img src="https://pics.dmm.co.jp/digital/video/abc00012/abc00012pt.jpg" alt="夏の物語"></span></a></p></div></li>
          <li><div><p class="tmb"><a href="/no/cid/here"></a></p></div></li>
        </ul>"#;

    #[test]
    fn test_parse_detail_fields() {
        let detail = parse_detail(DETAIL, "abc00012", "https://www.dmm.co.jp/digital/videoa/-/detail/=/cid=abc00012/").unwrap();

        assert_eq!(detail.title, "夏の物語");
        assert_eq!(detail.code_text.as_deref(), Some("abc00012"));
        assert_eq!(detail.date_text.as_deref(), Some("2021/03/09"));
        assert_eq!(detail.runtime_text.as_deref(), Some("120分"));
        assert_eq!(detail.director, None);
        assert_eq!(detail.studio.as_deref(), Some("Some Studio"));
        assert_eq!(detail.genres, vec!["ドラマ".to_string(), "恋愛".to_string()]);
        let names: Vec<&str> = detail.actors.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Aoi", "Mei"]);
        assert_eq!(detail.plot.as_deref(), Some("あらすじ"));

        assert!(detail.large.as_deref().unwrap().ends_with("abc00012pl.jpg"));
        assert!(detail.small.as_deref().unwrap().ends_with("abc00012ps.jpg"));
        assert_eq!(
            detail.gallery,
            vec![
                "https://pics.dmm.co.jp/digital/video/abc00012/abc00012jp-1.jpg".to_string(),
                "https://pics.dmm.co.jp/digital/video/abc00012/abc00012jp-2.jpg".to_string(),
            ]
        );

        let rating = detail.rating.unwrap();
        assert_eq!(rating.value, 4.25);
        assert_eq!(rating.max, 5.0);
    }

    #[test]
    fn test_parse_search_extracts_content_ids() {
        let candidates = parse_search(SEARCH, "https://www.dmm.co.jp/digital/videoa/-/list/search/");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].external_id, "abc00012");
        assert_eq!(candidates[0].raw_title, "夏の物語");
    }

    #[test]
    fn test_full_size_sample() {
        assert_eq!(full_size_sample("https://x/abc00012-10.jpg"), "https://x/abc00012jp-10.jpg");
        assert_eq!(full_size_sample("https://x/abc00012.jpg"), "https://x/abc00012.jpg");
    }
}
