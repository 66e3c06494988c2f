// MGStage adapter
// Product ids keep their leading digits ("300MIUM-123"), so this site parses
// codes with `keep_prefix_digits`. An `adc=1` cookie passes the age gate.

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::{Arc, LazyLock};

use super::html::{absolute_url, first_attr, first_text, non_placeholder, strip_header, text_of};
use super::{RawDetail, SearchOptions, SiteAdapter, SiteContext, SiteError};
use crate::models::{ActorRef, Rating, RawCandidate};
use crate::services::http::Page;
use crate::services::identifier::{normalize, SiteRules};

pub const DEFAULT_BASE_URL: &str = "https://www.mgstage.com";

static RE_PRODUCT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"product_detail/([^/?#]+)").unwrap());
static RE_RATING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*(?:\((\d+)件\))?").unwrap());

static SEL_TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1.tag").unwrap());
static SEL_ENLARGE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a#EnlargeImage").unwrap());
static SEL_ENLARGE_IMG: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("img.enlarge_image").unwrap());
static SEL_ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.detail_data tr").unwrap());
static SEL_TH: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th").unwrap());
static SEL_TD: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());
static SEL_LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").unwrap());
static SEL_PLOT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("p.txt.introduction").unwrap());
static SEL_SAMPLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a.sample_image").unwrap());
static SEL_TRAILER: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a.button_sample").unwrap());
static SEL_RESULT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.search_list li").unwrap());
static SEL_RESULT_LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h5 a").unwrap());
static SEL_RESULT_IMG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img").unwrap());
static SEL_RESULT_TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("p.title").unwrap());

pub struct MgStage {
    ctx: Arc<SiteContext>,
    base_url: String,
    rules: SiteRules,
}

impl MgStage {
    pub fn new(ctx: Arc<SiteContext>, base_url: Option<String>) -> Self {
        let rules = SiteRules::with_prefix_digits().remap(&ctx.labels.remap);
        Self {
            ctx,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            rules,
        }
    }

    fn detail_url(&self, product_id: &str) -> String {
        format!("{}/product/product_detail/{}/", self.base_url, product_id)
    }

    async fn fetch(&self, url: &str, proxy: Option<&str>) -> Result<Page, SiteError> {
        if !self.ctx.session.is_verified(self.name(), proxy).await {
            self.ctx
                .session
                .set_cookie(&self.base_url, "adc=1; Path=/", proxy)
                .await?;
            self.ctx.session.mark_verified(self.name(), proxy).await;
        }
        self.ctx.fetch_page(url, proxy).await
    }
}

#[async_trait]
impl SiteAdapter for MgStage {
    fn name(&self) -> &'static str {
        "mgstage"
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

        // Product pages are addressed by code, so try that before searching
        let identifier = normalize(keyword, &self.rules);
        if !identifier.is_pass_through() {
            let url = self.detail_url(&identifier.formatted);
            match self.fetch(&url, proxy).await {
                Ok(page) => match parse_detail(&page.text(), &identifier.formatted, &page.url) {
                    Ok(detail) => {
                        return Ok(vec![RawCandidate {
                            site: self.name().to_string(),
                            external_id: identifier.formatted.clone(),
                            raw_title: detail.title,
                            raw_image_url: detail.small,
                            raw_date_text: detail.date_text,
                            match_score: 0.0,
                        }])
                    }
                    Err(e) => tracing::debug!("MGStage direct lookup of {} failed: {}", identifier, e),
                },
                Err(SiteError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        let url = format!(
            "{}/search/cSearch.php?search_word={}",
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

    doc.select(&SEL_RESULT)
        .filter_map(|item| {
            let link = item.select(&SEL_RESULT_LINK).next()?;
            let href = link.value().attr("href")?;
            let product_id = RE_PRODUCT_ID.captures(href)?.get(1)?.as_str().to_string();

            let title = item
                .select(&SEL_RESULT_TITLE)
                .next()
                .map(text_of)
                .unwrap_or_else(|| text_of(link));

            Some(RawCandidate {
                site: "mgstage".to_string(),
                external_id: product_id,
                raw_title: title,
                raw_image_url: item
                    .select(&SEL_RESULT_IMG)
                    .next()
                    .and_then(|i| i.value().attr("src"))
                    .map(|src| absolute_url(page_url, src)),
                raw_date_text: None,
                match_score: 0.0,
            })
        })
        .collect()
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
        let (Some(th), Some(td)) = (row.select(&SEL_TH).next(), row.select(&SEL_TD).next()) else {
            continue;
        };
        let header = text_of(th);
        let links: Vec<String> = td
            .select(&SEL_LINK)
            .map(text_of)
            .filter(|t| !t.is_empty())
            .collect();
        let value = non_placeholder(strip_header(&text_of(td)));

        if header.starts_with("品番") {
            detail.code_text = value;
        } else if header.starts_with("配信開始日") {
            detail.date_text = value;
        } else if header.starts_with("収録時間") {
            detail.runtime_text = value;
        } else if header.starts_with("出演") {
            let names = if links.is_empty() {
                value.into_iter().collect()
            } else {
                links
            };
            detail.actors = names
                .into_iter()
                .map(|name| ActorRef { name, thumb: None })
                .collect();
        } else if header.starts_with("メーカー") {
            detail.studio = links.into_iter().next().or(value);
        } else if header.starts_with("ジャンル") {
            detail.genres = links;
        } else if header.starts_with("評価") {
            detail.rating = value.as_deref().and_then(parse_rating);
        }
    }

    detail.plot = first_text(&doc, &SEL_PLOT);
    detail.large = first_attr(&doc, &SEL_ENLARGE, "href").map(|u| absolute_url(page_url, &u));
    detail.small = first_attr(&doc, &SEL_ENLARGE_IMG, "src").map(|u| absolute_url(page_url, &u));
    detail.gallery = doc
        .select(&SEL_SAMPLE)
        .filter_map(|a| a.value().attr("href"))
        .map(|href| absolute_url(page_url, href))
        .collect();
    detail.trailer = first_attr(&doc, &SEL_TRAILER, "href").map(|u| absolute_url(page_url, &u));

    Ok(detail)
}

/// "4.5 (12件)"
fn parse_rating(text: &str) -> Option<Rating> {
    let caps = RE_RATING.captures(text)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(Rating {
        name: "mgstage".to_string(),
        value,
        max: 5.0,
        votes: caps.get(2).and_then(|m| m.as_str().parse().ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETAIL: &str = r#"
        <html><body>
          <h1 class="tag">  素人の物語  </h1>
          <div class="detail_photo">
            <a id="EnlargeImage" href="https://image.mgstage.com/images/x/300mium/123/pb_e_300mium-123.jpg">
              <img class="enlarge_image" src="https://image.mgstage.com/images/x/300mium/123/pf_o1_300mium-123.jpg">
            </a>
          </div>
          <div class="detail_data"><table>
            <tr><th>出演：</th><td>Aoi</td></tr>
            <tr><th>メーカー：</th><td><a href="/m">Some Maker</a></td></tr>
            <tr><th>収録時間：</th><td>60min</td></tr>
            <tr><th>品番：</th><td>300MIUM-123</td></tr>
            <tr><th>配信開始日：</th><td>2021/03/09</td></tr>
            <tr><th>ジャンル：</th><td><a href="/g/1">素人</a> <a href="/g/2">ドラマ</a></td></tr>
            <tr><th>評価：</th><td>4.5 (12件)</td></tr>
          </table></div>
          <p class="txt introduction">紹介文</p>
          <dl id="sample-photo"><dd><ul>
            <li><a class="sample_image" href="https://image.mgstage.com/images/x/cap_e_0_300mium-123.jpg"><img></a></li>
            <li><a class="sample_image" href="https://image.mgstage.com/images/x/cap_e_1_300mium-123.jpg"><img></a></li>
          </ul></dd></dl>
          <a class="button_sample" href="/sampleplayer/sampleplayer.html/abc">sample</a>
        </body></html>"#;

    const SEARCH: &str = r#"
        <div class="search_list"><ul>
          <li><h5><a href="/product/product_detail/300MIUM-123/">300MIUM-123</a></h5>
              <a href="/product/product_detail/300MIUM-123/"><img src="//image.mgstage.com/pf_t1_300mium-123.jpg"></a>
              <p class="title lineclamp">素人の物語</p></li>
        </ul></div>"#;

    #[test]
    fn test_parse_detail_fields() {
        let detail = parse_detail(DETAIL, "300MIUM-123", "https://www.mgstage.com/product/product_detail/300MIUM-123/").unwrap();

        assert_eq!(detail.title, "素人の物語");
        assert_eq!(detail.code_text.as_deref(), Some("300MIUM-123"));
        assert_eq!(detail.date_text.as_deref(), Some("2021/03/09"));
        assert_eq!(detail.runtime_text.as_deref(), Some("60min"));
        assert_eq!(detail.actors[0].name, "Aoi");
        assert_eq!(detail.studio.as_deref(), Some("Some Maker"));
        assert_eq!(detail.genres, vec!["素人".to_string(), "ドラマ".to_string()]);
        assert_eq!(detail.plot.as_deref(), Some("紹介文"));
        assert!(detail.large.as_deref().unwrap().contains("pb_e_300mium-123"));
        assert!(detail.small.as_deref().unwrap().contains("pf_o1_300mium-123"));
        assert_eq!(detail.gallery.len(), 2);
        assert_eq!(
            detail.trailer.as_deref(),
            Some("https://www.mgstage.com/sampleplayer/sampleplayer.html/abc")
        );

        let rating = detail.rating.unwrap();
        assert_eq!(rating.value, 4.5);
        assert_eq!(rating.votes, Some(12));
    }

    #[test]
    fn test_parse_search_results() {
        let candidates = parse_search(SEARCH, "https://www.mgstage.com/search/cSearch.php?search_word=300mium");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].external_id, "300MIUM-123");
        assert_eq!(candidates[0].raw_title, "素人の物語");
        assert_eq!(
            candidates[0].raw_image_url.as_deref(),
            Some("https://image.mgstage.com/pf_t1_300mium-123.jpg")
        );
    }

    #[test]
    fn test_prefix_digits_kept_for_identifier() {
        let rules = SiteRules::with_prefix_digits();
        assert_eq!(normalize("300mium00123", &rules).formatted, "300MIUM-123");
    }
}
