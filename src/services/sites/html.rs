// Small helpers over scraper's HTML tree. All synchronous: `Html` is not
// Send, so parsing happens entirely between awaits.

use reqwest::Url;
use scraper::{ElementRef, Html, Selector};

/// Element text with runs of whitespace collapsed
pub fn text_of(element: ElementRef<'_>) -> String {
    collapse(&element.text().collect::<String>())
}

pub fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn first_text(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel)
        .next()
        .map(text_of)
        .filter(|t| !t.is_empty())
}

pub fn first_attr(doc: &Html, sel: &Selector, attr: &str) -> Option<String> {
    doc.select(sel)
        .filter_map(|e| e.value().attr(attr))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn all_text(doc: &Html, sel: &Selector) -> Vec<String> {
    doc.select(sel)
        .map(text_of)
        .filter(|t| !t.is_empty())
        .collect()
}

/// Resolve `href` against the page URL; protocol-relative links become https
pub fn absolute_url(base: &str, href: &str) -> String {
    let href = href.trim();
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Some(rest) = href.strip_prefix("//") {
        return format!("https://{}", rest);
    }
    match Url::parse(base).and_then(|b| b.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => format!("{}/{}", base.trim_end_matches('/'), href.trim_start_matches('/')),
    }
}

/// Text after a "label:" header such as "品番：" or "Release Date:"
pub fn strip_header(text: &str) -> String {
    match text.find([':', '：']) {
        Some(pos) => {
            let sep_len = text[pos..].chars().next().map(char::len_utf8).unwrap_or(1);
            text[pos + sep_len..].trim().to_string()
        }
        None => text.trim().to_string(),
    }
}

/// Detail pages often print "----" or "-" for an empty field
pub fn non_placeholder(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '-' || c == '―') {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_url() {
        assert_eq!(
            absolute_url("https://www.javbus.com/ABC-012", "/pics/cover/x_b.jpg"),
            "https://www.javbus.com/pics/cover/x_b.jpg"
        );
        assert_eq!(
            absolute_url("https://a.example/", "//pics.example/a.jpg"),
            "https://pics.example/a.jpg"
        );
        assert_eq!(
            absolute_url("https://a.example/", "https://b.example/c.jpg"),
            "https://b.example/c.jpg"
        );
    }

    #[test]
    fn test_strip_header() {
        assert_eq!(strip_header("品番：ABC-012"), "ABC-012");
        assert_eq!(strip_header("識別碼: ABC-012"), "ABC-012");
        assert_eq!(strip_header("no header"), "no header");
    }

    #[test]
    fn test_text_helpers() {
        let doc = Html::parse_fragment("<div><p class='t'>  Hello \n  world </p><p class='t'></p></div>");
        let sel = Selector::parse("p.t").unwrap();
        assert_eq!(first_text(&doc, &sel).as_deref(), Some("Hello world"));
        assert_eq!(all_text(&doc, &sel), vec!["Hello world".to_string()]);
        assert_eq!(non_placeholder("----".to_string()), None);
        assert_eq!(non_placeholder(" Studio ".to_string()).as_deref(), Some("Studio"));
    }
}
