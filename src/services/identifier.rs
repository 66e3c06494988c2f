// Product code normalization
// Turns site-specific code text ("h_1234abc00567", "品番：ABC00012", "abc-12")
// into a canonical LABEL-NNN identifier. Total: unparseable input becomes a
// pass-through identifier instead of an error.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::models::CanonicalIdentifier;

/// Stand-in for a "NNid" qualifier while the label/number split runs.
/// Letters only, so the code regex keeps it inside the label.
const ID_QUALIFIER_MARK: &str = "idqmark";

static RE_DECORATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^.*?(?:品番|品號|識別碼|识别码|番号|番號|商品番号|content_id|cid|code)\s*[:：=]\s*").unwrap()
});
static RE_H_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^h_").unwrap());
static RE_SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s\-_.]+").unwrap());
static RE_ID_QUALIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{2})id(\d+)$").unwrap());
static RE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)?([a-z]+)(\d+)([a-z]+)?$").unwrap());
static RE_ZERO_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([a-z])0000").unwrap());

/// Per-site parsing rules
#[derive(Debug, Clone, Default)]
pub struct SiteRules {
    /// Keep a leading digit run as part of the label ("300MIUM") instead of
    /// treating it as a sub-id and dropping it
    pub keep_prefix_digits: bool,
    /// Uppercase label -> uppercase label
    pub label_remap: HashMap<String, String>,
}

impl SiteRules {
    pub fn with_prefix_digits() -> Self {
        Self {
            keep_prefix_digits: true,
            ..Default::default()
        }
    }

    pub fn remap(mut self, remap: &HashMap<String, String>) -> Self {
        for (from, to) in remap {
            self.label_remap
                .insert(from.to_uppercase(), to.to_uppercase());
        }
        self
    }
}

/// Normalize raw code text into a canonical identifier
pub fn normalize(raw_text: &str, rules: &SiteRules) -> CanonicalIdentifier {
    let cleaned = strip_decoration(raw_text);

    match parse_code(&cleaned, rules) {
        Some(identifier) => identifier,
        None => {
            tracing::debug!("Could not split '{}' into label/number, passing through", raw_text);
            pass_through(&cleaned)
        }
    }
}

/// Remove label prefixes such as "品番：" and surrounding whitespace
fn strip_decoration(raw_text: &str) -> String {
    let text = raw_text.trim();
    RE_DECORATION.replace(text, "").trim().to_string()
}

fn parse_code(cleaned: &str, rules: &SiteRules) -> Option<CanonicalIdentifier> {
    let lowered = cleaned.to_lowercase();
    let without_h = RE_H_PREFIX.replace(&lowered, "");
    let mut compact = RE_SEPARATORS.replace_all(&without_h, "").to_string();

    // "16id00045": the two digits belong to the label, not to a sub-id prefix
    let mut qualifier = None;
    let qualified = RE_ID_QUALIFIER.captures(&compact).and_then(|caps| {
        Some((
            caps.get(0)?.start(),
            caps.get(1)?.as_str().to_string(),
            caps.get(2)?.as_str().to_string(),
        ))
    });
    if let Some((start, digits, number)) = qualified {
        compact = format!("{}{}{}", &compact[..start], ID_QUALIFIER_MARK, number);
        qualifier = Some(digits);
    }

    let caps = RE_CODE.captures(&compact)?;
    let prefix_digits = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let letters = caps.get(2)?.as_str();
    let digits = caps.get(3)?.as_str();
    let suffix = caps.get(4).map(|m| m.as_str().to_uppercase());

    let mut label = if rules.keep_prefix_digits {
        format!("{}{}", prefix_digits, letters)
    } else {
        letters.to_string()
    }
    .to_uppercase();

    if let Some(q) = qualifier {
        label = label.replace(&ID_QUALIFIER_MARK.to_uppercase(), &format!("{}ID", q));
    }

    if let Some(mapped) = rules.label_remap.get(&label) {
        label = mapped.clone();
    }

    let trimmed = digits.trim_start_matches('0');
    let number: u64 = if trimmed.is_empty() {
        0
    } else {
        trimmed.parse().ok()?
    };

    let formatted = format!(
        "{}-{:03}{}",
        label,
        number,
        suffix.as_deref().unwrap_or("")
    );

    Some(CanonicalIdentifier {
        label,
        number: Some(number),
        suffix,
        formatted,
    })
}

/// Fallback representation: the whole cleaned text, uppercased.
/// A 4-zero run right after a letter collapses to "-00" first, mirroring the
/// sparse zero-padded codes a few catalogs emit.
fn pass_through(cleaned: &str) -> CanonicalIdentifier {
    let lowered = cleaned.to_lowercase();
    let collapsed = RE_ZERO_RUN.replacen(&lowered, 1, "${1}-00");
    let formatted = collapsed.to_uppercase();

    CanonicalIdentifier {
        label: formatted.clone(),
        number: None,
        suffix: None,
        formatted,
    }
}

/// Left-pad a digit string with zeros to `width`
pub fn zfill(digits: &str, width: usize) -> String {
    format!("{:0>width$}", digits, width = width)
}

/// Content ids to try, in order, for catalogs that key products by
/// label + zero-padded number. The second entry is a retry for when the
/// first finds nothing upstream.
pub fn content_id_candidates(identifier: &CanonicalIdentifier) -> Vec<String> {
    let Some(number) = identifier.number else {
        return vec![identifier.formatted.to_lowercase().replace('-', "")];
    };

    let label = identifier.label.to_lowercase();
    let digits = number.to_string();
    let suffix = identifier
        .suffix
        .as_deref()
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    let mut candidates = Vec::with_capacity(2);
    for width in [5, 6] {
        let candidate = format!("{}{}{}", label, zfill(&digits, width), suffix);
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}

/// Whether two raw code strings name the same release
pub fn same_code(a: &str, b: &str, rules: &SiteRules) -> bool {
    let a = normalize(a, rules);
    let b = normalize(b, rules);
    !a.formatted.is_empty() && a.formatted == b.formatted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(s: &str) -> CanonicalIdentifier {
        normalize(s, &SiteRules::default())
    }

    #[test]
    fn test_standard_codes_round_trip() {
        assert_eq!(norm("ABC-123").formatted, "ABC-123");
        assert_eq!(norm("ABCD-1234").formatted, "ABCD-1234");
        assert_eq!(norm("abc-12").formatted, "ABC-012");
        assert_eq!(norm("ABC-00012").formatted, "ABC-012");
        assert_eq!(norm("abc_012").formatted, "ABC-012");
        assert_eq!(norm(" abc 7 ").formatted, "ABC-007");
    }

    #[test]
    fn test_decoration_is_stripped() {
        let id = norm("品番：ABC00012");
        assert_eq!(id.label, "ABC");
        assert_eq!(id.number, Some(12));
        assert_eq!(id.formatted, "ABC-012");

        assert_eq!(norm("識別碼: abc-00012").formatted, "ABC-012");
    }

    #[test]
    fn test_h_prefix_and_sub_id() {
        let id = norm("h_1234abc00567");
        assert_eq!(id.label, "ABC");
        assert_eq!(id.number, Some(567));
        assert_eq!(id.formatted, "ABC-567");
        assert!(!id.is_pass_through());

        // Leading sub-id digits without the h_ marker
        assert_eq!(norm("118abp00123").formatted, "ABP-123");
    }

    #[test]
    fn test_prefix_digits_kept_when_site_requires() {
        let rules = SiteRules::with_prefix_digits();
        assert_eq!(normalize("300MIUM-123", &rules).formatted, "300MIUM-123");
        assert_eq!(norm("300MIUM-123").formatted, "MIUM-123");
    }

    #[test]
    fn test_id_qualifier_preserved_in_label() {
        let id = norm("16id00045");
        assert_eq!(id.label, "16ID");
        assert_eq!(id.formatted, "16ID-045");

        let id = norm("h_123416id00045");
        assert_eq!(id.label, "16ID");
        assert_eq!(id.number, Some(45));
    }

    #[test]
    fn test_suffix_letters() {
        let id = norm("abc00123a");
        assert_eq!(id.suffix.as_deref(), Some("A"));
        assert_eq!(id.formatted, "ABC-123A");
    }

    #[test]
    fn test_label_remap() {
        let mut remap = HashMap::new();
        remap.insert("tksoe".to_string(), "soe".to_string());
        let rules = SiteRules::default().remap(&remap);
        assert_eq!(normalize("tksoe00123", &rules).formatted, "SOE-123");
    }

    #[test]
    fn test_pass_through_never_fails() {
        let id = norm("FC2-PPV-1234567");
        assert!(id.is_pass_through());
        assert_eq!(id.formatted, "FC2-PPV-1234567");

        let id = norm("");
        assert!(id.is_pass_through());
        assert_eq!(id.formatted, "");

        let id = norm("ねこ");
        assert_eq!(id.formatted, "ねこ");
    }

    #[test]
    fn test_pass_through_zero_run_collapse() {
        let id = norm("abc00001extra2");
        assert!(id.is_pass_through());
        assert_eq!(id.formatted, "ABC-001EXTRA2");
    }

    #[test]
    fn test_content_id_candidates() {
        let id = norm("ABC-12");
        assert_eq!(
            content_id_candidates(&id),
            vec!["abc00012".to_string(), "abc000012".to_string()]
        );

        let id = norm("FC2-PPV-1234567");
        assert_eq!(content_id_candidates(&id), vec!["fc2ppv1234567".to_string()]);
    }

    #[test]
    fn test_zfill() {
        assert_eq!(zfill("12", 5), "00012");
        assert_eq!(zfill("1234567", 5), "1234567");
    }

    #[test]
    fn test_same_code() {
        let rules = SiteRules::default();
        assert!(same_code("abc00012", "ABC-012", &rules));
        assert!(!same_code("abc00012", "ABC-013", &rules));
        assert!(!same_code("", "", &rules));
    }
}
