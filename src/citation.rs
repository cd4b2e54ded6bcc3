//! Citation normalization: split a free-text citation into the book title the
//! user typed and the chapter/verse/page locator that follows it.
//!
//! The title term is what gets sent to fuzzy name completion; the locator is
//! glued back onto whatever canonical title completion returns. Pure and
//! total: every input yields a result.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedCitation {
    pub title_term: String,
    pub locator_suffix: Option<String>,
}

impl NormalizedCitation {
    /// Rebuild a reference from a canonical title and this citation's locator.
    pub fn with_title(&self, canonical_title: &str) -> String {
        let title = canonical_title.trim();
        match self.locator_suffix.as_deref() {
            None => title.to_string(),
            Some(suffix) if suffix.starts_with(',') => format!("{}{}", title, suffix),
            Some(suffix) => format!("{} {}", title, suffix),
        }
    }
}

/// A digit run at the end, optionally a daf side `a`/`b`.
static TRAILING_LOCATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+[ab]?[\s.]*$").expect("trailing locator pattern"));

fn has_trailing_locator(citation: &str) -> bool {
    TRAILING_LOCATOR.is_match(citation)
}

pub fn normalize_citation(raw: &str) -> NormalizedCitation {
    let citation = raw.trim();
    let whole = || NormalizedCitation {
        title_term: citation.to_string(),
        locator_suffix: None,
    };

    if !has_trailing_locator(citation) {
        return whole();
    }

    // Leading numerals belong to the title ("1 Samuel 3:4"), so the split
    // point is searched for only after the first letter.
    let Some(first_letter) = citation.find(|c: char| c.is_alphabetic()) else {
        return whole();
    };
    let Some(offset) =
        citation[first_letter..].find(|c: char| c == ',' || c == ':' || c.is_ascii_digit())
    else {
        return whole();
    };
    let boundary = first_letter + offset;

    let title_term = citation[..boundary]
        .trim_end_matches(|c: char| c.is_whitespace() || c == '.')
        .to_string();
    let locator = citation[boundary..]
        .trim()
        .trim_end_matches('.')
        .trim_end()
        .to_string();

    if title_term.is_empty() || locator.is_empty() {
        return whole();
    }

    NormalizedCitation {
        title_term,
        locator_suffix: Some(locator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_chapter_verse() {
        let n = normalize_citation("Genesis 1:1");
        assert_eq!(n.title_term, "Genesis");
        assert_eq!(n.locator_suffix.as_deref(), Some("1:1"));
    }

    #[test]
    fn test_commentary_with_section() {
        let n = normalize_citation("Kosef Mishneh on Mishneh Torah, Gifts to the Poor 7:3");
        assert_eq!(n.title_term, "Kosef Mishneh on Mishneh Torah");
        assert_eq!(n.locator_suffix.as_deref(), Some(", Gifts to the Poor 7:3"));
        assert_eq!(
            n.with_title("Kessef Mishneh"),
            "Kessef Mishneh, Gifts to the Poor 7:3"
        );
    }

    #[test]
    fn test_talmud_daf() {
        let n = normalize_citation("Brachot 2a");
        assert_eq!(n.title_term, "Brachot");
        assert_eq!(n.locator_suffix.as_deref(), Some("2a"));
        assert_eq!(n.with_title("Berakhot"), "Berakhot 2a");
    }

    #[test]
    fn test_leading_numeral_stays_in_title() {
        let n = normalize_citation("1 Samuel 3:4");
        assert_eq!(n.title_term, "1 Samuel");
        assert_eq!(n.locator_suffix.as_deref(), Some("3:4"));
    }

    #[test]
    fn test_no_locator_uses_whole_string() {
        let n = normalize_citation("  Pirkei Avot ");
        assert_eq!(n.title_term, "Pirkei Avot");
        assert!(n.locator_suffix.is_none());
        assert_eq!(n.with_title("Pirkei Avot"), "Pirkei Avot");
    }

    #[test]
    fn test_section_without_numbers_is_title() {
        let n = normalize_citation("Shulchan Arukh, Orach Chayim");
        assert_eq!(n.title_term, "Shulchan Arukh, Orach Chayim");
        assert!(n.locator_suffix.is_none());
    }

    #[test]
    fn test_trailing_period_dropped() {
        let n = normalize_citation("Exodus 20:2.");
        assert_eq!(n.title_term, "Exodus");
        assert_eq!(n.locator_suffix.as_deref(), Some("20:2"));
    }

    #[test]
    fn test_digits_only_is_total() {
        let n = normalize_citation("42");
        assert_eq!(n.title_term, "42");
        assert!(n.locator_suffix.is_none());
    }

    #[test]
    fn test_empty_input_is_total() {
        let n = normalize_citation("");
        assert_eq!(n.title_term, "");
        assert!(n.locator_suffix.is_none());
    }

    #[test]
    fn test_range_locator() {
        let n = normalize_citation("Rashi on Genesis 1:1-3");
        assert_eq!(n.title_term, "Rashi on Genesis");
        assert_eq!(n.locator_suffix.as_deref(), Some("1:1-3"));
    }
}
