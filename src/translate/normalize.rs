//! Submission gates: full-text and per-line regex filters, plus optional
//! language detection so text already in the target language is skipped.

use regex::Regex;

use crate::config::{ConfigError, FilterConfig};

/// Detects the dominant language of `text` using whatlang.
/// Returns an ISO 639-1 code, or None below `min_confidence`.
/// whatlang's own `is_reliable` rejects most short UI strings, so it is not used.
pub fn detect_language(text: &str, min_confidence: f64) -> Option<String> {
    let info = whatlang::detect(text)?;
    if info.confidence() < min_confidence {
        return None;
    }
    Some(lang_to_code(info.lang()).to_string())
}

fn lang_to_code(lang: whatlang::Lang) -> &'static str {
    use whatlang::Lang::*;
    match lang {
        Eng => "en",
        Cmn => "zh",
        Jpn => "ja",
        Kor => "ko",
        Fra => "fr",
        Deu => "de",
        Spa => "es",
        Rus => "ru",
        Por => "pt",
        Ita => "it",
        Ara => "ar",
        Hin => "hi",
        Tur => "tr",
        Vie => "vi",
        Tha => "th",
        Nld => "nl",
        Pol => "pl",
        Ukr => "uk",
        _ => "other",
    }
}

/// `zh-Hans` -> `zh`, `EN` -> `en`.
fn primary_subtag(lang: &str) -> String {
    lang.split(|c: char| c == '-' || c == '_')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Decides whether a submitted text is worth translating.
#[derive(Debug, Clone, Default)]
pub struct TextFilter {
    full_text: Option<Regex>,
    per_line: Option<Regex>,
    skip_language: Option<String>,
    min_confidence: f64,
}

impl TextFilter {
    pub fn from_config(config: &FilterConfig, target_lang: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            full_text: config.full_text_regex()?,
            per_line: config.per_line_regex()?,
            skip_language: config
                .skip_target_language
                .then(|| primary_subtag(target_lang)),
            min_confidence: config.language_confidence,
        })
    }

    /// Blank text never passes. Then the full-text gate, then the per-line gate
    /// (some line must match), then the target-language check.
    pub fn accepts(&self, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        if let Some(re) = &self.full_text {
            if !re.is_match(text) {
                return false;
            }
        }
        if let Some(re) = &self.per_line {
            if !text.lines().any(|line| re.is_match(line)) {
                return false;
            }
        }
        if let Some(target) = &self.skip_language {
            if detect_language(text, self.min_confidence).as_deref() == Some(target.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(full_text: Option<&str>, per_line: Option<&str>) -> TextFilter {
        let config = FilterConfig {
            full_text: full_text.map(str::to_string),
            per_line: per_line.map(str::to_string),
            ..FilterConfig::default()
        };
        TextFilter::from_config(&config, "en").unwrap()
    }

    #[test]
    fn no_gates_pass_everything_but_blank() {
        let f = filter(None, None);
        assert!(f.accepts("anything"));
        assert!(!f.accepts("  \n\t"));
    }

    #[test]
    fn full_text_gate_applies_first() {
        let f = filter(Some(r"\p{Han}"), None);
        assert!(f.accepts("攻击力 +5"));
        assert!(!f.accepts("Attack +5"));
    }

    #[test]
    fn per_line_gate_needs_one_matching_line() {
        let f = filter(None, Some(r"^\p{Han}"));
        assert!(f.accepts("HP 100\n生命值"));
        assert!(!f.accepts("HP 100\nMP 20"));
    }

    #[test]
    fn skips_text_already_in_target_language() {
        let config = FilterConfig {
            skip_target_language: true,
            ..FilterConfig::default()
        };
        let f = TextFilter::from_config(&config, "en-US").unwrap();
        assert!(!f.accepts(
            "The quick brown fox jumps over the lazy dog and keeps running through the quiet forest until the night falls."
        ));
        assert!(f.accepts("欢迎来到这个美丽的村庄，旅行者。请在旅馆休息一下，明天再出发吧。"));
    }

    #[test]
    fn confidence_floor_is_configurable() {
        let sentence = "The quick brown fox jumps over the lazy dog and keeps running through \
                        the quiet forest until the night falls.";
        assert_eq!(detect_language(sentence, 0.1).as_deref(), Some("en"));
        assert_eq!(detect_language(sentence, 1.01), None);
    }

    #[test]
    fn primary_subtag_is_lowercased() {
        assert_eq!(primary_subtag("zh-Hans"), "zh");
        assert_eq!(primary_subtag("EN_us"), "en");
    }
}
