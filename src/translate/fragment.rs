//! Ignore-pattern fragment splitting, budget chunking and reassembly.

use regex::Regex;

/// Splits display texts around the ignore pattern.
#[derive(Debug, Clone, Default)]
pub struct FragmentSplitter {
    ignore: Option<Regex>,
}

impl FragmentSplitter {
    pub fn new(ignore: Option<Regex>) -> Self {
        Self { ignore }
    }

    /// Ordered, trimmed, non-empty fragments of `text`.
    ///
    /// Text between ignore matches becomes fragments. Inside a match, only text
    /// captured by a group survives (as a fragment of its own); the rest is excised.
    pub fn split(&self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        let Some(re) = &self.ignore else {
            push_trimmed(&mut out, text);
            return out;
        };

        let mut last = 0;
        for caps in re.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            push_trimmed(&mut out, &text[last..whole.start()]);
            for group in caps.iter().skip(1).flatten() {
                push_trimmed(&mut out, group.as_str());
            }
            last = whole.end();
        }
        push_trimmed(&mut out, &text[last..]);
        out
    }

    /// Byte ranges of ignore matches in `text`.
    pub fn spans(&self, text: &str) -> Vec<(usize, usize)> {
        match &self.ignore {
            Some(re) => re.find_iter(text).map(|m| (m.start(), m.end())).collect(),
            None => Vec::new(),
        }
    }

    /// Cut `text` into pieces of at most `max_chars` characters, never inside an
    /// ignore span. A single span longer than the limit becomes its own piece.
    pub fn chunk(&self, text: &str, max_chars: usize) -> Vec<String> {
        let max_chars = max_chars.max(1);
        if text.chars().count() <= max_chars {
            return vec![text.to_string()];
        }

        let spans = self.spans(text);
        let mut span_iter = spans.iter().peekable();
        let mut chunks = Vec::new();
        let mut start = 0;
        let mut count = 0;
        let mut pos = 0;

        while pos < text.len() {
            // The next indivisible unit: a whole span, or one character.
            let (unit_end, unit_chars) = match span_iter.peek() {
                Some(&&(s, e)) if s == pos && e > s => {
                    span_iter.next();
                    (e, text[s..e].chars().count())
                }
                _ => {
                    let width = text[pos..].chars().next().map_or(1, char::len_utf8);
                    (pos + width, 1)
                }
            };
            while matches!(span_iter.peek(), Some(&&(s, _)) if s < unit_end) {
                span_iter.next();
            }

            if count > 0 && count + unit_chars > max_chars {
                chunks.push(text[start..pos].to_string());
                start = pos;
                count = 0;
            }
            count += unit_chars;
            pos = unit_end;
        }
        if start < text.len() {
            chunks.push(text[start..].to_string());
        }
        chunks
    }
}

fn push_trimmed(out: &mut Vec<String>, piece: &str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        out.push(piece.to_string());
    }
}

/// Replace each fragment with its translation, in order, at its first occurrence
/// after the previous replacement. Fragments that cannot be found are skipped.
pub fn reassemble<S: AsRef<str>>(text: &str, pairs: &[(S, S)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (source, translated) in pairs {
        let source = source.as_ref();
        if source.is_empty() {
            continue;
        }
        if let Some(offset) = text[cursor..].find(source) {
            out.push_str(&text[cursor..cursor + offset]);
            out.push_str(translated.as_ref());
            cursor += offset + source.len();
        }
    }
    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sprite_splitter() -> FragmentSplitter {
        FragmentSplitter::new(Some(Regex::new(r"(\[sprite [^\]]*\])").unwrap()))
    }

    #[test]
    fn capture_groups_survive_as_fragments() {
        let fragments = sprite_splitter().split("你好 [sprite \"x\"]");
        assert_eq!(fragments, vec!["你好", "[sprite \"x\"]"]);
    }

    #[test]
    fn uncaptured_matches_are_excised() {
        let splitter = FragmentSplitter::new(Some(Regex::new(r"<[^>]+>").unwrap()));
        assert_eq!(
            splitter.split("<b>攻击</b> 防御 <i>"),
            vec!["攻击", "防御"]
        );
    }

    #[test]
    fn without_pattern_whole_text_is_one_fragment() {
        let splitter = FragmentSplitter::default();
        assert_eq!(splitter.split("  hello  "), vec!["hello"]);
        assert!(splitter.split("   ").is_empty());
    }

    #[test]
    fn reassembles_sprite_scenario() {
        let pairs = [("你好", "Hello"), ("[sprite \"x\"]", "[sprite \"x\"]")];
        assert_eq!(
            reassemble("你好 [sprite \"x\"]", &pairs),
            "Hello [sprite \"x\"]"
        );
    }

    #[test]
    fn replacement_does_not_revisit_translated_text() {
        // "a" appears inside the first translation; the cursor must skip past it.
        let pairs = [("b", "a"), ("a", "z")];
        assert_eq!(reassemble("b a", &pairs), "a z");
    }

    #[test]
    fn repeated_fragments_replace_successive_occurrences() {
        let pairs = [("你", "you"), ("你", "you")];
        assert_eq!(reassemble("你和你", &pairs), "you和you");
    }

    #[test]
    fn chunks_respect_character_budget() {
        let splitter = FragmentSplitter::default();
        let chunks = splitter.chunk("一二三四五六七", 3);
        assert_eq!(chunks, vec!["一二三", "四五六", "七"]);
    }

    #[test]
    fn chunks_never_cut_inside_spans() {
        let splitter = FragmentSplitter::new(Some(Regex::new(r"\[[^\]]*\]").unwrap()));
        let chunks = splitter.chunk("ab[cdef]gh", 4);
        assert_eq!(chunks, vec!["ab", "[cdef]", "gh"]);
        assert_eq!(chunks.concat(), "ab[cdef]gh");
    }

    #[test]
    fn short_text_is_not_chunked() {
        let splitter = sprite_splitter();
        assert_eq!(splitter.chunk("short", 10), vec!["short"]);
    }
}
