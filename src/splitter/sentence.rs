//! Sentence-boundary test (§4.5): terminator check first, then a
//! tokenizer-alignment check within a 5-char tolerance, memoized in a
//! bounded cache keyed by the text pair.

use std::collections::HashMap;
use std::sync::Mutex;
use unicode_segmentation::UnicodeSegmentation;

#[cfg(feature = "cjk-tokenizer")]
use std::sync::LazyLock;

const TOLERANCE_CHARS: usize = 5;
const CACHE_CAP: usize = 4096;

struct BoundedCache {
    map: HashMap<(String, String), bool>,
    order: std::collections::VecDeque<(String, String)>,
}

impl BoundedCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: std::collections::VecDeque::new(),
        }
    }

    fn get(&self, key: &(String, String)) -> Option<bool> {
        self.map.get(key).copied()
    }

    fn insert(&mut self, key: (String, String), value: bool) {
        if self.map.len() >= CACHE_CAP {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, value);
    }
}

static CACHE: Mutex<Option<BoundedCache>> = Mutex::new(None);

fn is_cjk_char(c: char) -> bool {
    matches!(c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3040..=0x30FF | 0xAC00..=0xD7A3)
}

fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk_char)
}

/// Does a split between `before` and `after` fall on a sentence boundary?
pub fn is_sentence_boundary(before: &str, after: &str) -> bool {
    if before.trim_end().chars().last().map(super::elements::is_terminator_char).unwrap_or(false) {
        return true;
    }
    let key = (before.to_string(), after.to_string());
    {
        let mut guard = CACHE.lock().unwrap();
        let cache = guard.get_or_insert_with(BoundedCache::new);
        if let Some(v) = cache.get(&key) {
            return v;
        }
    }

    let combined = format!("{before}{after}");
    let split_offset = before.chars().count();
    let boundaries = sentence_boundaries(&combined);

    let aligned = boundaries.iter().any(|b| b.abs_diff(split_offset) <= TOLERANCE_CHARS);

    let mut guard = CACHE.lock().unwrap();
    guard.get_or_insert_with(BoundedCache::new).insert(key, aligned);
    aligned
}

/// Char-offset sentence boundaries. Uses a CJK-aware split when the text
/// contains CJK characters, otherwise `unicode-segmentation`'s sentence
/// tokenizer. The CJK path is `jieba-rs` word segmentation when the
/// `cjk-tokenizer` feature is enabled; without it, it degrades to a
/// terminator-character scan.
fn sentence_boundaries(text: &str) -> Vec<usize> {
    let mut boundaries = Vec::new();
    if contains_cjk(text) {
        #[cfg(feature = "cjk-tokenizer")]
        {
            boundaries.extend(cjk_word_boundaries(text));
        }
        #[cfg(not(feature = "cjk-tokenizer"))]
        {
            let mut offset = 0usize;
            for ch in text.chars() {
                offset += 1;
                if matches!(ch, '。' | '！' | '？' | '；' | '.' | '!' | '?' | ';') {
                    boundaries.push(offset);
                }
            }
        }
    } else {
        let mut offset = 0usize;
        for sentence in text.split_sentence_bounds() {
            offset += sentence.chars().count();
            boundaries.push(offset);
        }
    }
    boundaries
}

/// Boundaries at the end of any jieba token that is itself a sentence
/// terminator, mirroring the reference splitter's jieba-cut alignment check.
#[cfg(feature = "cjk-tokenizer")]
fn cjk_word_boundaries(text: &str) -> Vec<usize> {
    static JIEBA: LazyLock<jieba_rs::Jieba> = LazyLock::new(jieba_rs::Jieba::new);
    let mut boundaries = Vec::new();
    let mut offset = 0usize;
    for token in JIEBA.cut(text, false) {
        offset += token.chars().count();
        if matches!(token, "。" | "！" | "？" | "；" | "." | "!" | "?" | ";") {
            boundaries.push(offset);
        }
    }
    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_at_end_of_before_is_a_boundary() {
        assert!(is_sentence_boundary("This is done.", "Next sentence starts."));
    }

    #[test]
    fn mid_sentence_split_is_not_a_boundary() {
        assert!(!is_sentence_boundary("This is not", "done yet."));
    }

    #[test]
    fn cjk_terminator_is_a_boundary() {
        assert!(is_sentence_boundary("这句话结束了。", "这是新句子。"));
    }

    #[test]
    fn cache_is_consulted_on_repeat_calls() {
        let a = "abc.".to_string();
        let b = "def".to_string();
        let first = is_sentence_boundary(&a, &b);
        let second = is_sentence_boundary(&a, &b);
        assert_eq!(first, second);
    }
}
