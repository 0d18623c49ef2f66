//! Text normalization and tokenization.
//!
//! [`normalize`] produces the canonical form used for content hashing and
//! shingling. [`tokenize`] splits text into lowercase alphanumeric terms with
//! stop words and single characters removed; it feeds the hashing embedder.

use std::collections::HashSet;
use std::sync::LazyLock;
use unicode_segmentation::UnicodeSegmentation;

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can", "do", "does", "for",
        "from", "had", "has", "have", "he", "her", "his", "if", "in", "into", "is", "it", "its",
        "no", "not", "of", "on", "or", "our", "she", "so", "such", "than", "that", "the", "their",
        "them", "then", "there", "these", "they", "this", "those", "to", "was", "we", "were",
        "what", "when", "where", "which", "who", "will", "with", "you", "your",
    ]
    .into_iter()
    .collect()
});

pub const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Continue an FNV-1a hash over `bytes`. Stable across builds and platforms,
/// unlike `std`'s default hasher.
#[inline]
pub fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Unicode lowercase, whitespace runs collapsed to one space, trimmed.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    for word in lowered.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Words of already-normalized text, punctuation dropped. Used for shingles.
pub fn words(normalized: &str) -> Vec<&str> {
    normalized.unicode_words().collect()
}

/// Tokenized text: one lowercased buffer plus byte spans into it.
pub struct Tokens {
    buffer: String,
    spans: Vec<(u32, u32)>,
}

impl Tokens {
    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.spans
            .iter()
            .map(|&(s, e)| &self.buffer[s as usize..e as usize])
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Lowercase, split on non-alphanumerics, drop stop words and 1-char tokens.
pub fn tokenize(text: &str) -> Tokens {
    let buffer = text.to_lowercase();
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;

    let mut keep = |s: usize, e: usize, buffer: &str| {
        let token = &buffer[s..e];
        if token.chars().count() > 1 && !STOP_WORDS.contains(token) {
            spans.push((s as u32, e as u32));
        }
    };
    for (i, c) in buffer.char_indices() {
        if c.is_alphanumeric() {
            start.get_or_insert(i);
        } else if let Some(s) = start.take() {
            keep(s, i, &buffer);
        }
    }
    if let Some(s) = start {
        keep(s, buffer.len(), &buffer);
    }

    Tokens { buffer, spans }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize("  The  Capital\tof\n\nFRANCE "), "the capital of france");
        assert_eq!(normalize("Écoute"), "écoute");
        assert_eq!(normalize(" \n "), "");
    }

    #[test]
    fn test_tokenize_drops_stop_words_and_single_chars() {
        let tokens = tokenize("The capital of France is Paris.");
        let words: Vec<&str> = tokens.iter().collect();
        assert_eq!(words, vec!["capital", "france", "paris"]);
        let tokens = tokenize("Water boils at 100°C.");
        let words: Vec<&str> = tokens.iter().collect();
        assert_eq!(words, vec!["water", "boils", "100"]);
    }

    #[test]
    fn test_tokenize_keeps_multibyte_words() {
        let tokens = tokenize("Ünïcode naïve café");
        assert_eq!(tokens.len(), 3);
        assert!(tokens.iter().any(|t| t == "café"));
    }

    #[test]
    fn test_words_strip_punctuation() {
        assert_eq!(words("paris, the capital."), vec!["paris", "the", "capital"]);
    }
}
