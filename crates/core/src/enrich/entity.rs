//! Named-entity tagging.
//!
//! [`EntityTagger`] is the seam for any recognizer. [`RuleTagger`] is the
//! built-in one: it finds numeric entities (`MONEY`, `PERCENT`, `DATE`,
//! `ORDINAL`, `CARDINAL`) and capitalized names whose context gives them
//! away (`PERSON` after a title, `ORG` before a corporate suffix, `GPE`
//! after a locative preposition). Labels follow the OntoNotes names.

use crate::chunk::Entity;

pub const PERSON: &str = "PERSON";
pub const ORG: &str = "ORG";
pub const GPE: &str = "GPE";
pub const DATE: &str = "DATE";
pub const MONEY: &str = "MONEY";
pub const PERCENT: &str = "PERCENT";
pub const ORDINAL: &str = "ORDINAL";
pub const CARDINAL: &str = "CARDINAL";

/// Every label a query may filter on.
pub const LABELS: &[&str] = &[
    "PERSON",
    "NORP",
    "FAC",
    "ORG",
    "GPE",
    "LOC",
    "PRODUCT",
    "EVENT",
    "WORK_OF_ART",
    "LAW",
    "LANGUAGE",
    "DATE",
    "TIME",
    "PERCENT",
    "MONEY",
    "QUANTITY",
    "ORDINAL",
    "CARDINAL",
];

/// Finds entities in chunk text. Must be deterministic: the same text
/// always yields the same entities.
pub trait EntityTagger: Send + Sync {
    fn entities(&self, text: &str) -> Vec<Entity>;
}

const MONTHS: &[&str] = &[
    "January", "February", "March", "April", "May", "June", "July", "August", "September",
    "October", "November", "December", "Jan", "Feb", "Mar", "Apr", "Jun", "Jul", "Aug", "Sep",
    "Sept", "Oct", "Nov", "Dec",
];
const TITLES: &[&str] = &["Mr", "Mrs", "Ms", "Dr", "Prof", "Sir", "Dame", "President", "Senator"];
const ORG_SUFFIXES: &[&str] = &[
    "Inc", "Corp", "Corporation", "Ltd", "LLC", "GmbH", "Company", "Co", "Group", "University",
    "Institute", "Bank", "Agency", "Foundation", "Association", "Council", "Ministry",
];
const LOCATIVES: &[&str] = &["in", "from", "near", "across", "throughout"];
const CONNECTORS: &[&str] = &["of", "and", "&", "for", "de", "von"];
const ORDINAL_WORDS: &[&str] = &[
    "first", "second", "third", "fourth", "fifth", "sixth", "seventh", "eighth", "ninth", "tenth",
];
const SCALES: &[&str] = &["thousand", "million", "billion", "trillion"];
const CURRENCY_WORDS: &[&str] = &["dollars", "euros", "pounds", "yen", "usd", "eur", "gbp"];

/// Pattern-based tagger with no model behind it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleTagger;

struct Token<'a> {
    word: &'a str,
    start: usize,
    end: usize,
    /// Punctuation after the word closes a clause.
    closes: bool,
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                out.extend(token(text, s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        out.extend(token(text, s, text.len()));
    }
    out
}

fn token(text: &str, start: usize, end: usize) -> Option<Token<'_>> {
    let raw = &text[start..end];
    let lead = raw.len()
        - raw
            .trim_start_matches(|c: char| !c.is_alphanumeric() && !matches!(c, '$' | '€' | '£'))
            .len();
    let body = raw[lead..].trim_end_matches(|c: char| !c.is_alphanumeric() && c != '%');
    if body.is_empty() {
        return None;
    }
    let tail = &raw[lead + body.len()..];
    Some(Token {
        word: body,
        start: start + lead,
        end: start + lead + body.len(),
        closes: tail.contains(['.', ',', ';', ':', '!', '?']),
    })
}

fn is_number(word: &str) -> bool {
    word.starts_with(|c: char| c.is_ascii_digit())
        && word.chars().all(|c| c.is_ascii_digit() || c == ',' || c == '.')
}

fn is_year(word: &str) -> bool {
    word.len() == 4 && word.parse::<u32>().is_ok_and(|y| (1000..=2999).contains(&y))
}

fn is_day(word: &str) -> bool {
    word.parse::<u32>().is_ok_and(|d| (1..=31).contains(&d))
}

fn is_ordinal(word: &str) -> bool {
    let lower = word.to_ascii_lowercase();
    if ORDINAL_WORDS.contains(&lower.as_str()) {
        return true;
    }
    ["st", "nd", "rd", "th"].iter().any(|suffix| {
        lower
            .strip_suffix(suffix)
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
    })
}

fn is_capitalized(word: &str) -> bool {
    word.chars().next().is_some_and(char::is_uppercase)
}

fn one_of(word: &str, set: &[&str]) -> bool {
    set.iter().any(|w| w.eq_ignore_ascii_case(word))
}

impl RuleTagger {
    /// Length in tokens of a numeric entity starting at `i`, with its label.
    fn numeric(tokens: &[Token<'_>], i: usize) -> Option<(usize, &'static str)> {
        let word = tokens[i].word;
        let next = tokens.get(i + 1).filter(|_| !tokens[i].closes).map(|t| t.word);
        let scaled = |len: usize| match tokens.get(i + len - 1) {
            Some(last) if !last.closes => match tokens.get(i + len) {
                Some(t) if one_of(t.word, SCALES) => len + 1,
                _ => len,
            },
            _ => len,
        };

        if let Some(amount) = word.strip_prefix(['$', '€', '£']) {
            if is_number(amount) {
                return Some((scaled(1), MONEY));
            }
        }
        if let Some(amount) = word.strip_suffix('%') {
            if is_number(amount) {
                return Some((1, PERCENT));
            }
        }
        if MONTHS.contains(&word) {
            let mut len = 1;
            while len < 3 {
                let prev = &tokens[i + len - 1];
                match tokens.get(i + len) {
                    // "March 5, 2024": a comma may sit between day and year
                    Some(t) if !prev.closes || (len == 2 && is_year(t.word)) => {
                        if !is_day(t.word) && !is_year(t.word) {
                            break;
                        }
                        len += 1;
                    }
                    _ => break,
                }
            }
            // a bare "May" or "March" is more often the verb
            return (len > 1 || (word.len() > 3 && word != "March")).then_some((len, DATE));
        }
        if is_ordinal(word) {
            return Some((1, ORDINAL));
        }
        if !is_number(word) {
            return None;
        }
        if let Some(next) = next {
            if one_of(next, &["percent"]) {
                return Some((2, PERCENT));
            }
            if is_day(word) && MONTHS.contains(&next) {
                let with_year = !tokens[i + 1].closes
                    && tokens.get(i + 2).is_some_and(|t| is_year(t.word));
                return Some((if with_year { 3 } else { 2 }, DATE));
            }
        }
        let len = scaled(1);
        if let Some(unit) = tokens.get(i + len).filter(|_| !tokens[i + len - 1].closes) {
            if one_of(unit.word, CURRENCY_WORDS) {
                return Some((len + 1, MONEY));
            }
        }
        if len == 1 && is_year(word) {
            return Some((1, DATE));
        }
        Some((len, CARDINAL))
    }

    /// Length of a capitalized run starting at `i` and its label, if the
    /// context names one.
    fn name(tokens: &[Token<'_>], i: usize) -> (usize, Option<(usize, &'static str)>) {
        let first = tokens[i].word;
        let mut len = 1;
        // "Dr." does not end the run it opens
        while !tokens[i + len - 1].closes || (len == 1 && TITLES.contains(&first)) {
            match tokens.get(i + len) {
                Some(t) if is_capitalized(t.word) => len += 1,
                Some(t)
                    if one_of(t.word, CONNECTORS)
                        && !t.closes
                        && tokens.get(i + len + 1).is_some_and(|n| is_capitalized(n.word)) =>
                {
                    len += 2
                }
                _ => break,
            }
        }

        let last = tokens[i + len - 1].word;
        if TITLES.contains(&first) && len > 1 {
            return (len, Some((1, PERSON)));
        }
        if ORG_SUFFIXES.contains(&last) && len > 1 {
            return (len, Some((0, ORG)));
        }
        let after_locative = i > 0
            && !tokens[i - 1].closes
            && LOCATIVES.contains(&tokens[i - 1].word);
        if after_locative {
            return (len, Some((0, GPE)));
        }
        (len, None)
    }
}

impl EntityTagger for RuleTagger {
    fn entities(&self, text: &str) -> Vec<Entity> {
        let tokens = tokenize(text);
        let mut out = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            if let Some((len, label)) = Self::numeric(&tokens, i) {
                let end = tokens[i + len - 1].end;
                out.push(Entity::new(&text[tokens[i].start..end], label));
                i += len;
                continue;
            }
            if is_capitalized(tokens[i].word) {
                let (len, found) = Self::name(&tokens, i);
                if let Some((skip, label)) = found {
                    let end = tokens[i + len - 1].end;
                    out.push(Entity::new(&text[tokens[i + skip].start..end], label));
                }
                i += len;
                continue;
            }
            i += 1;
        }
        out
    }
}
