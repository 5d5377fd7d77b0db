//! Tier 2: bigram validation of OCR text
//!
//! Each adjacent word pair contributes a perplexity:
//!
//! | pair | contribution |
//! |---|---|
//! | known-bad (listed, below the probability floor, or containing a known OCR artifact) | `bad_pair_penalty` |
//! | known-good with probability `p` | `1 / p` |
//! | unseen | `neutral_perplexity` |
//!
//! The score is the arithmetic mean. A score exactly on the neutral value
//! (text made only of unseen pairs, for one) is reported as inconclusive
//! rather than accepted or rejected on vocabulary gaps alone.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Scores closer than this to `neutral_perplexity` count as neutral
const NEUTRAL_EPSILON: f64 = 1e-9;

/// Built-in pair probabilities for common English
const BUILTIN_PAIRS: &[(&str, &str, f64)] = &[
    ("i'm", "not", 0.08),
    ("not", "even", 0.05),
    ("even", "mad", 0.02),
    ("i", "am", 0.12),
    ("am", "not", 0.06),
    ("it", "is", 0.15),
    ("is", "a", 0.12),
    ("is", "the", 0.10),
    ("is", "not", 0.08),
    ("of", "the", 0.25),
    ("in", "the", 0.22),
    ("on", "the", 0.15),
    ("to", "the", 0.15),
    ("at", "the", 0.12),
    ("for", "the", 0.10),
    ("from", "the", 0.08),
    ("and", "the", 0.06),
    ("with", "the", 0.06),
    ("back", "of", 0.04),
    ("out", "of", 0.20),
    ("one", "of", 0.15),
    ("all", "of", 0.10),
    ("part", "of", 0.15),
    ("the", "net", 0.01),
    ("the", "end", 0.02),
    ("the", "best", 0.02),
    ("the", "world", 0.02),
    ("the", "same", 0.02),
    ("do", "not", 0.15),
    ("does", "not", 0.15),
    ("can", "not", 0.03),
    ("will", "be", 0.20),
    ("to", "be", 0.10),
    ("it", "was", 0.10),
    ("there", "is", 0.10),
    ("this", "is", 0.15),
    ("that", "is", 0.08),
    ("what", "is", 0.10),
    ("you", "are", 0.12),
    ("we", "are", 0.12),
    ("they", "are", 0.12),
    ("thank", "you", 0.40),
    ("how", "to", 0.10),
    ("want", "to", 0.30),
    ("going", "to", 0.40),
    ("have", "to", 0.10),
    ("need", "to", 0.20),
    ("click", "here", 0.10),
    ("sign", "in", 0.30),
    ("log", "in", 0.30),
    ("learn", "more", 0.30),
    ("read", "more", 0.20),
];

/// Pairs that are far rarer than their surface form suggests
const BUILTIN_BAD_PAIRS: &[(&str, &str)] = &[
    ("back", "bf"),
    ("of", "of"),
    ("the", "the"),
    ("a", "the"),
    ("the", "a"),
];

/// Frequent OCR misreadings and the words they usually stand for
const BUILTIN_CONFUSIONS: &[(&str, &[&str])] = &[
    ("bf", &["of"]),
    ("0f", &["of"]),
    ("ot", &["of", "to"]),
    ("tbe", &["the"]),
    ("tne", &["the"]),
    ("lhe", &["the"]),
    ("tbat", &["that"]),
    ("wbat", &["what"]),
    ("1s", &["is"]),
    ("1t", &["it"]),
    ("0n", &["on"]),
    ("t0", &["to"]),
];

/// How one word pair was classified
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum PairClass {
    KnownGood { probability: f64 },
    KnownBad,
    Unseen,
}

/// Score of one adjacent pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairScore {
    pub left: String,
    pub right: String,
    #[serde(flatten)]
    pub class: PairClass,
    pub perplexity: f64,
}

/// One proposed word substitution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    /// Token index in the whitespace-split text
    pub position: usize,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier2Outcome {
    /// Low perplexity, nothing to correct
    Validated,
    /// High perplexity or a correction was proposed
    Suspicious,
    /// Score sits exactly on the neutral baseline with nothing to correct,
    /// as when every pair is unseen
    Inconclusive,
}

/// Tier-2 scoring thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct BigramSettings {
    pub perplexity_ceiling: f64,
    pub neutral_perplexity: f64,
    pub known_bad_floor: f64,
    pub bad_pair_penalty: f64,
}

impl Default for BigramSettings {
    fn default() -> Self {
        Self {
            perplexity_ceiling: 60.0,
            neutral_perplexity: 50.0,
            known_bad_floor: 0.001,
            bad_pair_penalty: 1000.0,
        }
    }
}

impl From<&crate::config::AnalysisConfig> for BigramSettings {
    fn from(config: &crate::config::AnalysisConfig) -> Self {
        Self {
            perplexity_ceiling: config.perplexity_ceiling,
            neutral_perplexity: config.neutral_perplexity,
            known_bad_floor: config.known_bad_floor,
            bad_pair_penalty: config.bad_pair_penalty,
        }
    }
}

/// Tier-2 verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier2Result {
    pub outcome: Tier2Outcome,
    /// Mean pair perplexity
    pub score: f64,
    pub pairs: Vec<PairScore>,
    pub corrections: Vec<Correction>,
    /// Input with all corrections applied, if any were proposed
    pub corrected_text: Option<String>,
}

impl Tier2Result {
    pub fn correction_proposed(&self) -> bool {
        !self.corrections.is_empty()
    }
}

/// Bigram language model with an OCR confusion table
#[derive(Debug, Clone, Default)]
pub struct BigramModel {
    good: HashMap<(String, String), f64>,
    bad: HashSet<(String, String)>,
    confusions: HashMap<String, Vec<String>>,
}

/// Lowercase a token and strip surrounding punctuation, keeping inner
/// apostrophes ("I'm," -> "i'm")
pub fn normalize_word(token: &str) -> String {
    token
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

impl BigramModel {
    /// Empty model: every pair is unseen
    pub fn new() -> Self {
        Self::default()
    }

    /// Model seeded with the built-in English tables
    pub fn builtin() -> Self {
        let mut model = Self::new();
        for &(a, b, p) in BUILTIN_PAIRS {
            model.add_pair(a, b, p);
        }
        for &(a, b) in BUILTIN_BAD_PAIRS {
            model.add_bad_pair(a, b);
        }
        for &(from, to) in BUILTIN_CONFUSIONS {
            for candidate in to {
                model.add_confusion(from, *candidate);
            }
        }
        model
    }

    pub fn add_pair(&mut self, left: &str, right: &str, probability: f64) {
        self.good
            .insert((normalize_word(left), normalize_word(right)), probability);
    }

    pub fn add_bad_pair(&mut self, left: &str, right: &str) {
        self.bad.insert((normalize_word(left), normalize_word(right)));
    }

    pub fn add_confusion(&mut self, misread: &str, intended: &str) {
        self.confusions
            .entry(normalize_word(misread))
            .or_default()
            .push(normalize_word(intended));
    }

    pub fn classify(&self, left: &str, right: &str, known_bad_floor: f64) -> PairClass {
        let key = (left.to_string(), right.to_string());
        if self.bad.contains(&key) {
            return PairClass::KnownBad;
        }
        if let Some(&p) = self.good.get(&key) {
            return if p < known_bad_floor {
                PairClass::KnownBad
            } else {
                PairClass::KnownGood { probability: p }
            };
        }
        if self.confusions.contains_key(left) || self.confusions.contains_key(right) {
            return PairClass::KnownBad;
        }
        PairClass::Unseen
    }

    fn is_known_good(&self, left: &str, right: &str, floor: f64) -> bool {
        matches!(self.classify(left, right, floor), PairClass::KnownGood { .. })
    }

    /// Score `text` and propose corrections for known-bad pairs
    ///
    /// Pairs never span a line break; OCR lines are read independently.
    pub fn evaluate(&self, text: &str, settings: &BigramSettings) -> Tier2Result {
        let tokens = tokenize(text);
        // Pair only tokens that still contain a word after normalization
        let words: Vec<(usize, usize, String)> = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (i, t.line, normalize_word(t.text)))
            .filter(|(_, _, w)| !w.is_empty())
            .collect();

        let mut pairs = Vec::new();
        let mut corrections: Vec<Correction> = Vec::new();

        for (idx, window) in words.windows(2).enumerate() {
            let (_, left_line, left) = &window[0];
            let (right_pos, right_line, right) = &window[1];
            if left_line != right_line {
                continue;
            }
            let class = self.classify(left, right, settings.known_bad_floor);
            let perplexity = match class {
                PairClass::KnownBad => settings.bad_pair_penalty,
                PairClass::KnownGood { probability } => 1.0 / probability,
                PairClass::Unseen => settings.neutral_perplexity,
            };

            if class == PairClass::KnownBad
                && !corrections.iter().any(|c| c.position == *right_pos)
            {
                let next = words
                    .get(idx + 2)
                    .filter(|(_, line, _)| line == right_line)
                    .map(|(_, _, w)| w.as_str());
                if let Some(candidate) = self.correction_for(left, right, next, settings) {
                    corrections.push(Correction {
                        position: *right_pos,
                        from: tokens[*right_pos].text.to_string(),
                        to: candidate,
                    });
                }
            }

            pairs.push(PairScore {
                left: left.clone(),
                right: right.clone(),
                class,
                perplexity,
            });
        }

        let score = if pairs.is_empty() {
            settings.neutral_perplexity
        } else {
            pairs.iter().map(|p| p.perplexity).sum::<f64>() / pairs.len() as f64
        };
        let neutral = (score - settings.neutral_perplexity).abs() < NEUTRAL_EPSILON;

        let outcome = if corrections.is_empty() && neutral {
            Tier2Outcome::Inconclusive
        } else if score < settings.perplexity_ceiling && corrections.is_empty() {
            Tier2Outcome::Validated
        } else {
            Tier2Outcome::Suspicious
        };

        let corrected_text = if corrections.is_empty() {
            None
        } else {
            Some(apply_corrections(text, &tokens, &corrections))
        };

        Tier2Result {
            outcome,
            score,
            pairs,
            corrections,
            corrected_text,
        }
    }

    /// Confusion candidate for `right` that forms a known-good pair with the
    /// previous word, or failing that with the following word
    fn correction_for(
        &self,
        left: &str,
        right: &str,
        next: Option<&str>,
        settings: &BigramSettings,
    ) -> Option<String> {
        let candidates = self.confusions.get(right)?;
        let floor = settings.known_bad_floor;
        candidates
            .iter()
            .find(|c| self.is_known_good(left, c, floor))
            .or_else(|| {
                let next = next?;
                candidates.iter().find(|c| self.is_known_good(c, next, floor))
            })
            .cloned()
    }
}

/// Whitespace-delimited token with its byte offset and line number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Token<'a> {
    text: &'a str,
    start: usize,
    line: usize,
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut line = 0;
    let mut start: Option<usize> = None;
    for (i, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                tokens.push(Token { text: &text[s..i], start: s, line });
            }
            if ch == '\n' {
                line += 1;
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        tokens.push(Token { text: &text[s..], start: s, line });
    }
    tokens
}

/// Substitute the word inside `token`, keeping surrounding punctuation and
/// an all-caps spelling
fn replace_word(token: &str, word: &str) -> String {
    let start = token.find(|ch: char| ch.is_alphanumeric()).unwrap_or(0);
    let end = token
        .rfind(|ch: char| ch.is_alphanumeric())
        .map(|e| e + token[e..].chars().next().map_or(1, char::len_utf8))
        .unwrap_or(token.len());
    let core = &token[start..end];
    let replacement = if core.len() > 1 && core.chars().all(|ch| !ch.is_lowercase()) {
        word.to_uppercase()
    } else {
        word.to_string()
    };
    format!("{}{}{}", &token[..start], replacement, &token[end..])
}

/// Rebuild `text` with substituted words; separators are copied unchanged
fn apply_corrections(text: &str, tokens: &[Token<'_>], corrections: &[Correction]) -> String {
    let mut ordered: Vec<&Correction> = corrections.iter().collect();
    ordered.sort_by_key(|c| c.position);

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for correction in ordered {
        let Some(token) = tokens.get(correction.position) else {
            continue;
        };
        out.push_str(&text[cursor..token.start]);
        out.push_str(&replace_word(token.text, &correction.to));
        cursor = token.start + token.text.len();
    }
    out.push_str(&text[cursor..]);
    out
}
