//! Best-effort text checks run on generated prose.
//!
//! Both checks are plain `text -> bool` predicates so they can be swapped
//! out per narrator. False positives and negatives are accepted.

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// A pluggable check over a piece of text.
pub type TextPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Text shorter than this is never treated as truncated.
pub const TRUNCATION_MIN_CHARS: usize = 200;

/// Glyphs that may legitimately end a finished passage.
const TERMINATORS: &[char] = &['.', '!', '?', '…', '"', '\'', '”', '’', '»'];

lazy_static! {
    static ref DEATH_PHRASE: Regex = Regex::new(
        r"(?i)\b(?:você\s+morre(?:u)?|eu\s+morr[io]|you\s+die(?:d)?|i\s+die(?:d)?)\b"
    )
    .expect("death phrase pattern is valid");
}

/// The pair of checks the narrator consults after each generation.
#[derive(Clone)]
pub struct Heuristics {
    /// Does this freshly generated text kill the first-person protagonist?
    pub is_death: TextPredicate,
    /// Does the accumulated chapter text look cut off mid-sentence?
    pub is_incomplete: TextPredicate,
}

impl Heuristics {
    pub fn with_death(mut self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.is_death = Arc::new(predicate);
        self
    }

    pub fn with_incomplete(
        mut self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_incomplete = Arc::new(predicate);
        self
    }

    pub fn death(&self, text: &str) -> bool {
        (self.is_death)(text)
    }

    pub fn incomplete(&self, text: &str) -> bool {
        (self.is_incomplete)(text)
    }
}

impl Default for Heuristics {
    fn default() -> Self {
        Self {
            is_death: Arc::new(mentions_protagonist_death),
            is_incomplete: Arc::new(looks_truncated),
        }
    }
}

impl fmt::Debug for Heuristics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heuristics").finish_non_exhaustive()
    }
}

/// Whether the text narrates the death of a first-person protagonist.
///
/// Matches Portuguese and English phrasings, case-insensitively.
pub fn mentions_protagonist_death(text: &str) -> bool {
    DEATH_PHRASE.is_match(text)
}

/// Whether the text seems to stop before its sentence did.
pub fn looks_truncated(text: &str) -> bool {
    let text = text.trim_end();
    if text.chars().count() <= TRUNCATION_MIN_CHARS {
        return false;
    }
    match text.chars().last() {
        Some(last) => !TERMINATORS.contains(&last),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(ending: &str) -> String {
        format!("{}{}", "a maré subia devagar ".repeat(12), ending)
    }

    #[test]
    fn test_death_phrases_portuguese_and_english() {
        assert!(mentions_protagonist_death("...e então você morre."));
        assert!(mentions_protagonist_death("Naquela noite eu morri sem saber."));
        assert!(mentions_protagonist_death("VOCÊ MORREU."));
        assert!(mentions_protagonist_death("And then you die."));
        assert!(mentions_protagonist_death("I died in the snow."));
    }

    #[test]
    fn test_death_phrases_need_word_boundaries() {
        assert!(!mentions_protagonist_death("Mishi dies alone."));
        assert!(!mentions_protagonist_death("Você morava perto do porto."));
        assert!(!mentions_protagonist_death("Ela sobreviveu."));
    }

    #[test]
    fn test_truncation_requires_length() {
        assert!(!looks_truncated(""));
        assert!(!looks_truncated("curto e sem ponto"));
        assert!(looks_truncated(&long("e então ela")));
    }

    #[test]
    fn test_truncation_accepts_terminators() {
        assert!(!looks_truncated(&long("fim.")));
        assert!(!looks_truncated(&long("fim!  \n")));
        assert!(!looks_truncated(&long("— Quem está aí?”")));
        assert!(!looks_truncated(&long("«Corra»")));
    }

    #[test]
    fn test_heuristics_are_pluggable() {
        let heuristics = Heuristics::default()
            .with_death(|text| text.contains("FIM"))
            .with_incomplete(|_| true);
        assert!(heuristics.death("FIM"));
        assert!(!heuristics.death("você morre"));
        assert!(heuristics.incomplete("anything"));
    }
}
