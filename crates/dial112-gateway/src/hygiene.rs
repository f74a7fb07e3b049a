//! Transcript filtering ahead of the dialogue step.
//!
//! Recognizers fed with line noise tend to emit very short fragments or loop
//! on one word or phrase. Such transcripts are dropped instead of being
//! answered.

use std::collections::HashMap;

/// Transcripts this short or shorter carry no content.
pub const MIN_TRANSCRIPT_CHARS: usize = 2;

/// Return the trimmed transcript if it is worth answering.
pub fn clean_transcript(raw: &str) -> Option<String> {
    let text = raw.trim();
    if text.chars().count() <= MIN_TRANSCRIPT_CHARS {
        return None;
    }
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();
    if is_excessive_repetition(&words) {
        return None;
    }
    Some(text.to_string())
}

/// One word making up more than 60% of at least four words, or any
/// three-word phrase occurring more than twice in at least six words.
pub fn is_excessive_repetition<S: AsRef<str>>(words: &[S]) -> bool {
    if words.len() < 4 {
        return false;
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for word in words {
        *counts.entry(word.as_ref()).or_default() += 1;
    }
    let max_word = counts.values().copied().max().unwrap_or(0);
    if max_word as f64 > words.len() as f64 * 0.6 {
        return true;
    }

    if words.len() >= 6 {
        let mut phrases: HashMap<[&str; 3], usize> = HashMap::new();
        for w in words.windows(3) {
            *phrases
                .entry([w[0].as_ref(), w[1].as_ref(), w[2].as_ref()])
                .or_default() += 1;
        }
        if phrases.values().any(|&n| n > 2) {
            return true;
        }
    }

    false
}
