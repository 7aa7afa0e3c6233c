// Product Title Tokenizer
// The default lexeme splitter for short catalogue records

use once_cell::sync::Lazy;
use regex::Regex;

use crate::contracts::Tokenizer;

/// A lexeme is kept when it is all lower-case ASCII letters and digits and holds
/// at least one letter or a run of two or more digits
static VALID_LEXEME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]*([a-z]|[0-9]{2})[a-z0-9]*$").expect("lexeme pattern is valid")
});

/// Runs of whitespace, symbol and punctuation characters
static SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s\p{S}\p{P}]+").expect("separator pattern is valid"));

/// Lower-cases input, splits on whitespace, punctuation and symbols, and drops
/// parts failing the validity check
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductTitleTokenizer;

impl ProductTitleTokenizer {
    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for ProductTitleTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        SEPARATORS
            .split(&lowered)
            .filter(|part| VALID_LEXEME.is_match(part))
            .map(str::to_string)
            .collect()
    }
}
