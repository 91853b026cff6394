//! Placeholder and joke locations that are not worth a geocoding call.
//!
//! Matching is case-insensitive. `substrings` match anywhere in the text,
//! `words` only match a whole token, so "no" filters "no" and "No, thanks" but
//! leaves "Reno" and "Norway" alone. Tokens are runs of alphanumerics and `/`,
//! which keeps entries such as "n/a" matchable as one word. This is a
//! heuristic and borderline inputs can still be filtered.

const DEFAULT_SUBSTRINGS: &[&str] = &["nowhere", "hq", "chillin", "cat kingdom"];
const DEFAULT_WORDS: &[&str] = &["no"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Denylist {
    substrings: Vec<String>,
    words: Vec<String>,
}

impl Default for Denylist {
    fn default() -> Self {
        Self {
            substrings: DEFAULT_SUBSTRINGS.iter().map(|s| s.to_string()).collect(),
            words: DEFAULT_WORDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Denylist {
    pub fn new<S, W>(substrings: S, words: W) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        W: IntoIterator,
        W::Item: Into<String>,
    {
        Self::empty().with_substrings(substrings).with_words(words)
    }

    pub fn empty() -> Self {
        Self {
            substrings: Vec::new(),
            words: Vec::new(),
        }
    }

    pub fn with_substrings<I>(mut self, substrings: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.substrings = normalize_patterns(substrings);
        self
    }

    pub fn with_words<I>(mut self, words: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.words = normalize_patterns(words);
        self
    }

    pub fn len(&self) -> usize {
        self.substrings.len() + self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn matches(&self, location: &str) -> bool {
        let lowered = location.to_lowercase();
        if self
            .substrings
            .iter()
            .any(|pattern| lowered.contains(pattern.as_str()))
        {
            return true;
        }
        if self.words.is_empty() {
            return false;
        }
        lowered
            .split(|c: char| !c.is_alphanumeric() && c != '/')
            .filter(|token| !token.is_empty())
            .any(|token| self.words.iter().any(|word| word == token))
    }
}

fn normalize_patterns<I>(patterns: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    patterns
        .into_iter()
        .map(|p| p.into().trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}
