//! Tokenizer collaborator.
//!
//! The PPO loop only needs to move between the policy's token space and the
//! scorer's text space, so the contract is `encode`/`decode`.
//! `HfTokenizer` loads a `tokenizer.json`; `WordTokenizer` is a small
//! in-memory vocabulary for demos and tests.

use crate::{Result, RlhfError};
use std::collections::HashMap;
use std::path::Path;

/// Bridge between token ids and text.
pub trait Tokenizer {
    /// Encode text to token IDs.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token IDs to text.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Get vocabulary size.
    fn vocab_size(&self) -> usize;
}

/// Wrapper around the tokenizers library.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    /// Load a tokenizer from a local `tokenizer.json`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| RlhfError::Tokenizer(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Load a tokenizer from serialized bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes)
            .map_err(|e| RlhfError::Tokenizer(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Get the underlying tokenizer.
    pub fn inner(&self) -> &tokenizers::Tokenizer {
        &self.inner
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| RlhfError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| RlhfError::Tokenizer(e.to_string()))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

/// Whitespace tokenizer over a fixed vocabulary.
///
/// Id 0 is reserved for unknown words.
#[derive(Clone, Debug)]
pub struct WordTokenizer {
    words: Vec<String>,
    ids: HashMap<String, u32>,
}

impl WordTokenizer {
    pub const UNK: &'static str = "<unk>";
    pub const UNK_ID: u32 = 0;

    /// Build a vocabulary from every distinct whitespace-separated word in `corpus`.
    pub fn from_corpus<'a>(corpus: impl IntoIterator<Item = &'a str>) -> Self {
        let mut words = vec![Self::UNK.to_string()];
        let mut ids = HashMap::new();
        ids.insert(Self::UNK.to_string(), Self::UNK_ID);

        for text in corpus {
            for word in text.split_whitespace() {
                if !ids.contains_key(word) {
                    ids.insert(word.to_string(), words.len() as u32);
                    words.push(word.to_string());
                }
            }
        }

        Self { words, ids }
    }

    /// Look up a single word.
    pub fn token_to_id(&self, word: &str) -> Option<u32> {
        self.ids.get(word).copied()
    }
}

impl Tokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .split_whitespace()
            .map(|word| self.ids.get(word).copied().unwrap_or(Self::UNK_ID))
            .collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let words = ids
            .iter()
            .map(|&id| {
                self.words
                    .get(id as usize)
                    .map(String::as_str)
                    .ok_or_else(|| {
                        RlhfError::Tokenizer(format!(
                            "token id {id} outside vocabulary of {}",
                            self.words.len()
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(words.join(" "))
    }

    fn vocab_size(&self) -> usize {
        self.words.len()
    }
}
