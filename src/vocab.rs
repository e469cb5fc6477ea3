use crate::error::{Result, TrainError};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const START_WORD: &str = "<S>";
pub const END_WORD: &str = "</S>";
pub const UNK_WORD: &str = "<UNK>";

/// Read-only mapping between token ids and words.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    words: Vec<String>,
    ids: HashMap<String, usize>,
    start_id: usize,
    end_id: usize,
    unk_id: usize,
}

impl Vocabulary {
    /// Load a `word count` per line vocabulary file; the id of a word is its line index.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| TrainError::io(path, err))?;
        let words = contents
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect::<Vec<_>>();
        let vocab = Self::from_words(words)?;
        tracing::info!("created vocabulary with {} words", vocab.len());
        Ok(vocab)
    }

    /// Build a vocabulary from an ordered word list, appending `<UNK>` when missing.
    pub fn from_words(mut words: Vec<String>) -> Result<Self> {
        if !words.iter().any(|w| w == UNK_WORD) {
            words.push(UNK_WORD.to_string());
        }
        let mut ids = HashMap::with_capacity(words.len());
        for (id, word) in words.iter().enumerate() {
            // Keep the first occurrence if the file repeats a word.
            ids.entry(word.clone()).or_insert(id);
        }
        let lookup = |word: &str| {
            ids.get(word).copied().ok_or_else(|| {
                TrainError::Config(format!("vocabulary has no {word} entry"))
            })
        };
        let start_id = lookup(START_WORD)?;
        let end_id = lookup(END_WORD)?;
        let unk_id = lookup(UNK_WORD)?;

        Ok(Self {
            words,
            ids,
            start_id,
            end_id,
            unk_id,
        })
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn start_id(&self) -> usize {
        self.start_id
    }

    pub fn end_id(&self) -> usize {
        self.end_id
    }

    pub fn unk_id(&self) -> usize {
        self.unk_id
    }

    pub fn word_to_id(&self, word: &str) -> usize {
        self.ids.get(word).copied().unwrap_or(self.unk_id)
    }

    /// Out-of-range ids map to `<UNK>`.
    pub fn id_to_word(&self, id: usize) -> &str {
        self.words
            .get(id)
            .map(String::as_str)
            .unwrap_or(UNK_WORD)
    }
}
