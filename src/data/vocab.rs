use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

pub const UNK_TOKEN: &str = "<unk>";
pub const PAD_TOKEN: &str = "<pad>";

/// Bidirectional token <-> index mapping with corpus frequencies.
///
/// Text vocabularies reserve index 0 for `<unk>` and index 1 for `<pad>`,
/// which is why the trainer's default `padding_idx` is 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub itos: Vec<String>,
    pub stoi: BTreeMap<String, usize>,
    pub freqs: BTreeMap<String, usize>,
    unk_index: Option<usize>,
}

impl Vocabulary {
    /// Builds a text vocabulary from tokenized sentences. Tokens seen fewer
    /// than `min_freq` times map to `<unk>`. Ordering is by descending
    /// frequency, then alphabetically.
    pub fn build_text<'a, I, S>(sentences: I, min_freq: usize) -> Vocabulary
    where
        I: IntoIterator<Item = S>,
        S: IntoIterator<Item = &'a str>,
    {
        let freqs = count(sentences.into_iter().flatten());
        let mut vocab = Vocabulary::from_specials(&[UNK_TOKEN, PAD_TOKEN], freqs);
        vocab.unk_index = Some(0);
        vocab.extend_by_frequency(min_freq);
        vocab
    }

    /// Builds a label vocabulary (no special tokens).
    pub fn build_labels<'a, I>(labels: I) -> Vocabulary
    where
        I: IntoIterator<Item = &'a str>,
    {
        let freqs = count(labels);
        let mut vocab = Vocabulary::from_specials(&[], freqs);
        vocab.extend_by_frequency(1);
        vocab
    }

    fn from_specials(specials: &[&str], freqs: BTreeMap<String, usize>) -> Vocabulary {
        let itos: Vec<String> = specials.iter().map(|s| s.to_string()).collect();
        let stoi = itos.iter().enumerate().map(|(i, s)| (s.clone(), i)).collect();
        Vocabulary { itos, stoi, freqs, unk_index: None }
    }

    fn extend_by_frequency(&mut self, min_freq: usize) {
        let mut ranked: Vec<(&String, &usize)> = self.freqs.iter().filter(|(_, &c)| c >= min_freq).collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (token, _) in ranked {
            if !self.stoi.contains_key(token) {
                self.stoi.insert(token.clone(), self.itos.len());
                self.itos.push(token.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.itos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.itos.is_empty()
    }

    /// Index of `token`, falling back to `<unk>` for text vocabularies.
    pub fn index(&self, token: &str) -> Option<usize> {
        self.stoi.get(token).copied().or(self.unk_index)
    }

    pub fn encode<'a>(&self, tokens: impl IntoIterator<Item = &'a str>) -> Vec<usize> {
        tokens.into_iter().filter_map(|t| self.index(t)).collect()
    }

    pub fn token(&self, index: usize) -> Option<&str> {
        self.itos.get(index).map(String::as_str)
    }
}

fn count<'a>(tokens: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, usize> {
    let mut freqs = BTreeMap::new();
    for token in tokens {
        *freqs.entry(token.to_string()).or_insert(0) += 1;
    }
    freqs
}

/// The text and label vocabularies of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fields {
    pub text: Vocabulary,
    pub label: Vocabulary,
}
