//! A tiny built-in sentiment corpus, enough to exercise the trainer end to end.

use crate::data::iterator::Example;
use crate::data::vocab::{Fields, Vocabulary};

const SENTENCES: &[(&str, &str)] = &[
    ("pos", "a warm , funny and moving film"),
    ("neg", "a dull and lifeless script"),
    ("pos", "the cast is wonderful and the story delights"),
    ("neg", "the plot is a tedious mess"),
    ("pos", "one of the best films of the year"),
    ("neg", "one of the worst films of the year"),
    ("pos", "smart , charming and beautifully shot"),
    ("neg", "clumsy , boring and badly acted"),
    ("pos", "i loved every minute of it"),
    ("neg", "i hated every minute of it"),
    ("pos", "a great and joyful surprise"),
    ("neg", "a bad and joyless chore"),
    ("pos", "the performances are superb"),
    ("neg", "the performances are awful"),
    ("pos", "funny , touching and wonderful"),
    ("neg", "tedious , dull and awful"),
    ("pos", "an excellent , moving drama"),
    ("neg", "a lifeless , boring drama"),
    ("pos", "beautifully acted and great fun"),
    ("neg", "badly written and no fun"),
    ("pos", "a delight from start to finish"),
    ("neg", "a mess from start to finish"),
    ("pos", "charming and smart"),
    ("neg", "boring and clumsy"),
    ("pos", "superb direction and a great score"),
    ("neg", "awful direction and a dull score"),
    ("pos", "the best comedy in years"),
    ("neg", "the worst comedy in years"),
    ("pos", "wonderful , warm and funny"),
    ("neg", "tedious , cold and dull"),
];

/// Lowercased whitespace tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// The corpus split into train / validation / test examples.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub fields: Fields,
    pub train: Vec<Example>,
    pub validation: Vec<Example>,
    pub test: Vec<Example>,
}

/// Builds vocabularies from the training split and encodes every split.
/// Pairs 0..10 train, 10..13 validate, the rest test (one pair = one
/// positive and one negative sentence).
pub fn sentiment_dataset() -> Dataset {
    let tokenized: Vec<(&str, Vec<String>)> = SENTENCES.iter().map(|(label, text)| (*label, tokenize(text))).collect();
    let (train_raw, rest) = tokenized.split_at(20);
    let (val_raw, test_raw) = rest.split_at(6);

    let text = Vocabulary::build_text(train_raw.iter().map(|(_, tokens)| tokens.iter().map(String::as_str)), 1);
    let label = Vocabulary::build_labels(tokenized.iter().map(|(label, _)| *label));

    let encode = |raw: &[(&str, Vec<String>)]| -> Vec<Example> {
        raw.iter()
            .filter_map(|(l, tokens)| {
                let label = label.index(l)?;
                Some(Example::new(text.encode(tokens.iter().map(String::as_str)), label))
            })
            .collect()
    };
    let (train, validation, test) = (encode(train_raw), encode(val_raw), encode(test_raw));
    Dataset { fields: Fields { text, label }, train, validation, test }
}
