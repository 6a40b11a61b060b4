//! WordPiece tokenizer with BERT-style normalization.
//!
//! Loads its vocabulary and settings from the sidecar files shipped next to
//! the ONNX model (`vocab.txt`, `tokenizer_config.json`,
//! `special_tokens_map.json`) and produces fixed-length encodings for the
//! embedding and reranking sessions. Stateless after construction; shared
//! read-only across tasks.

use crate::error::{RagError, RagResult};
use std::collections::HashMap;
use std::path::Path;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use unicode_properties::{GeneralCategory, GeneralCategoryGroup, UnicodeGeneralCategory};

/// Fixed-length encoding: all three arrays are exactly `max_seq_len` long,
/// with `attention_mask = 0` past `effective_len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoding {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub token_type_ids: Vec<i64>,
    pub effective_len: usize,
}

#[derive(Debug, Clone)]
pub struct TokenizerOptions {
    pub do_lower_case: bool,
    /// `None` follows `do_lower_case`, matching the published contract.
    pub strip_accents: Option<bool>,
    pub tokenize_chinese_chars: bool,
    pub max_input_chars_per_word: usize,
    pub continuing_subword_prefix: String,
    pub max_seq_len: usize,
    pub cls_token: String,
    pub sep_token: String,
    pub pad_token: String,
    pub unk_token: String,
    pub pad_token_type_id: i64,
}

impl Default for TokenizerOptions {
    fn default() -> Self {
        Self {
            do_lower_case: true,
            strip_accents: None,
            tokenize_chinese_chars: true,
            max_input_chars_per_word: 100,
            continuing_subword_prefix: "##".to_string(),
            max_seq_len: 512,
            cls_token: "[CLS]".to_string(),
            sep_token: "[SEP]".to_string(),
            pad_token: "[PAD]".to_string(),
            unk_token: "[UNK]".to_string(),
            pad_token_type_id: 0,
        }
    }
}

pub struct WordPieceTokenizer {
    vocab: HashMap<String, i64>,
    ids_to_tokens: HashMap<i64, String>,
    options: TokenizerOptions,
    cls_id: i64,
    sep_id: i64,
    pad_id: i64,
    unk_id: i64,
}

impl WordPieceTokenizer {
    /// Build a tokenizer from an in-memory vocabulary (line order = id).
    pub fn from_vocab<I, S>(tokens: I, options: TokenizerOptions) -> RagResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if options.max_seq_len < 2 {
            return Err(RagError::Config(format!(
                "max_seq_len must be >= 2, got {}",
                options.max_seq_len
            )));
        }

        let mut vocab = HashMap::new();
        let mut ids_to_tokens = HashMap::new();
        for (id, token) in tokens.into_iter().enumerate() {
            let token = token.into();
            let id = id as i64;
            ids_to_tokens.insert(id, token.clone());
            vocab.insert(token, id);
        }

        let special = |name: &str, token: &str| -> RagResult<i64> {
            vocab.get(token).copied().ok_or_else(|| {
                RagError::DataIntegrity(format!(
                    "vocabulary is missing the {} token {:?}",
                    name, token
                ))
            })
        };
        let cls_id = special("CLS", &options.cls_token)?;
        let sep_id = special("SEP", &options.sep_token)?;
        let pad_id = special("PAD", &options.pad_token)?;
        let unk_id = special("UNK", &options.unk_token)?;

        Ok(Self {
            vocab,
            ids_to_tokens,
            options,
            cls_id,
            sep_id,
            pad_id,
            unk_id,
        })
    }

    /// Load vocabulary and settings from the sidecar files next to the model.
    pub fn from_pretrained(model_dir: &Path, max_seq_len: Option<usize>) -> RagResult<Self> {
        let vocab_path = model_dir.join("vocab.txt");
        let config_path = model_dir.join("tokenizer_config.json");
        let special_path = model_dir.join("special_tokens_map.json");
        for path in [&vocab_path, &config_path, &special_path] {
            if !path.exists() {
                return Err(RagError::Config(format!(
                    "tokenizer sidecar file not found: {}",
                    path.display()
                )));
            }
        }

        let vocab_raw = std::fs::read_to_string(&vocab_path)?;
        let config: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
        let special: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&special_path)?)?;

        let defaults = TokenizerOptions::default();
        let special_token = |key: &str, fallback: &str| -> String {
            // special_tokens_map values are either plain strings or
            // `{ "content": "..." }` objects depending on the exporter.
            match special.get(key) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(obj) => obj
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or(fallback)
                    .to_string(),
                None => fallback.to_string(),
            }
        };

        let options = TokenizerOptions {
            do_lower_case: config
                .get("do_lower_case")
                .and_then(|v| v.as_bool())
                .unwrap_or(defaults.do_lower_case),
            strip_accents: config.get("strip_accents").and_then(|v| v.as_bool()),
            tokenize_chinese_chars: config
                .get("tokenize_chinese_chars")
                .and_then(|v| v.as_bool())
                .unwrap_or(defaults.tokenize_chinese_chars),
            max_input_chars_per_word: config
                .get("max_input_chars_per_word")
                .and_then(|v| v.as_u64())
                .unwrap_or(defaults.max_input_chars_per_word as u64)
                as usize,
            continuing_subword_prefix: config
                .get("continuing_subword_prefix")
                .and_then(|v| v.as_str())
                .unwrap_or(&defaults.continuing_subword_prefix)
                .to_string(),
            max_seq_len: max_seq_len.unwrap_or_else(|| {
                config
                    .get("model_max_length")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(defaults.max_seq_len as u64) as usize
            }),
            cls_token: special_token("cls_token", &defaults.cls_token),
            sep_token: special_token("sep_token", &defaults.sep_token),
            pad_token: special_token("pad_token", &defaults.pad_token),
            unk_token: special_token("unk_token", &defaults.unk_token),
            pad_token_type_id: config
                .get("pad_token_type_id")
                .and_then(|v| v.as_i64())
                .unwrap_or(defaults.pad_token_type_id),
        };

        Self::from_vocab(vocab_raw.lines().map(|l| l.trim_end().to_string()), options)
    }

    pub fn max_seq_len(&self) -> usize {
        self.options.max_seq_len
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Encode a single text into a fixed-length sequence.
    pub fn encode(&self, text: &str) -> Encoding {
        self.encode_inner(text, None)
    }

    /// Encode a `(primary, secondary)` pair; token-type-ids distinguish the
    /// two segments.
    pub fn encode_pair(&self, primary: &str, secondary: &str) -> Encoding {
        self.encode_inner(primary, Some(secondary))
    }

    fn encode_inner(&self, primary: &str, secondary: Option<&str>) -> Encoding {
        let mut a_ids = self.tokenize_to_ids(primary);
        let mut b_ids = secondary.map(|s| self.tokenize_to_ids(s));

        // A pair needs [CLS] a [SEP] b [SEP]; when even that skeleton does
        // not fit, the secondary segment is dropped entirely and the
        // encoding collapses to the single-input skeleton.
        if b_ids.is_some() && self.options.max_seq_len < 3 {
            b_ids = None;
        }

        let reserved = if b_ids.is_some() { 3 } else { 2 };
        let budget = self.options.max_seq_len - reserved;
        let empty = Vec::new();
        loop {
            let b_len = b_ids.as_ref().unwrap_or(&empty).len();
            if a_ids.len() + b_len <= budget {
                break;
            }
            // Trim the longer segment, ties go to the primary.
            if a_ids.len() >= b_len {
                a_ids.pop();
            } else if let Some(b) = b_ids.as_mut() {
                b.pop();
            }
        }

        let mut input_ids = Vec::with_capacity(self.options.max_seq_len);
        let mut token_type_ids = Vec::with_capacity(self.options.max_seq_len);
        input_ids.push(self.cls_id);
        input_ids.extend_from_slice(&a_ids);
        input_ids.push(self.sep_id);
        token_type_ids.resize(input_ids.len(), 0);
        if let Some(b) = &b_ids {
            input_ids.extend_from_slice(b);
            input_ids.push(self.sep_id);
            token_type_ids.resize(input_ids.len(), 1);
        }

        let effective_len = input_ids.len();
        let mut attention_mask = vec![1i64; effective_len];
        input_ids.resize(self.options.max_seq_len, self.pad_id);
        attention_mask.resize(self.options.max_seq_len, 0);
        token_type_ids.resize(self.options.max_seq_len, self.options.pad_token_type_id);

        Encoding {
            input_ids,
            attention_mask,
            token_type_ids,
            effective_len,
        }
    }

    /// Reconstruct text from ids, dropping special tokens and folding
    /// continuing-subword pieces back onto their word.
    pub fn decode(&self, ids: &[i64]) -> String {
        let prefix = &self.options.continuing_subword_prefix;
        let mut out = String::new();
        for id in ids {
            if *id == self.cls_id || *id == self.sep_id || *id == self.pad_id {
                continue;
            }
            let Some(token) = self.ids_to_tokens.get(id) else {
                continue;
            };
            if let Some(rest) = token.strip_prefix(prefix.as_str()) {
                out.push_str(rest);
            } else {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(token);
            }
        }
        out
    }

    fn tokenize_to_ids(&self, text: &str) -> Vec<i64> {
        let mut ids = Vec::new();
        for word in self.basic_tokenize(text) {
            self.wordpiece(&word, &mut ids);
        }
        ids
    }

    fn basic_tokenize(&self, text: &str) -> Vec<String> {
        let cleaned = self.clean_text(text);
        let cleaned = if self.options.tokenize_chinese_chars {
            isolate_cjk(&cleaned)
        } else {
            cleaned
        };

        let strip = self.options.strip_accents.unwrap_or(self.options.do_lower_case);
        let mut tokens = Vec::new();
        for raw in cleaned.split(' ').filter(|t| !t.is_empty()) {
            let token = if self.options.do_lower_case {
                raw.to_lowercase()
            } else {
                raw.to_string()
            };
            let token = if strip { strip_accents(&token) } else { token };
            split_on_punctuation(&token, &mut tokens);
        }
        tokens
    }

    fn clean_text(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            if c == '\0' || c == '\u{fffd}' || is_control(c) {
                continue;
            }
            if is_whitespace(c) {
                out.push(' ');
            } else {
                out.push(c);
            }
        }
        out
    }

    /// Greedy longest-match against the vocabulary. A word with no prefix
    /// match at any position resolves to a single unknown token.
    fn wordpiece(&self, word: &str, out: &mut Vec<i64>) {
        let chars: Vec<char> = word.chars().collect();
        if chars.len() > self.options.max_input_chars_per_word {
            out.push(self.unk_id);
            return;
        }

        let mut pieces = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let mut end = chars.len();
            let mut matched = None;
            while start < end {
                let mut candidate: String = chars[start..end].iter().collect();
                if start > 0 {
                    candidate.insert_str(0, &self.options.continuing_subword_prefix);
                }
                if let Some(&id) = self.vocab.get(&candidate) {
                    matched = Some(id);
                    break;
                }
                end -= 1;
            }
            match matched {
                Some(id) => {
                    pieces.push(id);
                    start = end;
                }
                None => {
                    out.push(self.unk_id);
                    return;
                }
            }
        }
        out.extend(pieces);
    }
}

/// Control characters per general category group C, preserving `\t`/`\n`/`\r`.
fn is_control(c: char) -> bool {
    if matches!(c, '\t' | '\n' | '\r') {
        return false;
    }
    c.general_category_group() == GeneralCategoryGroup::Other
}

fn is_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r')
        || c.general_category() == GeneralCategory::SpaceSeparator
}

/// Punctuation: category group P, or the four ASCII symbol ranges that BERT
/// also treats as punctuation.
fn is_punctuation(c: char) -> bool {
    let u = c as u32;
    if (33..=47).contains(&u) || (58..=64).contains(&u) || (91..=96).contains(&u) || (123..=126).contains(&u) {
        return true;
    }
    c.general_category_group() == GeneralCategoryGroup::Punctuation
}

fn strip_accents(token: &str) -> String {
    token.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

fn split_on_punctuation(token: &str, out: &mut Vec<String>) {
    let mut current = String::new();
    for c in token.chars() {
        if is_punctuation(c) {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            out.push(c.to_string());
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
}

const CJK_BLOCKS: &[(u32, u32)] = &[
    (0x4E00, 0x9FFF),
    (0x3400, 0x4DBF),
    (0x20000, 0x2A6DF),
    (0x2A700, 0x2B73F),
    (0x2B740, 0x2B81F),
    (0x2B820, 0x2CEAF),
    (0xF900, 0xFAFF),
    (0x2F800, 0x2FA1F),
];

fn is_cjk(c: char) -> bool {
    let u = c as u32;
    CJK_BLOCKS.iter().any(|(lo, hi)| (*lo..=*hi).contains(&u))
}

/// Pad every CJK codepoint with spaces so it becomes its own pre-token.
fn isolate_cjk(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if is_cjk(c) {
            out.push(' ');
            out.push(c);
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer(extra: &[&str], max_seq_len: usize) -> WordPieceTokenizer {
        let mut vocab = vec!["[PAD]", "[UNK]", "[CLS]", "[SEP]"];
        vocab.extend_from_slice(extra);
        WordPieceTokenizer::from_vocab(
            vocab,
            TokenizerOptions {
                max_seq_len,
                ..TokenizerOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn pair_encoding_layout() {
        // vocab: [PAD]=0 [UNK]=1 [CLS]=2 [SEP]=3 a=4 b=5
        let t = tokenizer(&["a", "b"], 6);
        let enc = t.encode_pair("a", "b");
        assert_eq!(enc.input_ids, vec![2, 4, 3, 5, 3, 0]);
        assert_eq!(enc.attention_mask, vec![1, 1, 1, 1, 1, 0]);
        assert_eq!(enc.token_type_ids, vec![0, 0, 0, 1, 1, 0]);
        assert_eq!(enc.effective_len, 5);
    }

    #[test]
    fn encoding_is_deterministic() {
        let t = tokenizer(&["hello", "world"], 16);
        let a = t.encode("Hello, world!");
        let b = t.encode("Hello, world!");
        assert_eq!(a, b);
    }

    #[test]
    fn min_sequence_keeps_only_specials() {
        let t = tokenizer(&["hello"], 2);
        let enc = t.encode("hello hello hello");
        assert_eq!(enc.input_ids, vec![2, 3]);
        assert_eq!(enc.attention_mask, vec![1, 1]);
        assert_eq!(enc.effective_len, 2);

        // Pair mode collapses to the same skeleton.
        let enc = t.encode_pair("hello", "hello");
        assert_eq!(enc.input_ids, vec![2, 3]);
    }

    #[test]
    fn punctuation_becomes_its_own_token() {
        let t = tokenizer(&["hello", "world", ",", "!"], 16);
        let enc = t.encode("hello, world!");
        let ids: Vec<i64> = enc.input_ids[..enc.effective_len].to_vec();
        // [CLS] hello , world ! [SEP]
        assert_eq!(ids, vec![2, 4, 6, 5, 7, 3]);
    }

    #[test]
    fn greedy_longest_match_with_continuations() {
        let t = tokenizer(&["un", "##aff", "##able", "##ffable"], 16);
        let enc = t.encode("unaffable");
        // Longest-first: "un" then "##affable" fails, "##aff" + "##able".
        assert_eq!(&enc.input_ids[1..4], &[4, 5, 6]);
    }

    #[test]
    fn word_without_prefix_match_is_unknown() {
        let t = tokenizer(&["##xyz"], 16);
        let enc = t.encode("qxyz");
        assert_eq!(enc.input_ids[1], 1);
        assert_eq!(enc.effective_len, 3);
    }

    #[test]
    fn lowercasing_strips_accents_by_default() {
        let t = tokenizer(&["hello"], 16);
        let enc = t.encode("H\u{00e9}llo"); // Héllo
        assert_eq!(enc.input_ids[1], 4);
    }

    #[test]
    fn cjk_codepoints_are_isolated() {
        let t = tokenizer(&["ab", "\u{4e2d}", "cd"], 16);
        let enc = t.encode("ab\u{4e2d}cd");
        assert_eq!(&enc.input_ids[1..4], &[4, 5, 6]);
    }

    #[test]
    fn control_characters_are_dropped_and_whitespace_mapped() {
        let t = tokenizer(&["hello", "world"], 16);
        let a = t.encode("hello\u{0000}\u{fffd}\u{0007} world");
        let b = t.encode("hello\tworld");
        assert_eq!(a.input_ids, b.input_ids);
    }

    #[test]
    fn long_pair_truncates_longer_segment_first() {
        let t = tokenizer(&["a", "b"], 8);
        // budget = 8 - 3 = 5
        let enc = t.encode_pair("a a a a a a", "b b");
        let ids = &enc.input_ids[..enc.effective_len];
        // a-segment trimmed from 6 to 3, b keeps both tokens
        assert_eq!(ids, &[2, 4, 4, 4, 3, 5, 5, 3]);
        assert_eq!(&enc.token_type_ids[..enc.effective_len], &[0, 0, 0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn decode_then_encode_round_trips() {
        let t = tokenizer(&["the", "quick", "fox", "##es"], 32);
        let original = t.encode("the quick foxes");
        let decoded = t.decode(&original.input_ids);
        assert_eq!(decoded, "the quick foxes");
        let again = t.encode(&decoded);
        assert_eq!(original.input_ids, again.input_ids);
    }

    #[test]
    fn oversized_word_resolves_to_unknown() {
        let long_word = "a".repeat(200);
        let t = tokenizer(&["a"], 16);
        let enc = t.encode(&long_word);
        assert_eq!(enc.input_ids[1], 1);
    }

    #[test]
    fn missing_special_token_is_fatal() {
        let result = WordPieceTokenizer::from_vocab(
            vec!["[PAD]", "[CLS]", "[SEP]"],
            TokenizerOptions::default(),
        );
        assert!(matches!(result, Err(RagError::DataIntegrity(_))));
    }

    #[test]
    fn tiny_max_seq_len_is_fatal() {
        let result = WordPieceTokenizer::from_vocab(
            vec!["[PAD]", "[UNK]", "[CLS]", "[SEP]"],
            TokenizerOptions {
                max_seq_len: 1,
                ..TokenizerOptions::default()
            },
        );
        assert!(matches!(result, Err(RagError::Config(_))));
    }
}
