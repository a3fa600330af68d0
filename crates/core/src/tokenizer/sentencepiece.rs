//! Pure-Rust SentencePiece-style BPE over an in-memory piece table.
//!
//! Pieces are merged in order of decreasing score (higher score = merge
//! first). Spaces map to the `▁` (U+2581) placeholder and a `▁` is prepended
//! to the input, so decoding drops exactly one leading space. Characters with
//! no piece fall back to `<0xHH>` byte pieces.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use super::{decode_with_eos, encode_with_eos, Tokenizer};
use crate::types::Token;
use crate::{Error, Result};

const SPACE_MARKER: char = '\u{2581}';

/// Piece table as stored on disk: `{"pieces": [["▁h", -1.0], ...], "bos_id": 1, "eos_id": 2}`.
#[derive(Debug, Deserialize)]
pub struct PieceTable {
    pub pieces: Vec<(String, f32)>,
    #[serde(default = "default_bos")]
    pub bos_id: Token,
    #[serde(default = "default_eos")]
    pub eos_id: Token,
}

fn default_bos() -> Token {
    1
}

fn default_eos() -> Token {
    2
}

/// Score-ordered BPE tokenizer.
pub struct SentencePieceTokenizer {
    /// Token id → piece bytes
    vocab: Vec<Vec<u8>>,
    /// Piece bytes → token id
    token_to_id: HashMap<Vec<u8>, Token>,
    /// (left_id, right_id) → merge score
    merge_scores: HashMap<(Token, Token), f32>,
    bos_id: Token,
    eos_id: Token,
    eos: String,
}

impl SentencePieceTokenizer {
    /// Build a tokenizer from `(piece, score)` pairs indexed by token id.
    ///
    /// # Errors
    /// Returns an error if `bos_id` or `eos_id` is outside the table.
    pub fn from_pieces<S: AsRef<str>>(pieces: &[(S, f32)], bos_id: Token, eos_id: Token) -> Result<Self> {
        let vocab_size = pieces.len();
        for id in [bos_id, eos_id] {
            if id as usize >= vocab_size {
                return Err(Error::Tokenizer(format!("Special token {id} outside vocabulary")));
            }
        }

        let mut vocab: Vec<Vec<u8>> = Vec::with_capacity(vocab_size);
        let mut token_to_id: HashMap<Vec<u8>, Token> = HashMap::with_capacity(vocab_size);
        let mut control = vec![false; vocab_size];

        for (id, (piece, _)) in pieces.iter().enumerate() {
            let piece = piece.as_ref();
            let bytes = match byte_fallback(piece) {
                Some(b) => {
                    control[id] = true;
                    vec![b]
                }
                None => {
                    control[id] = is_control(piece);
                    piece.as_bytes().to_vec()
                }
            };
            token_to_id.entry(bytes.clone()).or_insert(id as Token);
            vocab.push(bytes);
        }
        control[bos_id as usize] = true;
        control[eos_id as usize] = true;

        // Every split of a piece into two known pieces is a merge ranked by
        // the merged piece's score.
        let mut merge_scores: HashMap<(Token, Token), f32> = HashMap::new();
        for (merged_id, merged) in vocab.iter().enumerate() {
            if control[merged_id] {
                continue;
            }
            let score = pieces[merged_id].1;
            for split in 1..merged.len() {
                let (left, right) = merged.split_at(split);
                if let (Some(&l), Some(&r)) = (token_to_id.get(left), token_to_id.get(right)) {
                    merge_scores
                        .entry((l, r))
                        .and_modify(|s| {
                            if score > *s {
                                *s = score;
                            }
                        })
                        .or_insert(score);
                }
            }
        }

        let eos = String::from_utf8_lossy(&vocab[eos_id as usize]).into_owned();

        Ok(Self { vocab, token_to_id, merge_scores, bos_id, eos_id, eos })
    }

    /// Load a [`PieceTable`] JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let table: PieceTable = serde_json::from_str(&content)?;
        Self::from_pieces(&table.pieces, table.bos_id, table.eos_id)
    }

    #[must_use]
    pub fn bos_token_id(&self) -> Token {
        self.bos_id
    }

    #[must_use]
    pub fn eos_token_id(&self) -> Token {
        self.eos_id
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn encode_text(&self, text: &str) -> Result<Vec<Token>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let sp_text: String =
            std::iter::once(SPACE_MARKER).chain(text.chars().map(|c| if c == ' ' { SPACE_MARKER } else { c })).collect();

        // One symbol per character, byte pieces where the character is unknown
        let mut tokens: Vec<Token> = Vec::with_capacity(sp_text.len());
        let mut buf = [0u8; 4];
        for c in sp_text.chars() {
            let encoded = c.encode_utf8(&mut buf).as_bytes();
            if let Some(&id) = self.token_to_id.get(encoded) {
                tokens.push(id);
                continue;
            }
            for &b in encoded {
                let id = self
                    .token_to_id
                    .get(&[b][..])
                    .copied()
                    .ok_or_else(|| Error::Tokenizer(format!("No piece for byte 0x{b:02x}")))?;
                tokens.push(id);
            }
        }

        // Repeatedly merge the highest-scoring adjacent pair
        while tokens.len() >= 2 {
            let mut best: Option<(usize, f32)> = None;
            for i in 0..tokens.len() - 1 {
                if let Some(&score) = self.merge_scores.get(&(tokens[i], tokens[i + 1])) {
                    if best.map_or(true, |(_, s)| score > s) {
                        best = Some((i, score));
                    }
                }
            }
            let Some((idx, _)) = best else {
                break;
            };

            let mut merged = self.vocab[tokens[idx] as usize].clone();
            merged.extend_from_slice(&self.vocab[tokens[idx + 1] as usize]);
            let Some(&merged_id) = self.token_to_id.get(&merged) else {
                break;
            };
            tokens[idx] = merged_id;
            tokens.remove(idx + 1);
        }

        Ok(tokens)
    }

    fn decode_text(&self, ids: &[Token]) -> Result<String> {
        let mut bytes = Vec::new();
        for &id in ids {
            if id == self.bos_id {
                continue;
            }
            let piece = self
                .vocab
                .get(id as usize)
                .ok_or_else(|| Error::Tokenizer(format!("Token ID {id} out of range")))?;
            bytes.extend_from_slice(piece);
        }

        let text = String::from_utf8_lossy(&bytes).replace(SPACE_MARKER, " ");
        Ok(text.strip_prefix(' ').unwrap_or(&text).to_string())
    }
}

impl Tokenizer for SentencePieceTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<Token>> {
        encode_with_eos(text, &self.eos, self.eos_id, |t| self.encode_text(t))
    }

    fn decode(&self, tokens: &[Token]) -> Result<String> {
        decode_with_eos(tokens, &self.eos, self.eos_id, |t| self.decode_text(t))
    }

    fn eos(&self) -> &str {
        &self.eos
    }

    fn name(&self) -> &str {
        "sentencepiece"
    }
}

/// Byte value of a `<0xHH>` fallback piece.
fn byte_fallback(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// Control pieces such as `<unk>` never take part in merges.
fn is_control(piece: &str) -> bool {
    piece.len() > 2 && piece.starts_with('<') && piece.ends_with('>')
}
