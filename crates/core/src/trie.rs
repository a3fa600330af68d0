//! Prefix tree over token-id sequences.
//!
//! A fresh [`Trie`] is built for every SEL directive from the token sequences
//! of its options and dropped once the selection resolves. The three queries
//! implement trie-compressed decoding: the engine only asks the backend at
//! nodes with more than one child.

use std::collections::BTreeMap;

use crate::types::Token;

const ROOT: usize = 0;

#[derive(Debug, Default)]
struct TrieNode {
    children: BTreeMap<Token, usize>,
    is_end_of_word: bool,
}

/// Arena-backed token trie. Children are kept in ascending token order.
#[derive(Debug)]
pub struct Trie {
    nodes: Vec<TrieNode>,
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

impl Trie {
    pub fn new() -> Self {
        Self { nodes: vec![TrieNode::default()] }
    }

    /// Insert one complete token sequence and mark its terminal node.
    pub fn add_prefix(&mut self, tokens: &[Token]) {
        let mut node = ROOT;
        for &token in tokens {
            node = match self.nodes[node].children.get(&token) {
                Some(&child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    self.nodes[node].children.insert(token, child);
                    child
                }
            };
        }
        self.nodes[node].is_end_of_word = true;
    }

    /// Immediate children of the node reached by `prefix`; empty if `prefix`
    /// is not stored.
    pub fn next_children(&self, prefix: &[Token]) -> Vec<Token> {
        match self.find(prefix) {
            Some(node) => self.nodes[node].children.keys().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Longest deterministic extension of `prefix`: descend while the node has
    /// exactly one child and is not itself the end of a stored sequence.
    /// Returns an empty sequence if `prefix` is not stored.
    pub fn next_prefix(&self, prefix: &[Token]) -> Vec<Token> {
        let Some(mut node) = self.find(prefix) else {
            return Vec::new();
        };
        let mut extended = prefix.to_vec();
        while !self.nodes[node].is_end_of_word {
            let mut children = self.nodes[node].children.iter();
            let (Some((&token, &child)), None) = (children.next(), children.next()) else {
                break;
            };
            extended.push(token);
            node = child;
        }
        extended
    }

    /// Complete `prefix` to a stored sequence by repeatedly taking the first
    /// child. Returns an empty sequence if `prefix` is not stored.
    pub fn word(&self, prefix: &[Token]) -> Vec<Token> {
        let Some(mut node) = self.find(prefix) else {
            return Vec::new();
        };
        let mut word = prefix.to_vec();
        while !self.nodes[node].is_end_of_word {
            let Some((&token, &child)) = self.nodes[node].children.iter().next() else {
                break;
            };
            word.push(token);
            node = child;
        }
        word
    }

    pub fn is_empty(&self) -> bool {
        self.nodes[ROOT].children.is_empty() && !self.nodes[ROOT].is_end_of_word
    }

    fn find(&self, prefix: &[Token]) -> Option<usize> {
        prefix.iter().try_fold(ROOT, |node, token| self.nodes[node].children.get(token).copied())
    }
}
