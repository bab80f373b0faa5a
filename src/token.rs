use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Modality of a token. Plain-text vocabularies use [`DEFAULT_CLASS`].
pub type ClassId = String;

pub const DEFAULT_CLASS: &str = "@default_class";

/// A vocabulary entry: the pair of a class id and a keyword.
///
/// Equality and hashing are componentwise, so the same keyword in two
/// different modalities yields two distinct tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token {
    pub class_id: ClassId,
    pub keyword: String,
}

impl Token {
    pub fn new(class_id: impl Into<ClassId>, keyword: impl Into<String>) -> Self {
        Self {
            class_id: class_id.into(),
            keyword: keyword.into(),
        }
    }

    /// A token of the default class.
    pub fn plain(keyword: impl Into<String>) -> Self {
        Self::new(DEFAULT_CLASS, keyword)
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.class_id == DEFAULT_CLASS {
            write!(f, "{}", self.keyword)
        } else {
            write!(f, "{}:{}", self.class_id, self.keyword)
        }
    }
}

/// An ordered token set with a reverse mapping to contiguous indices.
///
/// Indices are assigned in insertion order, starting at zero. Re-adding an
/// existing token is idempotent and hands back the index it already has,
/// which is what keeps every executor's id space aligned: all of them read
/// the same vocabulary file top to bottom.
#[derive(Debug, Default)]
pub struct TokenCollection {
    token_to_id: HashMap<Token, usize>,
    id_to_token: Vec<Token>,
}

impl TokenCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    /// Inserts `token` and returns its index; for a known token this is the
    /// previously assigned index and nothing changes.
    pub fn add(&mut self, token: Token) -> usize {
        if let Some(&id) = self.token_to_id.get(&token) {
            return id;
        }
        let id = self.id_to_token.len();
        self.token_to_id.insert(token.clone(), id);
        self.id_to_token.push(token);
        id
    }

    pub fn token(&self, id: usize) -> &Token {
        &self.id_to_token[id]
    }

    pub fn id_of(&self, token: &Token) -> Option<usize> {
        self.token_to_id.get(token).copied()
    }

    pub fn contains(&self, token: &Token) -> bool {
        self.token_to_id.contains_key(token)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Token> {
        self.id_to_token.iter()
    }
}

/// Reads a vocabulary file: UTF-8 text, one keyword per line, all in the
/// default class. Line order defines the token id space.
pub fn read_vocabulary(path: impl AsRef<Path>) -> std::io::Result<Vec<Token>> {
    let reader = BufReader::new(File::open(path)?);
    let mut tokens = Vec::new();
    for line in reader.lines() {
        tokens.push(Token::plain(line?));
    }
    Ok(tokens)
}
