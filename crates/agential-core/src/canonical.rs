//! Canonical identifiers, content hashes, and per-id store bookkeeping.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

// =============================================================================
// CANONICAL IDS
// =============================================================================

/// Source namespace of a canonical id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Arxiv,
    HfModel,
    HfDataset,
    HfSpace,
    GithubRepo,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Arxiv,
        SourceKind::HfModel,
        SourceKind::HfDataset,
        SourceKind::HfSpace,
        SourceKind::GithubRepo,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            SourceKind::Arxiv => "arxiv:",
            SourceKind::HfModel => "hf:model:",
            SourceKind::HfDataset => "hf:dataset:",
            SourceKind::HfSpace => "hf:space:",
            SourceKind::GithubRepo => "gh:repo:",
        }
    }
}

/// Stable cross-source identity shared by the lexical and vector stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalId {
    value: String,
    source: SourceKind,
}

impl CanonicalId {
    /// Build an id from a namespace and source-local identifier.
    ///
    /// arXiv ids lose their version suffix so every revision of a paper maps
    /// to one record.
    pub fn new(source: SourceKind, local_id: &str) -> Result<Self> {
        let local = local_id.trim();
        if local.is_empty() {
            return Err(Error::InvalidInput(format!(
                "empty identifier for {}",
                source.prefix()
            )));
        }
        let local = match source {
            SourceKind::Arxiv => strip_arxiv_version(local),
            _ => local,
        };
        if local.chars().any(char::is_whitespace) {
            return Err(Error::InvalidInput(format!(
                "identifier contains whitespace: {}",
                local
            )));
        }
        Ok(Self {
            value: format!("{}{}", source.prefix(), local),
            source,
        })
    }

    pub fn arxiv(id: &str) -> Result<Self> {
        Self::new(SourceKind::Arxiv, id)
    }

    pub fn hf_model(repo: &str) -> Result<Self> {
        Self::new(SourceKind::HfModel, repo)
    }

    pub fn github_repo(owner: &str, name: &str) -> Result<Self> {
        Self::new(SourceKind::GithubRepo, &format!("{}/{}", owner, name))
    }

    /// Parse a fully prefixed id such as `hf:dataset:squad`.
    pub fn parse(s: &str) -> Result<Self> {
        SourceKind::ALL
            .into_iter()
            .find_map(|source| {
                s.strip_prefix(source.prefix())
                    .map(|local| Self::new(source, local))
            })
            .unwrap_or_else(|| Err(Error::InvalidInput(format!("unknown canonical id: {}", s))))
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    /// Identifier without its namespace prefix.
    pub fn local_id(&self) -> &str {
        &self.value[self.source.prefix().len()..]
    }
}

fn strip_arxiv_version(id: &str) -> &str {
    match id.rfind('v') {
        Some(pos)
            if pos > 0
                && pos + 1 < id.len()
                && id[pos + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            &id[..pos]
        }
        _ => id,
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl FromStr for CanonicalId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CanonicalId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<CanonicalId> for String {
    fn from(id: CanonicalId) -> Self {
        id.value
    }
}

// =============================================================================
// CONTENT HASH
// =============================================================================

/// Lowercase hex SHA-256 digest of a record's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Digest of body followed by title, as the ingest path computes it.
    pub fn of_content(body: &str, title: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(body.as_bytes());
        if let Some(title) = title {
            hasher.update(title.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Accept a 64-character hex digest, normalizing to lowercase.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidInput(format!("invalid content hash: {}", s)));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines and result refs.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::from_hex(&s)
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> Self {
        h.0
    }
}

// =============================================================================
// DOCUMENTS AND RECORDS
// =============================================================================

/// Content written to both stores under one canonical id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: String,
    #[serde(default)]
    pub metadata: JsonValue,
    /// Precomputed embedding; the consistency manager embeds the text when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl IndexDocument {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            title: None,
            body: body.into(),
            metadata: JsonValue::Null,
            embedding: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of_content(&self.body, self.title.as_deref())
    }

    /// Text handed to the lexical index and the embedder.
    pub fn indexable_text(&self) -> String {
        match &self.title {
            Some(title) => format!("{}\n\n{}", title, self.body),
            None => self.body.clone(),
        }
    }
}

/// The two stores kept coherent per canonical id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreSide {
    Lexical,
    Vector,
}

impl StoreSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreSide::Lexical => "lexical",
            StoreSide::Vector => "vector",
        }
    }
}

impl fmt::Display for StoreSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-id bookkeeping of what each store currently reflects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub canonical_id: CanonicalId,
    /// Latest hash written to either store.
    pub content_hash: ContentHash,
    pub lexical_hash: Option<ContentHash>,
    pub vector_hash: Option<ContentHash>,
    pub lexical_version: i64,
    pub vector_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalRecord {
    /// Record after the first successful write to `side`.
    pub fn first_write(
        canonical_id: CanonicalId,
        side: StoreSide,
        hash: ContentHash,
        now: DateTime<Utc>,
    ) -> Self {
        let mut record = Self {
            canonical_id,
            content_hash: hash.clone(),
            lexical_hash: None,
            vector_hash: None,
            lexical_version: 0,
            vector_version: 0,
            created_at: now,
            updated_at: now,
        };
        record.record_write(side, hash, now);
        record
    }

    /// Note a confirmed write of `hash` to `side`, bumping its version.
    pub fn record_write(&mut self, side: StoreSide, hash: ContentHash, now: DateTime<Utc>) {
        match side {
            StoreSide::Lexical => {
                self.lexical_hash = Some(hash.clone());
                self.lexical_version += 1;
            }
            StoreSide::Vector => {
                self.vector_hash = Some(hash.clone());
                self.vector_version += 1;
            }
        }
        self.content_hash = hash;
        self.updated_at = now;
    }

    pub fn side_hash(&self, side: StoreSide) -> Option<&ContentHash> {
        match side {
            StoreSide::Lexical => self.lexical_hash.as_ref(),
            StoreSide::Vector => self.vector_hash.as_ref(),
        }
    }

    /// Whether `side` already reflects `hash`.
    pub fn side_is_current(&self, side: StoreSide, hash: &ContentHash) -> bool {
        self.side_hash(side) == Some(hash)
    }

    /// Both stores reflect `hash`.
    pub fn is_current(&self, hash: &ContentHash) -> bool {
        self.side_is_current(StoreSide::Lexical, hash) && self.side_is_current(StoreSide::Vector, hash)
    }

    /// Both stores reflect the same hash, and it is the latest one seen.
    pub fn is_consistent(&self) -> bool {
        self.is_current(&self.content_hash)
    }
}

/// Outcome of a dual-store upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UpsertResult {
    /// At least one store was written and both now agree.
    Applied,
    /// Both stores already held this hash; nothing was written.
    AlreadyCurrent,
    /// One store holds the new hash, the other failed.
    Partial {
        applied: StoreSide,
        failed: StoreSide,
        error: String,
    },
}
