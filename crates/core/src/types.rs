use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Opaque identifier assigned to a store when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(String);

impl StoreId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StoreId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StoreId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Host names owned by a store.
///
/// The persisted form is a single text blob with one host name per line. Lines
/// are trimmed and blank lines dropped when parsing, so blobs submitted with
/// `\r\n` separators resolve the same way. Every constructor goes through the
/// same normalization, including [`FromIterator`], whose items may themselves
/// hold several lines. Matching is exact and case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Domains(Vec<String>);

impl Domains {
    pub const SEPARATOR: char = '\n';

    /// Parses the newline separated persisted representation.
    pub fn parse(blob: &str) -> Self {
        let mut domains = Vec::new();
        Self::push_lines(&mut domains, blob);
        Self(domains)
    }

    fn push_lines(domains: &mut Vec<String>, blob: &str) {
        domains.extend(
            blob.split(Self::SEPARATOR)
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }

    /// Joins the host names back into the persisted representation.
    pub fn to_blob(&self) -> String {
        self.0.join("\n")
    }

    /// Returns `true` when `hostname` is listed verbatim.
    pub fn contains(&self, hostname: &str) -> bool {
        self.0.iter().any(|domain| domain == hostname)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Domains {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut domains = Vec::new();
        for item in iter {
            let item: String = item.into();
            Self::push_lines(&mut domains, &item);
        }
        Self(domains)
    }
}

impl From<String> for Domains {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<&str> for Domains {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<Domains> for String {
    fn from(value: Domains) -> Self {
        value.to_blob()
    }
}

/// A tenant registered in the directory.
///
/// Values handed out by a directory are snapshots: mutating a clone never
/// reaches the directory. The default flag can only change through the
/// directory's `set_default` and default election paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Store {
    id: StoreId,
    slug: String,
    domains: Domains,
    #[serde(rename = "default")]
    is_default: bool,
    parent_id: Option<StoreId>,
    #[serde(default, serialize_with = "serialize_link")]
    create_your_own_link: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Store {
    pub fn id(&self) -> &StoreId {
        &self.id
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn domains(&self) -> &Domains {
        &self.domains
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn parent_id(&self) -> Option<&StoreId> {
        self.parent_id.as_ref()
    }

    /// Free-form link text; an unset value reads as an empty string.
    pub fn create_your_own_link(&self) -> &str {
        self.create_your_own_link.as_deref().unwrap_or_default()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns `true` when the store is a root of the hierarchy.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn into_parts(self) -> StoreParts {
        StoreParts {
            id: self.id,
            slug: self.slug,
            domains: self.domains,
            is_default: self.is_default,
            parent_id: self.parent_id,
            create_your_own_link: self.create_your_own_link,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub(crate) fn set_default_flag(&mut self, value: bool, at: DateTime<Utc>) -> bool {
        if self.is_default == value {
            return false;
        }
        self.is_default = value;
        self.updated_at = at;
        true
    }

    pub(crate) fn apply(&mut self, update: StoreUpdate, at: DateTime<Utc>) {
        if let Some(slug) = update.slug {
            self.slug = slug;
        }
        if let Some(domains) = update.domains {
            self.domains = domains;
        }
        if let Some(parent_id) = update.parent_id {
            self.parent_id = parent_id;
        }
        if let Some(link) = update.create_your_own_link {
            self.create_your_own_link = link;
        }
        self.updated_at = at;
    }
}

fn serialize_link<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(value.as_deref().unwrap_or_default())
}

/// Raw field bundle used by persistence layers to rebuild a [`Store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreParts {
    pub id: StoreId,
    pub slug: String,
    pub domains: Domains,
    pub is_default: bool,
    pub parent_id: Option<StoreId>,
    pub create_your_own_link: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<StoreParts> for Store {
    fn from(parts: StoreParts) -> Self {
        Self {
            id: parts.id,
            slug: parts.slug,
            domains: parts.domains,
            is_default: parts.is_default,
            parent_id: parts.parent_id,
            create_your_own_link: parts.create_your_own_link,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        }
    }
}

/// Data required to register a new store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewStore {
    pub slug: String,
    pub domains: Domains,
    pub default: bool,
    pub parent_id: Option<StoreId>,
    pub create_your_own_link: Option<String>,
}

impl NewStore {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            ..Self::default()
        }
    }

    pub fn with_domains(mut self, domains: impl Into<Domains>) -> Self {
        self.domains = domains.into();
        self
    }

    pub fn with_parent(mut self, parent_id: &StoreId) -> Self {
        self.parent_id = Some(parent_id.clone());
        self
    }

    pub fn with_create_your_own_link(mut self, link: Option<String>) -> Self {
        self.create_your_own_link = link;
        self
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }

    /// Builds the stored record with a freshly generated identifier.
    pub fn into_store(self, at: DateTime<Utc>) -> Store {
        Store {
            id: StoreId::generate(),
            slug: self.slug.trim().to_string(),
            domains: self.domains,
            is_default: self.default,
            parent_id: self.parent_id,
            create_your_own_link: self.create_your_own_link,
            created_at: at,
            updated_at: at,
        }
    }
}

/// Partial update applied to an existing store. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreUpdate {
    pub slug: Option<String>,
    pub domains: Option<Domains>,
    pub parent_id: Option<Option<StoreId>>,
    pub create_your_own_link: Option<Option<String>>,
}

/// Returns the trimmed slug when it is usable as a natural key.
pub fn normalize_slug(slug: &str) -> Option<&str> {
    let trimmed = slug.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
