//! Core record model for ReelSync: the category schema, media records, and the
//! collection that merges, filters and enriches them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "reelsync-core";

/// Value every field holds until something fills it in.
pub const UNRESOLVED: &str = "None";

/// Known attribute names, in persisted column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Poster,
    Title,
    Genres,
    Runtime,
    Trailer,
    #[serde(rename = "User Score")]
    UserScore,
    #[serde(rename = "Release Date")]
    ReleaseDate,
    #[serde(rename = "ID")]
    Id,
    Link,
    #[serde(rename = "Date Suggested")]
    DateSuggested,
    User,
    Watched,
}

impl Category {
    pub const ALL: [Category; 12] = [
        Category::Poster,
        Category::Title,
        Category::Genres,
        Category::Runtime,
        Category::Trailer,
        Category::UserScore,
        Category::ReleaseDate,
        Category::Id,
        Category::Link,
        Category::DateSuggested,
        Category::User,
        Category::Watched,
    ];

    /// Categories that every schema must keep active.
    pub const REQUIRED: [Category; 2] = [Category::Title, Category::Link];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Poster => "Poster",
            Category::Title => "Title",
            Category::Genres => "Genres",
            Category::Runtime => "Runtime",
            Category::Trailer => "Trailer",
            Category::UserScore => "User Score",
            Category::ReleaseDate => "Release Date",
            Category::Id => "ID",
            Category::Link => "Link",
            Category::DateSuggested => "Date Suggested",
            Category::User => "User",
            Category::Watched => "Watched",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == name)
            .ok_or_else(|| RecordError::UnknownAttribute(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown category `{0}`")]
    UnknownCategory(String),
    #[error("category `{0}` is required and cannot be excluded")]
    RequiredExcluded(Category),
    #[error("include list must contain `{0}`")]
    RequiredMissing(Category),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("`{0}` is not an active category")]
    InvalidAttribute(Category),
    #[error("unknown attribute `{0}`")]
    UnknownAttribute(String),
    #[error("record categories {record:?} do not match collection categories {collection:?}")]
    SchemaMismatch {
        record: Vec<Category>,
        collection: Vec<Category>,
    },
}

/// A link could not be resolved to a catalog entry. Recoverable: the record is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not identify media behind {link}: {reason}")]
pub struct MovieIdentityError {
    pub link: String,
    pub reason: String,
}

/// Connection or rate-limit failure. Fatal for a run; records are never silently dropped for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transient failure looking up {link}: {reason}")]
pub struct TransientFailure {
    pub link: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error(transparent)]
    NotIdentifiable(#[from] MovieIdentityError),
    #[error(transparent)]
    Transient(#[from] TransientFailure),
}

impl LookupError {
    pub fn not_identifiable(link: impl Into<String>, reason: impl Into<String>) -> Self {
        LookupError::NotIdentifiable(MovieIdentityError {
            link: link.into(),
            reason: reason.into(),
        })
    }

    pub fn transient(link: impl Into<String>, reason: impl Into<String>) -> Self {
        LookupError::Transient(TransientFailure {
            link: link.into(),
            reason: reason.into(),
        })
    }
}

/// A link pulled out of a chat message, with who posted it and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLink {
    pub link: String,
    pub user: String,
    pub timestamp: String,
}

/// Attributes a catalog provider knows about a title.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub title: String,
    pub poster: Option<String>,
    pub genres: Vec<String>,
    pub runtime: Option<String>,
    pub trailer: Option<String>,
    pub score: Option<String>,
    pub release_year: Option<String>,
}

impl CatalogEntry {
    fn field_values(&self) -> [(Category, String); 8] {
        let or_unresolved = |v: &Option<String>| v.clone().unwrap_or_else(|| UNRESOLVED.to_string());
        let genres = if self.genres.is_empty() {
            UNRESOLVED.to_string()
        } else {
            self.genres.join(", ")
        };
        [
            (Category::Poster, or_unresolved(&self.poster)),
            (Category::Title, self.title.clone()),
            (Category::Genres, genres),
            (Category::Runtime, or_unresolved(&self.runtime)),
            (Category::Trailer, or_unresolved(&self.trailer)),
            (Category::UserScore, or_unresolved(&self.score)),
            (Category::ReleaseDate, or_unresolved(&self.release_year)),
            (Category::Id, self.id.clone()),
        ]
    }
}

/// Resolves a record's source link into catalog attributes.
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn lookup(&self, link: &str) -> Result<CatalogEntry, LookupError>;
}

/// The active subset of [`Category::ALL`], fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySchema {
    active: Vec<Category>,
}

impl Default for CategorySchema {
    fn default() -> Self {
        Self {
            active: Category::ALL.to_vec(),
        }
    }
}

impl CategorySchema {
    pub fn build(include: Option<&[&str]>, exclude: Option<&[&str]>) -> Result<Self, SchemaError> {
        let parse_all = |names: &[&str]| -> Result<Vec<Category>, SchemaError> {
            names
                .iter()
                .map(|name| {
                    name.parse::<Category>()
                        .map_err(|_| SchemaError::UnknownCategory(name.to_string()))
                })
                .collect()
        };

        let include = include.map(parse_all).transpose()?;
        let exclude = exclude.map(parse_all).transpose()?.unwrap_or_default();

        for required in Category::REQUIRED {
            if exclude.contains(&required) {
                return Err(SchemaError::RequiredExcluded(required));
            }
            if let Some(include) = &include {
                if !include.contains(&required) {
                    return Err(SchemaError::RequiredMissing(required));
                }
            }
        }

        let active = Category::ALL
            .into_iter()
            .filter(|c| include.as_ref().map_or(true, |inc| inc.contains(c)))
            .filter(|c| !exclude.contains(c))
            .collect();
        Ok(Self { active })
    }

    pub fn categories(&self) -> Vec<Category> {
        self.active.clone()
    }

    /// Header row for persisted tables.
    pub fn names(&self) -> Vec<String> {
        self.active.iter().map(|c| c.as_str().to_string()).collect()
    }

    pub fn contains(&self, category: Category) -> bool {
        self.active.contains(&category)
    }

    pub fn index_of(&self, category: Category) -> Result<usize, RecordError> {
        self.position(category)
            .ok_or_else(|| RecordError::UnknownAttribute(category.as_str().to_string()))
    }

    /// True when a persisted header lists exactly the active categories, in order.
    pub fn matches_header(&self, header: &[String]) -> bool {
        header.len() == self.active.len()
            && header.iter().zip(&self.active).all(|(h, c)| h == c.as_str())
    }

    fn position(&self, category: Category) -> Option<usize> {
        self.active.iter().position(|c| *c == category)
    }
}

/// Wraps an image URL so spreadsheet backends render it inline.
pub fn image_markup(url: &str) -> String {
    format!("=IMAGE(\"{url}\")")
}

/// Inverse of [`image_markup`]; values without the wrapper are returned unchanged.
pub fn strip_image_markup(value: &str) -> &str {
    value
        .strip_prefix("=IMAGE(\"")
        .and_then(|rest| rest.strip_suffix("\")"))
        .unwrap_or(value)
}

/// One media entry: a string per active category of its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    schema: Arc<CategorySchema>,
    values: Vec<String>,
}

impl Record {
    /// Keys that are unknown or inactive in `schema` are ignored.
    pub fn new<I, K, V>(schema: Arc<CategorySchema>, initial_values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut record = Self::empty(schema);
        for (key, value) in initial_values {
            let Ok(category) = key.as_ref().parse::<Category>() else {
                continue;
            };
            if let Some(slot) = record.schema.position(category) {
                record.values[slot] = value.into();
            }
        }
        record
    }

    pub fn empty(schema: Arc<CategorySchema>) -> Self {
        let values = vec![UNRESOLVED.to_string(); schema.active.len()];
        Self { schema, values }
    }

    pub fn from_raw(schema: Arc<CategorySchema>, raw: &RawLink) -> Self {
        Self::new(
            schema,
            [
                (Category::Link.as_str(), raw.link.as_str()),
                (Category::User.as_str(), raw.user.as_str()),
                (Category::DateSuggested.as_str(), raw.timestamp.as_str()),
            ],
        )
    }

    pub fn schema(&self) -> &CategorySchema {
        &self.schema
    }

    pub fn get(&self, category: Category) -> Result<&str, RecordError> {
        self.schema
            .position(category)
            .map(|slot| self.values[slot].as_str())
            .ok_or(RecordError::InvalidAttribute(category))
    }

    pub fn set(&mut self, category: Category, value: impl Into<String>) -> Result<(), RecordError> {
        let slot = self
            .schema
            .position(category)
            .ok_or(RecordError::InvalidAttribute(category))?;
        self.values[slot] = value.into();
        Ok(())
    }

    pub fn link(&self) -> &str {
        self.get(Category::Link).unwrap_or(UNRESOLVED)
    }

    pub fn title(&self) -> &str {
        self.get(Category::Title).unwrap_or(UNRESOLVED)
    }

    /// Projects the record in schema order, or in the caller's order.
    pub fn as_row(&self, order: Option<&[Category]>) -> Result<Vec<String>, RecordError> {
        match order {
            None => Ok(self.values.clone()),
            Some(order) => order
                .iter()
                .map(|c| self.get(*c).map(ToString::to_string))
                .collect(),
        }
    }

    /// Copies catalog attributes into the active fields; inactive ones are skipped.
    pub fn apply_catalog_entry(&mut self, entry: &CatalogEntry) {
        for (category, value) in entry.field_values() {
            if let Some(slot) = self.schema.position(category) {
                self.values[slot] = value;
            }
        }
    }

    /// On failure the record is left exactly as it was.
    pub async fn resolve_metadata(&mut self, lookup: &dyn MetadataLookup) -> Result<(), LookupError> {
        let entry = lookup.lookup(self.link()).await?;
        self.apply_catalog_entry(&entry);
        Ok(())
    }

    pub fn format_image(&mut self, category: Category) -> Result<(), RecordError> {
        let slot = self
            .schema
            .position(category)
            .ok_or(RecordError::InvalidAttribute(category))?;
        let value = &self.values[slot];
        if value.is_empty() || value == UNRESOLVED || value.starts_with("=IMAGE(") {
            return Ok(());
        }
        self.values[slot] = image_markup(value);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RowOptions {
    pub with_header: bool,
    pub format_images: bool,
    pub fields: Option<Vec<Category>>,
}

/// Ordered records sharing one schema. Lower indexes win merges.
#[derive(Debug, Clone)]
pub struct RecordCollection {
    schema: Arc<CategorySchema>,
    records: Vec<Record>,
}

impl RecordCollection {
    pub fn new(schema: Arc<CategorySchema>) -> Self {
        Self {
            schema,
            records: Vec::new(),
        }
    }

    pub fn from_raw_links(schema: Arc<CategorySchema>, links: &[RawLink]) -> Self {
        let records = links
            .iter()
            .map(|raw| Record::from_raw(schema.clone(), raw))
            .collect();
        Self { schema, records }
    }

    pub fn schema(&self) -> &Arc<CategorySchema> {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    pub fn links(&self) -> Vec<String> {
        self.records.iter().map(|r| r.link().to_string()).collect()
    }

    pub fn append(&mut self, record: Record) -> Result<(), RecordError> {
        if record.schema.active != self.schema.active {
            return Err(RecordError::SchemaMismatch {
                record: record.schema.categories(),
                collection: self.schema.categories(),
            });
        }
        self.records.push(record);
        Ok(())
    }

    /// Every active category except Link.
    pub fn default_ignore(&self) -> Vec<Category> {
        self.schema
            .active
            .iter()
            .copied()
            .filter(|c| *c != Category::Link)
            .collect()
    }

    /// Groups record indexes by key. Indexes within a group are ascending.
    pub fn find_duplicate_groups<F>(&self, key_fn: F) -> BTreeMap<String, Vec<usize>>
    where
        F: Fn(&Record) -> String,
    {
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, record) in self.records.iter().enumerate() {
            groups.entry(key_fn(record)).or_default().push(index);
        }
        groups
    }

    pub fn merge_duplicates(&mut self, ignore: &[Category], key: Category) -> Result<usize, RecordError> {
        if !self.schema.contains(key) {
            return Err(RecordError::InvalidAttribute(key));
        }
        self.merge_duplicates_by(ignore, |record| {
            record.get(key).unwrap_or(UNRESOLVED).to_string()
        })
    }

    /// Folds each group of equal keys into its lowest-index record and returns
    /// how many records were merged away. Every key groups, unresolved ones
    /// included, so no two survivors share a key.
    pub fn merge_duplicates_by<F>(&mut self, ignore: &[Category], key_fn: F) -> Result<usize, RecordError>
    where
        F: Fn(&Record) -> String,
    {
        if let Some(bad) = ignore.iter().find(|c| !self.schema.contains(**c)) {
            return Err(RecordError::InvalidAttribute(*bad));
        }

        let merge_slots: Vec<usize> = self
            .schema
            .active
            .iter()
            .enumerate()
            .filter(|(_, c)| !ignore.contains(c))
            .map(|(slot, _)| slot)
            .collect();

        let groups = self.find_duplicate_groups(key_fn);
        let mut removal = Vec::new();
        for (key, indexes) in &groups {
            if indexes.len() < 2 {
                continue;
            }
            let survivor = indexes[0];
            for &duplicate in &indexes[1..] {
                for &slot in &merge_slots {
                    let incoming = self.records[duplicate].values[slot].clone();
                    let current = &mut self.records[survivor].values[slot];
                    if !current.contains(incoming.as_str()) {
                        current.push('\n');
                        current.push_str(&incoming);
                    }
                }
                removal.push(duplicate);
            }
            debug!(key = %key, merged = indexes.len() - 1, "merged duplicate records");
        }

        removal.sort_unstable_by(|a, b| b.cmp(a));
        for index in &removal {
            self.records.remove(*index);
        }
        Ok(removal.len())
    }

    /// Removes records whose `category` value is contained in any of `values`.
    ///
    /// Matching is substring containment, not equality, so a stored link with a
    /// trailing query string still matches the bare link. Records with an empty
    /// value are kept since the empty string is contained in everything.
    pub fn remove_by_attribute_value<S: AsRef<str>>(
        &mut self,
        category: Category,
        values: &[S],
    ) -> Result<usize, RecordError> {
        let slot = self
            .schema
            .position(category)
            .ok_or(RecordError::InvalidAttribute(category))?;
        let before = self.records.len();
        self.records.retain(|record| {
            let value = record.values[slot].as_str();
            value.is_empty() || !values.iter().any(|v| v.as_ref().contains(value))
        });
        Ok(before - self.records.len())
    }

    /// Resolves every record. Unidentifiable records are removed and returned;
    /// a transient failure aborts the whole batch.
    pub async fn fill_all_metadata(
        &mut self,
        lookup: &dyn MetadataLookup,
    ) -> Result<Vec<Record>, TransientFailure> {
        let mut failed = Vec::new();
        for (index, record) in self.records.iter_mut().enumerate() {
            match record.resolve_metadata(lookup).await {
                Ok(()) => {}
                Err(LookupError::NotIdentifiable(err)) => {
                    warn!(link = %err.link, reason = %err.reason, "media not found, dropping record");
                    failed.push(index);
                }
                Err(LookupError::Transient(err)) => return Err(err),
            }
        }

        let mut failures = Vec::with_capacity(failed.len());
        for index in failed.into_iter().rev() {
            failures.push(self.records.remove(index));
        }
        failures.reverse();
        Ok(failures)
    }

    /// Sets Watched to "True" when any watched link occurs in the record's Link,
    /// "False" otherwise. Returns the number marked watched.
    pub fn mark_watched<S: AsRef<str>>(&mut self, watched_links: &[S]) -> usize {
        let (Some(watched_slot), Some(link_slot)) = (
            self.schema.position(Category::Watched),
            self.schema.position(Category::Link),
        ) else {
            return 0;
        };

        let mut marked = 0;
        for record in &mut self.records {
            let watched = is_watched(&record.values[link_slot], watched_links);
            if watched {
                marked += 1;
            }
            record.values[watched_slot] = watched_label(watched).to_string();
        }
        marked
    }

    /// Drops records whose Link contains any watched link, matching the same way
    /// `mark_watched` does. Works whether or not Watched is active.
    pub fn remove_watched<S: AsRef<str>>(&mut self, watched_links: &[S]) -> usize {
        let before = self.records.len();
        self.records.retain(|record| !is_watched(record.link(), watched_links));
        before - self.records.len()
    }

    pub fn to_rows(&self, options: &RowOptions) -> Result<Vec<Vec<String>>, RecordError> {
        let fields = options.fields.as_deref();
        let formatted;
        let source = if options.format_images && self.schema.contains(Category::Poster) {
            let mut copy = self.clone();
            for record in &mut copy.records {
                record.format_image(Category::Poster)?;
            }
            formatted = copy;
            &formatted
        } else {
            self
        };

        let mut rows = Vec::with_capacity(source.records.len() + 1);
        if options.with_header {
            rows.push(match fields {
                Some(fields) => {
                    if let Some(bad) = fields.iter().find(|c| !self.schema.contains(**c)) {
                        return Err(RecordError::InvalidAttribute(*bad));
                    }
                    fields.iter().map(|c| c.as_str().to_string()).collect()
                }
                None => self.schema.names(),
            });
        }
        for record in &source.records {
            rows.push(record.as_row(fields)?);
        }
        Ok(rows)
    }
}

impl<'a> IntoIterator for &'a RecordCollection {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Substring match of any non-empty watched link inside `link`.
pub fn is_watched<S: AsRef<str>>(link: &str, watched_links: &[S]) -> bool {
    watched_links
        .iter()
        .map(AsRef::as_ref)
        .any(|w| !w.is_empty() && link.contains(w))
}

pub fn watched_label(watched: bool) -> &'static str {
    if watched {
        "True"
    } else {
        "False"
    }
}
