//! Reconciliation driver: turns fetched links into the minimal write against a
//! previously persisted table, plus configuration and run reports.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reelsync_adapters::{DiscordSource, FixtureSource, LinkSource, MetadataResolver, ResolverSettings};
use reelsync_core::{
    is_watched, strip_image_markup, watched_label, CatalogEntry, Category, CategorySchema, LookupError,
    MetadataLookup, RawLink, Record, RecordCollection, RowOptions,
};
use reelsync_storage::{
    CellUpdate, CsvTable, HttpClientConfig, HttpFetcher, SheetsConfig, SheetsTable, TableStore,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "reelsync-sync";

pub const CATEGORIES_FILE: &str = "categories.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key} must be set")]
    Missing { key: &'static str },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    #[default]
    Csv,
    Sheet,
    All,
}

impl OutputType {
    pub fn writes_csv(self) -> bool {
        matches!(self, OutputType::Csv | OutputType::All)
    }

    pub fn writes_sheet(self) -> bool {
        matches!(self, OutputType::Sheet | OutputType::All)
    }
}

impl FromStr for OutputType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(OutputType::Csv),
            "sheet" | "sheets" => Ok(OutputType::Sheet),
            "all" => Ok(OutputType::All),
            _ => Err(ConfigError::InvalidValue {
                key: "OUTPUT_TYPE",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub discord_token: Option<String>,
    pub discord_bot: bool,
    pub channel_id: Option<String>,
    pub watched_channel_id: Option<String>,
    pub remove_watched: bool,
    pub max_messages: usize,
    pub tmdb_api_key: Option<String>,
    pub output: OutputType,
    pub filename: String,
    pub sheets_id: Option<String>,
    pub sheets_access_token: Option<String>,
    pub prune_removed: bool,
    pub reports_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub messages_fixture: Option<PathBuf>,
    pub categories_include: Option<Vec<String>>,
    pub categories_exclude: Option<Vec<String>>,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            discord_token: None,
            discord_bot: true,
            channel_id: None,
            watched_channel_id: None,
            remove_watched: false,
            max_messages: 100,
            tmdb_api_key: None,
            output: OutputType::Csv,
            filename: "DiscordMovies".to_string(),
            sheets_id: None,
            sheets_access_token: None,
            prune_removed: false,
            reports_dir: Some(PathBuf::from("./reports")),
            user_agent: "reelsync/0.1".to_string(),
            http_timeout_secs: 20,
            messages_fixture: None,
            categories_include: None,
            categories_exclude: None,
            workspace_root: PathBuf::from("."),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

fn parse_list(value: &str) -> Option<Vec<String>> {
    let items: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect();
    (!items.is_empty()).then_some(items)
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset and empty keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let output = match get("OUTPUT_TYPE") {
            Some(v) => v.parse()?,
            None => defaults.output,
        };

        Ok(Self {
            discord_token: get("DISCORD_AUTH_TOKEN"),
            discord_bot: get("DISCORD_BOT").map(|v| parse_flag(&v)).unwrap_or(defaults.discord_bot),
            channel_id: get("DISCORD_CHANNEL_ID"),
            watched_channel_id: get("DISCORD_WATCHED_CHANNEL_ID"),
            remove_watched: get("REMOVE_WATCHED").map(|v| parse_flag(&v)).unwrap_or(false),
            max_messages: get("MAX_MESSAGES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_messages),
            tmdb_api_key: get("TMDB_API_KEY"),
            output,
            filename: get("REELSYNC_FILENAME").unwrap_or(defaults.filename),
            sheets_id: get("GOOGLE_SHEETS_ID"),
            sheets_access_token: get("GOOGLE_SHEETS_ACCESS_TOKEN"),
            prune_removed: get("PRUNE_REMOVED").map(|v| parse_flag(&v)).unwrap_or(false),
            reports_dir: get("REELSYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .or(defaults.reports_dir),
            user_agent: get("REELSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: get("REELSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            messages_fixture: get("REELSYNC_MESSAGES_FIXTURE").map(PathBuf::from),
            categories_include: get("CATEGORIES_INCLUDE").and_then(|v| parse_list(&v)),
            categories_exclude: get("CATEGORIES_EXCLUDE").and_then(|v| parse_list(&v)),
            workspace_root: defaults.workspace_root,
        })
    }

    /// Checks that everything the configured run needs is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_id.is_none() {
            return Err(ConfigError::Missing {
                key: "DISCORD_CHANNEL_ID",
            });
        }
        if self.messages_fixture.is_none() && self.discord_token.is_none() {
            return Err(ConfigError::Missing {
                key: "DISCORD_AUTH_TOKEN",
            });
        }
        if self.output.writes_sheet() && self.sheets_access_token.is_none() {
            return Err(ConfigError::Missing {
                key: "GOOGLE_SHEETS_ACCESS_TOKEN",
            });
        }
        Ok(())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    /// Active categories: env lists win over `categories.yaml` in the workspace root.
    pub fn category_schema(&self) -> Result<CategorySchema> {
        let file = CategoriesFile::load(&self.workspace_root)?.unwrap_or_default();
        let include = self.categories_include.clone().or(file.include);
        let exclude = self.categories_exclude.clone().or(file.exclude);

        let include_refs: Option<Vec<&str>> = include.as_ref().map(|v| v.iter().map(String::as_str).collect());
        let exclude_refs: Option<Vec<&str>> = exclude.as_ref().map(|v| v.iter().map(String::as_str).collect());
        CategorySchema::build(include_refs.as_deref(), exclude_refs.as_deref()).context("building category schema")
    }

    pub fn log_summary(&self) {
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => {
                    let n = v.chars().take(5).map(char::len_utf8).sum::<usize>();
                    format!("{}...({} chars)", &v[..n], v.chars().count())
                }
                _ => "<not set>".to_string(),
            }
        }

        info!("Config loaded:");
        info!("  DISCORD_AUTH_TOKEN: {}", preview_opt(&self.discord_token));
        info!("  DISCORD_BOT: {}", self.discord_bot);
        info!("  DISCORD_CHANNEL_ID: {}", self.channel_id.as_deref().unwrap_or("<not set>"));
        info!(
            "  DISCORD_WATCHED_CHANNEL_ID: {}",
            self.watched_channel_id.as_deref().unwrap_or("<not set>")
        );
        info!("  TMDB_API_KEY: {}", preview_opt(&self.tmdb_api_key));
        info!("  GOOGLE_SHEETS_ACCESS_TOKEN: {}", preview_opt(&self.sheets_access_token));
        info!("  OUTPUT_TYPE: {:?}", self.output);
        info!("  MAX_MESSAGES: {}", self.max_messages);
    }
}

/// Optional `categories.yaml`: `include:` and/or `exclude:` lists of category names.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CategoriesFile {
    #[serde(default)]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Option<Vec<String>>,
}

impl CategoriesFile {
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = root.join(CATEGORIES_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let file = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(file))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    pub remove_watched: bool,
    pub prune_removed: bool,
}

/// The write a run makes against one destination, decided before any write happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePlan {
    /// Destination missing or empty: header plus all rows.
    Create { rows: Vec<Vec<String>> },
    /// Persisted header differs from the active categories: rewrite everything.
    Overwrite { rows: Vec<Vec<String>>, migrated: usize },
    /// Header matches: append new rows and touch up persisted ones.
    Append {
        rows: Vec<Vec<String>>,
        watched_updates: Vec<CellUpdate>,
        stale_rows: BTreeSet<usize>,
    },
}

impl WritePlan {
    pub fn kind(&self) -> &'static str {
        match self {
            WritePlan::Create { .. } => "create",
            WritePlan::Overwrite { .. } => "overwrite",
            WritePlan::Append { .. } => "append",
        }
    }

    /// Data rows written, header excluded.
    pub fn rows_written(&self) -> usize {
        match self {
            WritePlan::Create { rows } | WritePlan::Overwrite { rows, .. } => rows.len().saturating_sub(1),
            WritePlan::Append { rows, .. } => rows.len(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub fetched_links: usize,
    pub merged_links: usize,
    pub removed_watched: usize,
    pub already_persisted: usize,
    pub unidentifiable: Vec<String>,
    pub merged_by_title: usize,
    pub new_records: usize,
}

#[derive(Debug, Clone)]
pub struct PlannedWrite {
    pub plan: WritePlan,
    pub stats: ReconcileStats,
}

pub struct PlanInput<'a> {
    pub links: &'a [RawLink],
    /// `None` when no watched channel is configured.
    pub watched_links: Option<&'a [String]>,
    pub persisted: &'a [Vec<String>],
    pub format_images: bool,
}

/// Index of the named column in a persisted header.
fn header_column(header: &[String], category: Category) -> Option<usize> {
    header.iter().position(|h| h == category.as_str())
}

pub struct Reconciler {
    schema: Arc<CategorySchema>,
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(schema: Arc<CategorySchema>, options: ReconcileOptions) -> Self {
        Self { schema, options }
    }

    pub fn schema(&self) -> &Arc<CategorySchema> {
        &self.schema
    }

    pub async fn plan(&self, input: PlanInput<'_>, lookup: &dyn MetadataLookup) -> Result<PlannedWrite> {
        let mut stats = ReconcileStats {
            fetched_links: input.links.len(),
            ..ReconcileStats::default()
        };

        let header = input
            .persisted
            .first()
            .filter(|row| row.iter().any(|cell| !cell.is_empty()));
        let body: &[Vec<String>] = if header.is_some() { &input.persisted[1..] } else { &[] };
        let persisted_links: Vec<&str> = header
            .and_then(|h| header_column(h, Category::Link))
            .map(|col| {
                body.iter()
                    .filter_map(|row| row.get(col))
                    .map(String::as_str)
                    .filter(|cell| !cell.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let mut collection = RecordCollection::from_raw_links(self.schema.clone(), input.links);
        stats.merged_links = collection.merge_duplicates(&[Category::Link], Category::Link)?;

        if let Some(watched) = input.watched_links {
            collection.mark_watched(watched);
            if self.options.remove_watched {
                stats.removed_watched = if self.schema.contains(Category::Watched) {
                    collection.remove_by_attribute_value(Category::Watched, &[watched_label(true)])?
                } else {
                    collection.remove_watched(watched)
                };
            }
        }

        if !persisted_links.is_empty() {
            stats.already_persisted = collection.remove_by_attribute_value(Category::Link, persisted_links.as_slice())?;
        }

        let dropped = collection
            .fill_all_metadata(lookup)
            .await
            .context("resolving catalog metadata")?;
        stats.unidentifiable = dropped.iter().map(|r| r.link().to_string()).collect();

        let title_ignore = collection.default_ignore();
        stats.merged_by_title = collection.merge_duplicates(&title_ignore, Category::Title)?;
        stats.new_records = collection.len();

        let plan = match header {
            None => WritePlan::Create {
                rows: collection.to_rows(&RowOptions {
                    with_header: true,
                    format_images: input.format_images,
                    fields: None,
                })?,
            },
            Some(header) if !self.schema.matches_header(header) => {
                let mut combined = self.migrate_rows(header, body, input.watched_links)?;
                let migrated = combined.len();
                for record in &collection {
                    combined.append(record.clone())?;
                }
                WritePlan::Overwrite {
                    rows: combined.to_rows(&RowOptions {
                        with_header: true,
                        format_images: input.format_images,
                        fields: None,
                    })?,
                    migrated,
                }
            }
            Some(header) => WritePlan::Append {
                rows: collection.to_rows(&RowOptions {
                    with_header: false,
                    format_images: input.format_images,
                    fields: None,
                })?,
                watched_updates: self.watched_updates(header, body, input.watched_links),
                stale_rows: self.stale_rows(header, body, input.links),
            },
        };

        Ok(PlannedWrite { plan, stats })
    }

    /// Rebuilds persisted rows under the current schema, matching columns by header name.
    fn migrate_rows(
        &self,
        header: &[String],
        body: &[Vec<String>],
        watched_links: Option<&[String]>,
    ) -> Result<RecordCollection> {
        let mut migrated = RecordCollection::new(self.schema.clone());
        for row in body {
            if row.iter().all(|cell| cell.is_empty()) {
                continue;
            }
            let pairs = header.iter().zip(row).map(|(name, value)| {
                let value = if name == Category::Poster.as_str() {
                    strip_image_markup(value)
                } else {
                    value.as_str()
                };
                (name.as_str(), value.to_string())
            });
            let mut record = Record::new(self.schema.clone(), pairs);
            if let Some(watched) = watched_links {
                if self.schema.contains(Category::Watched) {
                    let label = watched_label(is_watched(record.link(), watched));
                    record.set(Category::Watched, label)?;
                }
            }
            migrated.append(record)?;
        }
        Ok(migrated)
    }

    fn watched_updates(
        &self,
        header: &[String],
        body: &[Vec<String>],
        watched_links: Option<&[String]>,
    ) -> Vec<CellUpdate> {
        let (Some(watched), Some(watched_col), Some(link_col)) = (
            watched_links,
            header_column(header, Category::Watched),
            header_column(header, Category::Link),
        ) else {
            return Vec::new();
        };

        body.iter()
            .enumerate()
            .filter_map(|(i, row)| {
                let link = row.get(link_col).filter(|l| !l.is_empty())?;
                let label = watched_label(is_watched(link, watched));
                let current = row.get(watched_col).map(String::as_str).unwrap_or_default();
                // Sheets hands booleans back as TRUE/FALSE.
                (!current.eq_ignore_ascii_case(label)).then(|| CellUpdate {
                    row: i + 1,
                    column: watched_col,
                    value: label.to_string(),
                })
            })
            .collect()
    }

    fn stale_rows(&self, header: &[String], body: &[Vec<String>], links: &[RawLink]) -> BTreeSet<usize> {
        if !self.options.prune_removed {
            return BTreeSet::new();
        }
        if links.is_empty() {
            warn!("channel returned no links; skipping pruning of persisted rows");
            return BTreeSet::new();
        }
        let Some(link_col) = header_column(header, Category::Link) else {
            return BTreeSet::new();
        };

        body.iter()
            .enumerate()
            .filter(|(_, row)| {
                row.get(link_col)
                    .filter(|cell| !cell.is_empty())
                    .is_some_and(|cell| !links.iter().any(|raw| cell.contains(raw.link.as_str())))
            })
            .map(|(i, _)| i + 1)
            .collect()
    }

    pub async fn apply(&self, plan: &WritePlan, store: &mut dyn TableStore) -> Result<()> {
        let destination = store.describe();
        match plan {
            WritePlan::Create { rows } | WritePlan::Overwrite { rows, .. } => {
                store
                    .overwrite(rows)
                    .await
                    .with_context(|| format!("writing {destination}"))?;
            }
            WritePlan::Append {
                rows,
                watched_updates,
                stale_rows,
            } => {
                // Cell updates and deletions use the persisted row indexes, so they
                // must land before anything shifts them.
                if !watched_updates.is_empty() {
                    store
                        .update_cells(watched_updates)
                        .await
                        .with_context(|| format!("updating watched cells in {destination}"))?;
                }
                if !stale_rows.is_empty() {
                    store
                        .delete_rows(stale_rows)
                        .await
                        .with_context(|| format!("pruning rows from {destination}"))?;
                }
                if !rows.is_empty() {
                    store
                        .append(rows)
                        .await
                        .with_context(|| format!("appending to {destination}"))?;
                }
            }
        }
        Ok(())
    }
}

/// Memoizes lookups so several destinations in one run resolve each link once.
pub struct CachedLookup<'a> {
    inner: &'a dyn MetadataLookup,
    cache: Mutex<HashMap<String, Result<CatalogEntry, LookupError>>>,
}

impl<'a> CachedLookup<'a> {
    pub fn new(inner: &'a dyn MetadataLookup) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<'a> MetadataLookup for CachedLookup<'a> {
    async fn lookup(&self, link: &str) -> Result<CatalogEntry, LookupError> {
        if let Some(hit) = self.cache.lock().await.get(link) {
            return hit.clone();
        }
        let result = self.inner.lookup(link).await;
        if !matches!(result, Err(LookupError::Transient(_))) {
            self.cache.lock().await.insert(link.to_string(), result.clone());
        }
        result
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DestinationSummary {
    pub destination: String,
    pub resource_id: Option<String>,
    pub plan: String,
    pub rows_written: usize,
    pub watched_updates: usize,
    pub pruned_rows: usize,
    pub stats: ReconcileStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub channel_id: String,
    pub watched_channel_id: Option<String>,
    pub categories: Vec<String>,
    pub destinations: Vec<DestinationSummary>,
    pub report_path: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    reconciler: Reconciler,
    source: Box<dyn LinkSource>,
    lookup: Box<dyn MetadataLookup>,
    stores: Vec<Box<dyn TableStore>>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let schema = Arc::new(config.category_schema()?);
        let http = config.http_client_config();

        let source: Box<dyn LinkSource> = match &config.messages_fixture {
            Some(path) => Box::new(FixtureSource::load(path)?),
            None => {
                let token = config
                    .discord_token
                    .as_deref()
                    .context("DISCORD_AUTH_TOKEN must be set")?;
                Box::new(DiscordSource::new(
                    HttpFetcher::new("discord", http.clone())?,
                    token,
                    config.discord_bot,
                ))
            }
        };

        let lookup = MetadataResolver::from_settings(&ResolverSettings {
            http: http.clone(),
            tmdb_api_key: config.tmdb_api_key.clone(),
        })?;

        let mut stores: Vec<Box<dyn TableStore>> = Vec::new();
        if config.output.writes_csv() {
            stores.push(Box::new(CsvTable::for_name(&config.filename)));
        }
        if config.output.writes_sheet() {
            let token = config
                .sheets_access_token
                .clone()
                .context("GOOGLE_SHEETS_ACCESS_TOKEN must be set")?;
            stores.push(Box::new(SheetsTable::new(
                HttpFetcher::new("sheets", http)?,
                SheetsConfig::new(config.sheets_id.clone(), token, config.filename.clone()),
            )));
        }

        Ok(Self::with_parts(config, schema, source, Box::new(lookup), stores))
    }

    pub fn with_parts(
        config: SyncConfig,
        schema: Arc<CategorySchema>,
        source: Box<dyn LinkSource>,
        lookup: Box<dyn MetadataLookup>,
        stores: Vec<Box<dyn TableStore>>,
    ) -> Self {
        let reconciler = Reconciler::new(
            schema,
            ReconcileOptions {
                remove_watched: config.remove_watched,
                prune_removed: config.prune_removed,
            },
        );
        Self {
            config,
            reconciler,
            source,
            lookup,
            stores,
        }
    }

    pub async fn run_once(&mut self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let channel_id = self.config.channel_id.clone().context("DISCORD_CHANNEL_ID must be set")?;

        self.source.verify().await.context("verifying chat credentials")?;
        let links = self
            .source
            .fetch_links(&channel_id, self.config.max_messages)
            .await
            .with_context(|| format!("fetching links from channel {channel_id}"))?;

        let watched_links: Option<Vec<String>> = match &self.config.watched_channel_id {
            Some(watched_id) => {
                let watched = self
                    .source
                    .fetch_links(watched_id, self.config.max_messages)
                    .await
                    .with_context(|| format!("fetching watched channel {watched_id}"))?;
                Some(watched.into_iter().map(|raw| raw.link).collect())
            }
            None => None,
        };

        let lookup = CachedLookup::new(self.lookup.as_ref());
        let mut destinations = Vec::with_capacity(self.stores.len());
        for store in &mut self.stores {
            let destination = store.describe();
            let persisted = store
                .read()
                .await
                .with_context(|| format!("reading {destination}"))?;
            let planned = self
                .reconciler
                .plan(
                    PlanInput {
                        links: &links,
                        watched_links: watched_links.as_deref(),
                        persisted: &persisted,
                        format_images: store.formats_images(),
                    },
                    &lookup,
                )
                .await?;

            let (watched_updates, pruned_rows) = match &planned.plan {
                WritePlan::Append {
                    watched_updates,
                    stale_rows,
                    ..
                } => (watched_updates.len(), stale_rows.len()),
                _ => (0, 0),
            };
            info!(
                %destination,
                plan = planned.plan.kind(),
                rows = planned.plan.rows_written(),
                watched_updates,
                pruned_rows,
                dropped = planned.stats.unidentifiable.len(),
                "reconciled destination"
            );
            self.reconciler.apply(&planned.plan, store.as_mut()).await?;

            // Writing may have created the destination, e.g. a new spreadsheet.
            destinations.push(DestinationSummary {
                destination: store.describe(),
                resource_id: store.resource_id(),
                plan: planned.plan.kind().to_string(),
                rows_written: planned.plan.rows_written(),
                watched_updates,
                pruned_rows,
                stats: planned.stats,
            });
        }

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source: self.source.source_id().to_string(),
            channel_id,
            watched_channel_id: self.config.watched_channel_id.clone(),
            categories: self.reconciler.schema().names(),
            destinations,
            report_path: None,
        };

        if let Some(reports_root) = &self.config.reports_dir {
            let path = write_run_report(reports_root, &summary).await?;
            summary.report_path = Some(path.display().to_string());
        }
        Ok(summary)
    }
}

/// Writes `<reports_root>/<run_id>/run_summary.json`.
pub async fn write_run_report(reports_root: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join("run_summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary> {
    config.log_summary();
    let mut pipeline = SyncPipeline::new(config)?;
    pipeline.run_once().await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    run_sync_once(SyncConfig::from_env()?).await
}
