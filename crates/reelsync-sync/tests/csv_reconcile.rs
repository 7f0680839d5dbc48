use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reelsync_adapters::FixtureSource;
use reelsync_core::{CatalogEntry, Category, CategorySchema, LookupError, MetadataLookup};
use reelsync_storage::{CsvTable, TableStore};
use reelsync_sync::{DestinationSummary, SyncConfig, SyncPipeline, SyncRunSummary};

const DARK_KNIGHT: &str = "https://www.imdb.com/title/tt0468569/";
const FMA_MAL: &str = "https://myanimelist.net/anime/5114/Fullmetal_Alchemist__Brotherhood";
const FMA_ANILIST: &str = "https://anilist.co/anime/5114/";

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

struct CatalogFake(BTreeMap<&'static str, CatalogEntry>);

#[async_trait]
impl MetadataLookup for CatalogFake {
    async fn lookup(&self, link: &str) -> Result<CatalogEntry, LookupError> {
        self.0
            .get(link)
            .cloned()
            .ok_or_else(|| LookupError::not_identifiable(link, "not in catalog"))
    }
}

fn catalog() -> CatalogFake {
    let fma = CatalogEntry {
        id: "MAL: 5114".into(),
        title: "Fullmetal Alchemist: Brotherhood".into(),
        poster: Some("https://cdn.myanimelist.net/images/anime/1208/94745.jpg".into()),
        genres: vec!["Action".into(), "Adventure".into()],
        runtime: Some("24 min per ep".into()),
        trailer: None,
        score: Some("9.1".into()),
        release_year: Some("2009".into()),
    };
    CatalogFake(BTreeMap::from([
        (
            DARK_KNIGHT,
            CatalogEntry {
                id: "IMDB: tt0468569".into(),
                title: "The Dark Knight".into(),
                poster: Some("https://image.tmdb.org/t/p/w500/qJ2tW6WMUDux911r6m7haRef0WH.jpg".into()),
                genres: vec!["Drama".into(), "Action".into()],
                runtime: Some("152".into()),
                trailer: Some("https://youtu.be/EXeTwQWrcwY".into()),
                score: Some("8.516".into()),
                release_year: Some("2008".into()),
            },
        ),
        (FMA_MAL, fma.clone()),
        (FMA_ANILIST, fma),
    ]))
}

fn config(reports: &Path, remove_watched: bool) -> SyncConfig {
    SyncConfig {
        channel_id: Some("1000".into()),
        watched_channel_id: Some("2000".into()),
        remove_watched,
        reports_dir: Some(reports.to_path_buf()),
        ..SyncConfig::default()
    }
}

fn pipeline(csv: &Path, schema: CategorySchema, config: SyncConfig) -> SyncPipeline {
    let source = FixtureSource::load(workspace_root().join("fixtures/discord/channel_messages.json"))
        .expect("load message fixture");
    SyncPipeline::with_parts(
        config,
        Arc::new(schema),
        Box::new(source),
        Box::new(catalog()),
        vec![Box::new(CsvTable::new(csv))],
    )
}

fn row_for<'a>(rows: &'a [Vec<String>], title: &str) -> &'a Vec<String> {
    rows.iter()
        .find(|r| r.iter().any(|c| c == title))
        .unwrap_or_else(|| panic!("no row titled {title}"))
}

fn only_destination(summary: &SyncRunSummary) -> &DestinationSummary {
    assert_eq!(summary.destinations.len(), 1);
    &summary.destinations[0]
}

#[tokio::test]
async fn second_run_against_csv_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("DiscordMovies.csv");
    let reports = dir.path().join("reports");
    let schema = CategorySchema::default();

    let first = pipeline(&csv, schema.clone(), config(&reports, false))
        .run_once()
        .await
        .unwrap();
    let dest = only_destination(&first);
    assert_eq!(dest.plan, "create");
    assert_eq!(dest.rows_written, 2);
    assert_eq!(dest.stats.fetched_links, 5);
    assert_eq!(dest.stats.merged_links, 1);
    assert_eq!(dest.stats.merged_by_title, 1);
    assert_eq!(dest.stats.unidentifiable, vec!["www.example.com/not-a-movie".to_string()]);

    let rows = CsvTable::new(&csv).read().await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], schema.names());

    let link_col = schema.index_of(Category::Link).unwrap();
    let user_col = schema.index_of(Category::User).unwrap();
    let watched_col = schema.index_of(Category::Watched).unwrap();
    let poster_col = schema.index_of(Category::Poster).unwrap();

    let dark_knight = row_for(&rows, "The Dark Knight");
    assert_eq!(dark_knight[user_col], "bob\nalice");
    assert_eq!(dark_knight[watched_col], "True");
    assert!(!dark_knight[poster_col].starts_with("=IMAGE"));

    let fma = row_for(&rows, "Fullmetal Alchemist: Brotherhood");
    assert_eq!(fma[link_col], format!("{FMA_MAL}\n{FMA_ANILIST}"));
    assert_eq!(fma[watched_col], "False");

    let before = std::fs::read(&csv).unwrap();
    let second = pipeline(&csv, schema.clone(), config(&reports, false))
        .run_once()
        .await
        .unwrap();
    let dest = only_destination(&second);
    assert_eq!(dest.plan, "append");
    assert_eq!(dest.rows_written, 0);
    assert_eq!(dest.watched_updates, 0);
    assert_eq!(dest.stats.already_persisted, 3);
    assert_eq!(std::fs::read(&csv).unwrap(), before);

    let report_path = second.report_path.expect("report written");
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["run_id"], second.run_id.to_string());
    assert_eq!(report["destinations"][0]["plan"], "append");
}

#[tokio::test]
async fn changed_categories_rewrite_and_keep_existing_rows() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("movies.csv");
    let reports = dir.path().join("reports");

    pipeline(&csv, CategorySchema::default(), config(&reports, false))
        .run_once()
        .await
        .unwrap();

    let narrower = CategorySchema::build(None, Some(&["Poster", "Trailer", "Date Suggested"][..])).unwrap();
    let summary = pipeline(&csv, narrower.clone(), config(&reports, false))
        .run_once()
        .await
        .unwrap();
    let dest = only_destination(&summary);
    assert_eq!(dest.plan, "overwrite");
    assert_eq!(dest.rows_written, 2);

    let rows = CsvTable::new(&csv).read().await.unwrap();
    assert_eq!(rows[0], narrower.names());
    let user_col = narrower.index_of(Category::User).unwrap();
    assert_eq!(row_for(&rows, "The Dark Knight")[user_col], "bob\nalice");

    let third = pipeline(&csv, narrower, config(&reports, false))
        .run_once()
        .await
        .unwrap();
    assert_eq!(only_destination(&third).plan, "append");
}

#[tokio::test]
async fn watched_titles_can_be_left_out() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("unwatched.csv");
    let reports = dir.path().join("reports");

    let summary = pipeline(&csv, CategorySchema::default(), config(&reports, true))
        .run_once()
        .await
        .unwrap();
    assert_eq!(only_destination(&summary).stats.removed_watched, 1);

    let rows = CsvTable::new(&csv).read().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| !r.iter().any(|c| c == "The Dark Knight")));
}

#[tokio::test]
async fn unknown_channel_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("never.csv");
    let mut cfg = config(&dir.path().join("reports"), false);
    cfg.channel_id = Some("31337".into());

    let err = pipeline(&csv, CategorySchema::default(), cfg)
        .run_once()
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("access denied"));
    assert!(!csv.exists());
}

/// In-memory table that, like a new spreadsheet, only gets an id when first written.
#[derive(Default)]
struct AssignedIdTable {
    rows: Vec<Vec<String>>,
    id: Option<String>,
}

#[async_trait]
impl TableStore for AssignedIdTable {
    fn describe(&self) -> String {
        match &self.id {
            Some(id) => format!("table {id}"),
            None => "new table".to_string(),
        }
    }

    fn resource_id(&self) -> Option<String> {
        self.id.clone()
    }

    async fn exists(&self) -> anyhow::Result<bool> {
        Ok(self.id.is_some())
    }

    async fn read(&self) -> anyhow::Result<Vec<Vec<String>>> {
        Ok(self.rows.clone())
    }

    async fn append(&mut self, rows: &[Vec<String>]) -> anyhow::Result<()> {
        self.rows.extend_from_slice(rows);
        Ok(())
    }

    async fn overwrite(&mut self, rows: &[Vec<String>]) -> anyhow::Result<()> {
        self.id.get_or_insert_with(|| "tbl-7".to_string());
        self.rows = rows.to_vec();
        Ok(())
    }
}

#[tokio::test]
async fn created_destination_id_reaches_the_report() {
    let dir = tempfile::tempdir().unwrap();
    let source = FixtureSource::load(workspace_root().join("fixtures/discord/channel_messages.json"))
        .expect("load message fixture");
    let mut pipeline = SyncPipeline::with_parts(
        config(&dir.path().join("reports"), false),
        Arc::new(CategorySchema::default()),
        Box::new(source),
        Box::new(catalog()),
        vec![Box::new(AssignedIdTable::default())],
    );

    let summary = pipeline.run_once().await.unwrap();
    let dest = only_destination(&summary);
    assert_eq!(dest.plan, "create");
    assert_eq!(dest.destination, "table tbl-7");
    assert_eq!(dest.resource_id.as_deref(), Some("tbl-7"));

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(summary.report_path.as_ref().unwrap()).unwrap()).unwrap();
    assert_eq!(report["destinations"][0]["resource_id"], "tbl-7");
}
