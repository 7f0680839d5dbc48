//! Link sources (Discord channels, fixture files) and the catalog providers
//! that sit behind the core `MetadataLookup` seam.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reelsync_core::{CatalogEntry, LookupError, MetadataLookup, RawLink};
use reelsync_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, HttpRequest};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "reelsync-adapters";

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v9";
pub const DISCORD_PAGE_LIMIT: usize = 100;
pub const TMDB_API_BASE: &str = "https://api.themoviedb.org/3";
pub const JIKAN_API_BASE: &str = "https://api.jikan.moe/v4";
pub const ANILIST_GRAPHQL_URL: &str = "https://graphql.anilist.co";

pub const ANIME_HOSTS: [&str; 2] = ["anilist.co", "myanimelist.net"];
pub const IMDB_HOSTS: [&str; 3] = ["www.imdb.com", "m.imdb.com", "imdb.com"];

static LINK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"]+|www\.[^\s<>"]+"#).expect("valid link regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscordAuthor {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscordMessage {
    pub id: String,
    #[serde(default)]
    pub content: String,
    pub author: DiscordAuthor,
    pub timestamp: String,
}

/// Every URL in every message, in message order, tagged with the poster and
/// the message timestamp.
pub fn extract_links(messages: &[DiscordMessage]) -> Vec<RawLink> {
    messages
        .iter()
        .flat_map(|message| {
            LINK_PATTERN.find_iter(&message.content).map(|m| RawLink {
                link: m.as_str().to_string(),
                user: message.author.username.clone(),
                timestamp: message.timestamp.clone(),
            })
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("access denied to channel {channel_id}")]
    AccessDenied { channel_id: String },
    #[error("fetching channel {channel_id} failed: {reason}")]
    Transient { channel_id: String, reason: String },
    #[error("could not decode messages: {0}")]
    Decode(String),
}

impl SourceError {
    fn from_fetch(channel_id: &str, err: FetchError) -> Self {
        if err.is_access_denied() {
            return SourceError::AccessDenied {
                channel_id: channel_id.to_string(),
            };
        }
        match err {
            FetchError::Decode { .. } => SourceError::Decode(err.to_string()),
            other => SourceError::Transient {
                channel_id: channel_id.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[async_trait]
pub trait LinkSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Checks credentials before any channel is read.
    async fn verify(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Links from at most `max_messages` of the newest messages. An empty
    /// channel is `Ok(vec![])`, never an error.
    async fn fetch_links(&self, channel_id: &str, max_messages: usize) -> Result<Vec<RawLink>, SourceError>;
}

#[derive(Debug)]
pub struct DiscordSource {
    http: HttpFetcher,
    api_base: String,
    authorization: String,
}

impl DiscordSource {
    pub fn new(http: HttpFetcher, token: &str, bot: bool) -> Self {
        Self {
            http,
            api_base: DISCORD_API_BASE.to_string(),
            authorization: authorization_header(token, bot),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Fails with `AccessDenied` when Discord rejects the token.
    pub async fn check_token(&self) -> Result<(), SourceError> {
        let request = HttpRequest::get(format!("{}/users/@me", self.api_base))
            .header("authorization", self.authorization.as_str());
        match self.http.send(&request).await {
            Ok(_) => Ok(()),
            Err(err) if err.status() == Some(401) => Err(SourceError::AccessDenied {
                channel_id: "@me".to_string(),
            }),
            Err(err) => Err(SourceError::from_fetch("@me", err)),
        }
    }

    async fn fetch_page(
        &self,
        channel_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<DiscordMessage>, SourceError> {
        let mut url = format!("{}/channels/{}/messages?limit={}", self.api_base, channel_id, limit);
        if let Some(before) = before {
            url.push_str(&format!("&before={before}"));
        }
        let request = HttpRequest::get(url).header("authorization", self.authorization.as_str());
        self.http
            .send_json(&request)
            .await
            .map_err(|err| SourceError::from_fetch(channel_id, err))
    }
}

#[async_trait]
impl LinkSource for DiscordSource {
    fn source_id(&self) -> &'static str {
        "discord"
    }

    async fn verify(&self) -> Result<(), SourceError> {
        self.check_token().await
    }

    async fn fetch_links(&self, channel_id: &str, max_messages: usize) -> Result<Vec<RawLink>, SourceError> {
        let mut messages: Vec<DiscordMessage> = Vec::new();
        let mut before: Option<String> = None;

        while messages.len() < max_messages {
            let limit = (max_messages - messages.len()).min(DISCORD_PAGE_LIMIT);
            let page = self.fetch_page(channel_id, limit, before.as_deref()).await?;
            let Some(last) = page.last() else {
                break;
            };
            before = Some(last.id.clone());
            let exhausted = page.len() < limit;
            messages.extend(page);
            if exhausted {
                break;
            }
        }

        let links = extract_links(&messages);
        info!(channel_id, messages = messages.len(), links = links.len(), "fetched discord messages");
        Ok(links)
    }
}

pub fn authorization_header(token: &str, bot: bool) -> String {
    if bot {
        format!("Bot {token}")
    } else {
        token.to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageFixture {
    #[serde(default)]
    pub channels: BTreeMap<String, Vec<DiscordMessage>>,
}

/// Discord-shaped messages read from a JSON file, newest first per channel.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    fixture: MessageFixture,
}

impl FixtureSource {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let fixture: MessageFixture =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self { fixture })
    }

    pub fn from_fixture(fixture: MessageFixture) -> Self {
        Self { fixture }
    }
}

#[async_trait]
impl LinkSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_links(&self, channel_id: &str, max_messages: usize) -> Result<Vec<RawLink>, SourceError> {
        // A channel missing from the file behaves like one the token cannot see.
        let Some(messages) = self.fixture.channels.get(channel_id) else {
            return Err(SourceError::AccessDenied {
                channel_id: channel_id.to_string(),
            });
        };
        let take = messages.len().min(max_messages);
        Ok(extract_links(&messages[..take]))
    }
}

/// Host and catalog id parsed out of a link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaLink {
    pub host: Option<String>,
    pub native_id: Option<String>,
}

pub fn identify(link: &str) -> MediaLink {
    let parsed = Url::parse(link).or_else(|_| {
        if link.starts_with("www.") {
            Url::parse(&format!("https://{link}"))
        } else {
            Err(url::ParseError::RelativeUrlWithoutBase)
        }
    });
    let Ok(url) = parsed else {
        return MediaLink::default();
    };
    let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
        return MediaLink::default();
    };

    let marker = if ANIME_HOSTS.contains(&host.as_str()) {
        Some("anime")
    } else if IMDB_HOSTS.contains(&host.as_str()) {
        Some("title")
    } else {
        None
    };

    let native_id = marker.and_then(|marker| {
        let segments: Vec<&str> = url.path_segments()?.collect();
        let pos = segments.iter().position(|s| *s == marker)?;
        segments
            .get(pos + 1)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    });

    MediaLink {
        host: Some(host),
        native_id,
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} has no entry for {native_id}: {reason}")]
    NotFound {
        provider: &'static str,
        native_id: String,
        reason: String,
    },
    #[error("{provider} request failed: {reason}")]
    Transient { provider: &'static str, reason: String },
}

impl ProviderError {
    fn not_found(provider: &'static str, native_id: &str, reason: impl Into<String>) -> Self {
        ProviderError::NotFound {
            provider,
            native_id: native_id.to_string(),
            reason: reason.into(),
        }
    }

    fn from_fetch(provider: &'static str, native_id: &str, err: FetchError) -> Self {
        if err.is_not_found() {
            Self::not_found(provider, native_id, err.to_string())
        } else {
            ProviderError::Transient {
                provider,
                reason: err.to_string(),
            }
        }
    }
}

#[async_trait]
pub trait CatalogProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn lookup(&self, native_id: &str) -> Result<CatalogEntry, ProviderError>;
}

#[derive(Debug, Clone, Deserialize)]
struct NamedGenre {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TmdbFind {
    #[serde(default)]
    movie_results: Vec<TmdbFindResult>,
}

#[derive(Debug, Deserialize)]
struct TmdbFindResult {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct TmdbMovie {
    title: String,
    #[serde(default)]
    genres: Vec<NamedGenre>,
    runtime: Option<u64>,
    vote_average: Option<f64>,
    release_date: Option<String>,
    poster_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TmdbConfiguration {
    images: TmdbImages,
}

#[derive(Debug, Deserialize)]
struct TmdbImages {
    secure_base_url: String,
    #[serde(default)]
    poster_sizes: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TmdbVideos {
    #[serde(default)]
    results: Vec<TmdbVideo>,
}

#[derive(Debug, Deserialize)]
struct TmdbVideo {
    site: String,
    key: String,
}

/// Preferred poster size slot in the TMDB configuration (w500 at time of writing).
const TMDB_POSTER_SIZE_SLOT: usize = 4;

fn tmdb_entry(imdb_id: &str, movie: TmdbMovie, config: &TmdbConfiguration, videos: &TmdbVideos) -> CatalogEntry {
    let size = config
        .images
        .poster_sizes
        .get(TMDB_POSTER_SIZE_SLOT)
        .or_else(|| config.images.poster_sizes.last())
        .map(String::as_str)
        .unwrap_or("original");
    let poster = movie
        .poster_path
        .as_deref()
        .map(|path| format!("{}{}{}", config.images.secure_base_url, size, path));
    let trailer = videos
        .results
        .iter()
        .find(|v| v.site == "YouTube")
        .map(|v| format!("https://youtu.be/{}", v.key));
    let release_year = movie
        .release_date
        .as_deref()
        .and_then(|date| date.split('-').next())
        .filter(|year| !year.is_empty())
        .map(ToString::to_string);

    CatalogEntry {
        id: format!("IMDB: {imdb_id}"),
        title: movie.title,
        poster,
        genres: movie.genres.into_iter().map(|g| g.name).collect(),
        runtime: movie.runtime.map(|r| r.to_string()),
        trailer,
        score: movie.vote_average.map(|s| s.to_string()),
        release_year,
    }
}

/// IMDb titles resolved through TMDB's external-id lookup.
#[derive(Debug)]
pub struct TmdbProvider {
    http: HttpFetcher,
    api_base: String,
    api_key: String,
}

impl TmdbProvider {
    pub fn new(http: HttpFetcher, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_base: TMDB_API_BASE.to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        imdb_id: &str,
        path: &str,
        extra_query: &str,
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}?api_key={}{}", self.api_base, path, self.api_key, extra_query);
        self.http
            .send_json(&HttpRequest::get(url))
            .await
            .map_err(|err| ProviderError::from_fetch(self.name(), imdb_id, err))
    }
}

#[async_trait]
impl CatalogProvider for TmdbProvider {
    fn name(&self) -> &'static str {
        "tmdb"
    }

    async fn lookup(&self, imdb_id: &str) -> Result<CatalogEntry, ProviderError> {
        let find: TmdbFind = self
            .get(
                imdb_id,
                &format!("/find/{imdb_id}"),
                "&language=en-US&external_source=imdb_id",
            )
            .await?;
        let Some(first) = find.movie_results.first() else {
            return Err(ProviderError::not_found(self.name(), imdb_id, "no movie results"));
        };
        let tmdb_id = first.id;

        let movie: TmdbMovie = self.get(imdb_id, &format!("/movie/{tmdb_id}"), "").await?;
        let config: TmdbConfiguration = self.get(imdb_id, "/configuration", "").await?;
        let videos: TmdbVideos = self
            .get(imdb_id, &format!("/movie/{tmdb_id}/videos"), "")
            .await?;

        Ok(tmdb_entry(imdb_id, movie, &config, &videos))
    }
}

#[derive(Debug, Deserialize)]
struct JikanEnvelope {
    data: JikanAnime,
}

#[derive(Debug, Deserialize)]
struct JikanAnime {
    title: String,
    title_english: Option<String>,
    #[serde(default)]
    images: Option<JikanImages>,
    #[serde(default)]
    trailer: Option<JikanTrailer>,
    duration: Option<String>,
    score: Option<f64>,
    #[serde(default)]
    aired: Option<JikanAired>,
    #[serde(default)]
    genres: Vec<NamedGenre>,
}

#[derive(Debug, Deserialize)]
struct JikanImages {
    jpg: JikanImage,
}

#[derive(Debug, Deserialize)]
struct JikanImage {
    image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JikanTrailer {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JikanAired {
    prop: JikanAiredProp,
}

#[derive(Debug, Deserialize)]
struct JikanAiredProp {
    from: JikanDate,
}

#[derive(Debug, Deserialize)]
struct JikanDate {
    year: Option<i32>,
}

fn jikan_entry(mal_id: &str, anime: JikanAnime) -> CatalogEntry {
    let title = anime.title_english.unwrap_or(anime.title);
    CatalogEntry {
        id: format!("MAL: {mal_id}"),
        title,
        poster: anime.images.and_then(|i| i.jpg.image_url),
        genres: anime.genres.into_iter().map(|g| g.name).collect(),
        runtime: anime.duration,
        trailer: anime.trailer.and_then(|t| t.url),
        score: anime.score.map(|s| s.to_string()),
        release_year: anime
            .aired
            .and_then(|a| a.prop.from.year)
            .map(|y| y.to_string()),
    }
}

/// MyAnimeList entries through the Jikan mirror. Jikan rate limits hard, so
/// calls are paced and 429s back off up to a 24s delay.
#[derive(Debug)]
pub struct JikanProvider {
    http: HttpFetcher,
    api_base: String,
}

impl JikanProvider {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            api_base: JIKAN_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn client_config(base: &HttpClientConfig) -> HttpClientConfig {
        HttpClientConfig {
            backoff: BackoffPolicy::rate_limited_catalog(),
            min_interval: Some(Duration::from_millis(500)),
            ..base.clone()
        }
    }
}

#[async_trait]
impl CatalogProvider for JikanProvider {
    fn name(&self) -> &'static str {
        "jikan"
    }

    async fn lookup(&self, mal_id: &str) -> Result<CatalogEntry, ProviderError> {
        let request = HttpRequest::get(format!("{}/anime/{}", self.api_base, mal_id));
        let envelope: JikanEnvelope = self
            .http
            .send_json(&request)
            .await
            .map_err(|err| ProviderError::from_fetch(self.name(), mal_id, err))?;
        Ok(jikan_entry(mal_id, envelope.data))
    }
}

const ANILIST_MAL_QUERY: &str = "query ($id: Int) { Media (id: $id, type: ANIME) { idMal } }";

#[derive(Debug, Deserialize)]
struct AnilistResponse {
    data: Option<AnilistData>,
}

#[derive(Debug, Deserialize)]
struct AnilistData {
    #[serde(rename = "Media")]
    media: Option<AnilistMedia>,
}

#[derive(Debug, Deserialize)]
struct AnilistMedia {
    #[serde(rename = "idMal")]
    id_mal: Option<u64>,
}

fn anilist_mal_id(response: AnilistResponse) -> Option<u64> {
    response.data?.media?.id_mal
}

/// AniList ids are translated to MyAnimeList ids, then looked up on Jikan.
#[derive(Debug)]
pub struct AnilistProvider {
    http: HttpFetcher,
    graphql_url: String,
    jikan: Arc<JikanProvider>,
}

impl AnilistProvider {
    pub fn new(http: HttpFetcher, jikan: Arc<JikanProvider>) -> Self {
        Self {
            http,
            graphql_url: ANILIST_GRAPHQL_URL.to_string(),
            jikan,
        }
    }

    pub fn with_graphql_url(mut self, url: impl Into<String>) -> Self {
        self.graphql_url = url.into();
        self
    }
}

#[async_trait]
impl CatalogProvider for AnilistProvider {
    fn name(&self) -> &'static str {
        "anilist"
    }

    async fn lookup(&self, anilist_id: &str) -> Result<CatalogEntry, ProviderError> {
        let Ok(numeric_id) = anilist_id.parse::<u64>() else {
            return Err(ProviderError::not_found(self.name(), anilist_id, "id is not numeric"));
        };
        let request = HttpRequest::post_json(
            self.graphql_url.clone(),
            json!({ "query": ANILIST_MAL_QUERY, "variables": { "id": numeric_id } }),
        );
        let response: AnilistResponse = self
            .http
            .send_json(&request)
            .await
            .map_err(|err| ProviderError::from_fetch(self.name(), anilist_id, err))?;
        let Some(mal_id) = anilist_mal_id(response) else {
            return Err(ProviderError::not_found(
                self.name(),
                anilist_id,
                "no MyAnimeList id linked",
            ));
        };
        debug!(anilist_id, mal_id, "resolved anilist id");
        self.jikan.lookup(&mal_id.to_string()).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolverSettings {
    pub http: HttpClientConfig,
    pub tmdb_api_key: Option<String>,
}

/// Dispatches each link to the provider registered for its host.
#[derive(Default)]
pub struct MetadataResolver {
    providers: BTreeMap<String, Arc<dyn CatalogProvider>>,
}

impl MetadataResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hosts: &[&str], provider: Arc<dyn CatalogProvider>) {
        for host in hosts {
            self.providers.insert(host.to_string(), Arc::clone(&provider));
        }
    }

    pub fn from_settings(settings: &ResolverSettings) -> Result<Self> {
        let mut resolver = Self::new();

        let jikan = Arc::new(JikanProvider::new(HttpFetcher::new(
            "jikan",
            JikanProvider::client_config(&settings.http),
        )?));
        let anilist = AnilistProvider::new(HttpFetcher::new("anilist", settings.http.clone())?, Arc::clone(&jikan));
        resolver.register(&["myanimelist.net"], jikan);
        resolver.register(&["anilist.co"], Arc::new(anilist));

        match settings.tmdb_api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => {
                let tmdb = TmdbProvider::new(HttpFetcher::new("tmdb", settings.http.clone())?, key);
                resolver.register(&IMDB_HOSTS, Arc::new(tmdb));
            }
            None => warn!("no TMDB API key configured; IMDb links cannot be resolved"),
        }

        Ok(resolver)
    }

    pub fn supports_host(&self, host: &str) -> bool {
        self.providers.contains_key(host)
    }

    pub fn provider_for(&self, host: &str) -> Option<&'static str> {
        self.providers.get(host).map(|p| p.name())
    }
}

#[async_trait]
impl MetadataLookup for MetadataResolver {
    async fn lookup(&self, link: &str) -> Result<CatalogEntry, LookupError> {
        let media = identify(link);
        let Some(host) = media.host.as_deref() else {
            return Err(LookupError::not_identifiable(link, "not a parseable URL"));
        };
        let Some(provider) = self.providers.get(host) else {
            return Err(LookupError::not_identifiable(
                link,
                format!("no catalog provider for host {host}"),
            ));
        };
        let Some(native_id) = media.native_id.as_deref() else {
            return Err(LookupError::not_identifiable(link, "no catalog id in link path"));
        };

        debug!(link, provider = provider.name(), native_id, "looking up catalog entry");
        provider.lookup(native_id).await.map_err(|err| match err {
            ProviderError::NotFound { .. } => LookupError::not_identifiable(link, err.to_string()),
            ProviderError::Transient { .. } => LookupError::transient(link, err.to_string()),
        })
    }
}
