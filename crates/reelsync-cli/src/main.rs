use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use reelsync_adapters::{identify, MetadataResolver, ResolverSettings};
use reelsync_core::{Category, MetadataLookup};
use reelsync_sync::{OutputType, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "reelsync")]
#[command(about = "Collect movie links from a Discord channel into a CSV file or Google Sheet")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch links, resolve metadata and reconcile the output table.
    Sync(SyncArgs),
    /// Show which catalog a link resolves against.
    Identify {
        url: String,
        /// Also fetch the catalog entry.
        #[arg(long)]
        resolve: bool,
    },
    /// List every category and whether it is active.
    Categories,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long, env = "DISCORD_CHANNEL_ID")]
    channel_id: Option<String>,
    #[arg(long, env = "DISCORD_WATCHED_CHANNEL_ID")]
    watched_channel_id: Option<String>,
    /// Treat the token as a user token rather than a bot token.
    #[arg(long)]
    no_bot: bool,
    #[arg(long)]
    remove_watched: bool,
    #[arg(long)]
    max_messages: Option<usize>,
    #[arg(long)]
    output: Option<OutputType>,
    #[arg(long)]
    filename: Option<String>,
    #[arg(long)]
    sheets_id: Option<String>,
    /// Delete persisted rows whose link is no longer in the channel.
    #[arg(long)]
    prune_removed: bool,
    /// Read messages from a JSON file instead of Discord.
    #[arg(long)]
    messages_fixture: Option<PathBuf>,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
    #[arg(long, conflicts_with = "reports_dir")]
    no_report: bool,
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,
}

impl SyncArgs {
    fn apply(self, config: &mut SyncConfig) {
        if self.channel_id.is_some() {
            config.channel_id = self.channel_id;
        }
        if self.watched_channel_id.is_some() {
            config.watched_channel_id = self.watched_channel_id;
        }
        if self.no_bot {
            config.discord_bot = false;
        }
        config.remove_watched |= self.remove_watched;
        config.prune_removed |= self.prune_removed;
        if let Some(max) = self.max_messages {
            config.max_messages = max;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(filename) = self.filename {
            config.filename = filename;
        }
        if self.sheets_id.is_some() {
            config.sheets_id = self.sheets_id;
        }
        if self.messages_fixture.is_some() {
            config.messages_fixture = self.messages_fixture;
        }
        if self.reports_dir.is_some() {
            config.reports_dir = self.reports_dir;
        }
        if self.no_report {
            config.reports_dir = None;
        }
        if !self.include.is_empty() {
            config.categories_include = Some(self.include);
        }
        if !self.exclude.is_empty() {
            config.categories_exclude = Some(self.exclude);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("reelsync=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let mut config = SyncConfig::from_env()?;
            args.apply(&mut config);
            let sheet_configured = config.sheets_id.is_some();
            let summary = reelsync_sync::run_sync_once(config).await?;
            for dest in &summary.destinations {
                println!(
                    "{}: {} ({} rows, {} watched updates, {} pruned, {} unidentifiable)",
                    dest.destination,
                    dest.plan,
                    dest.rows_written,
                    dest.watched_updates,
                    dest.pruned_rows,
                    dest.stats.unidentifiable.len()
                );
                if let Some(id) = dest.resource_id.as_deref().filter(|_| !sheet_configured) {
                    println!("  new spreadsheet created; set GOOGLE_SHEETS_ID={id} to keep using it");
                }
            }
            println!(
                "sync complete: run_id={} report={}",
                summary.run_id,
                summary.report_path.as_deref().unwrap_or("-")
            );
        }
        Commands::Identify { url, resolve } => {
            let config = SyncConfig::from_env()?;
            let resolver = MetadataResolver::from_settings(&ResolverSettings {
                http: config.http_client_config(),
                tmdb_api_key: config.tmdb_api_key.clone(),
            })?;
            let media = identify(&url);
            let host = media.host.as_deref().unwrap_or("-");
            println!("host: {host}");
            println!("id: {}", media.native_id.as_deref().unwrap_or("-"));
            println!("provider: {}", resolver.provider_for(host).unwrap_or("-"));
            if resolve {
                info!(%url, "resolving catalog entry");
                let entry = resolver.lookup(&url).await?;
                println!("{}", serde_json::to_string_pretty(&entry)?);
            }
        }
        Commands::Categories => {
            let config = SyncConfig::from_env()?;
            let schema = config.category_schema()?;
            for category in Category::ALL {
                let marker = if schema.contains(category) { "x" } else { " " };
                let required = if Category::REQUIRED.contains(&category) {
                    " (required)"
                } else {
                    ""
                };
                println!("[{marker}] {category}{required}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_args(argv: &[&str]) -> SyncArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Some(Commands::Sync(args)) => args,
            other => panic!("expected sync, got {other:?}"),
        }
    }

    #[test]
    fn flags_override_environment_config() {
        let args = sync_args(&[
            "reelsync",
            "sync",
            "--channel-id",
            "42",
            "--no-bot",
            "--output",
            "all",
            "--exclude",
            "Poster,Trailer",
            "--no-report",
        ]);
        let mut config = SyncConfig {
            channel_id: Some("1".into()),
            ..SyncConfig::default()
        };
        args.apply(&mut config);

        assert_eq!(config.channel_id.as_deref(), Some("42"));
        assert!(!config.discord_bot);
        assert_eq!(config.output, OutputType::All);
        assert_eq!(
            config.categories_exclude,
            Some(vec!["Poster".to_string(), "Trailer".to_string()])
        );
        assert_eq!(config.reports_dir, None);
    }

    #[test]
    fn bare_sync_keeps_config() {
        let mut config = SyncConfig {
            channel_id: Some("1".into()),
            max_messages: 7,
            ..SyncConfig::default()
        };
        SyncArgs::default().apply(&mut config);
        assert_eq!(config.channel_id.as_deref(), Some("1"));
        assert_eq!(config.max_messages, 7);
        assert!(config.reports_dir.is_some());
    }

    #[test]
    fn unknown_output_type_is_a_usage_error() {
        assert!(Cli::try_parse_from(["reelsync", "sync", "--output", "xlsx"]).is_err());
    }
}
