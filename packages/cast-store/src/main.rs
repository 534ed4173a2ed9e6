use anyhow::{Context, Result};
use cast_store::{EntryMetadata, StoreConfig, UploadFile, Vault, Visibility};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Parser)]
#[command(name = "cast")]
#[command(about = "Deduplicating content store with per-owner quotas", long_about = None)]
#[command(version)]
struct Cli {
    /// Identity the command acts as
    #[arg(long, global = true, env = "CAST_OWNER")]
    owner: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Store(StoreCommand),

    /// Show the effective configuration
    Config {
        /// Write it to the user config file
        #[arg(long)]
        save: bool,
    },
}

/// Commands that work on an open store
#[derive(Subcommand)]
enum StoreCommand {
    /// Store one or more files as a single all-or-nothing upload
    Put {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Display name (single file only; defaults to the file name)
        #[arg(long)]
        name: Option<String>,

        /// Content type (guessed from the extension when omitted)
        #[arg(long = "type")]
        content_type: Option<String>,

        /// Tag to attach, may be repeated
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Make the entries readable by everyone
        #[arg(long)]
        public: bool,

        /// Uploader name recorded on the entries (defaults to the owner)
        #[arg(long)]
        uploader: Option<String>,
    },

    /// Delete an entry
    Rm { entry_id: String },

    /// List the owner's entries
    Ls,

    /// Write an entry's content to stdout or a file
    Cat {
        entry_id: String,

        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Show an entry and its content record
    Info { entry_id: String },

    /// Show quota usage (defaults to the acting owner)
    Quota { owner_id: Option<String> },

    /// Set an owner's byte limit
    SetLimit { owner_id: String, byte_limit: u64 },

    /// Change an entry's display name
    Rename { entry_id: String, display_name: String },

    /// Make an entry public or private
    Visibility {
        entry_id: String,
        visibility: Visibility,
    },

    /// Replace an entry's tags
    Tag { entry_id: String, tags: Vec<String> },

    /// Remove unreferenced objects and settle interrupted deletes
    Gc {
        /// Dry run - don't actually delete anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Check ledgers and stored objects for consistency
    Verify,
}

impl Cli {
    fn owner(&self) -> Result<&str> {
        self.owner
            .as_deref()
            .context("No owner given: pass --owner or set CAST_OWNER")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr, results to stdout
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = StoreConfig::load().await?;

    match &cli.command {
        Commands::Config { save } => {
            if *save {
                config.save().await?;
            }
            print_json(&config)
        }
        Commands::Store(command) => {
            let vault = Vault::open(&config)
                .await
                .with_context(|| format!("Failed to open store at {}", config.root.display()))?;
            run(&vault, &cli, command).await
        }
    }
}

async fn run(vault: &Vault, cli: &Cli, command: &StoreCommand) -> Result<()> {
    match command {
        StoreCommand::Put {
            files,
            name,
            content_type,
            tags,
            public,
            uploader,
        } => {
            if name.is_some() && files.len() > 1 {
                anyhow::bail!("--name applies to a single file");
            }

            let mut uploads = Vec::with_capacity(files.len());
            for path in files {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let metadata = EntryMetadata {
                    display_name: name.clone().unwrap_or_else(|| file_name(path)),
                    tags: tags.clone(),
                    visibility: if *public {
                        Visibility::Public
                    } else {
                        Visibility::Private
                    },
                    uploader_name: uploader.clone(),
                };
                let content_type = content_type.clone().unwrap_or_else(|| {
                    mime_guess::from_path(path)
                        .first_or_octet_stream()
                        .essence_str()
                        .to_string()
                });
                uploads.push(UploadFile::new(bytes, content_type, metadata));
            }

            let entries = vault.ingest_batch(cli.owner()?, &uploads).await?;
            print_json(&entries)
        }
        StoreCommand::Rm { entry_id } => print_json(&vault.remove(cli.owner()?, entry_id).await?),
        StoreCommand::Ls => print_json(&vault.entries_for_owner(cli.owner()?).await?),
        StoreCommand::Cat { entry_id, output } => {
            let opened = vault.open_content(cli.owner()?, entry_id).await?;
            match output {
                Some(path) => tokio::fs::write(path, &opened.bytes)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&opened.bytes).await?;
                    stdout.flush().await?;
                }
            }
            Ok(())
        }
        StoreCommand::Info { entry_id } => {
            let owner = cli.owner()?;
            let location = vault.physical_location(owner, entry_id).await?;
            let entry = vault.entry(entry_id).await?;
            let record = vault.content_record(&entry.fingerprint).await?;
            print_json(&serde_json::json!({
                "entry": entry,
                "record": record,
                "physical_location": location,
            }))
        }
        StoreCommand::Quota { owner_id } => {
            let owner = match owner_id {
                Some(owner) => owner.as_str(),
                None => cli.owner()?,
            };
            let quota = vault.quota(owner).await?;
            print_json(&serde_json::json!({
                "owner_id": owner,
                "bytes_charged": quota.bytes_charged,
                "byte_limit": quota.byte_limit,
                "remaining": quota.remaining(),
            }))
        }
        StoreCommand::SetLimit {
            owner_id,
            byte_limit,
        } => print_json(&vault.set_byte_limit(owner_id, *byte_limit).await?),
        StoreCommand::Rename {
            entry_id,
            display_name,
        } => print_json(
            &vault
                .rename_entry(cli.owner()?, entry_id, display_name)
                .await?,
        ),
        StoreCommand::Visibility {
            entry_id,
            visibility,
        } => print_json(
            &vault
                .set_visibility(cli.owner()?, entry_id, *visibility)
                .await?,
        ),
        StoreCommand::Tag { entry_id, tags } => {
            print_json(&vault.set_tags(cli.owner()?, entry_id, tags).await?)
        }
        StoreCommand::Gc { dry_run } => print_json(&vault.sweep_orphans(*dry_run).await?),
        StoreCommand::Verify => {
            let report = vault.verify().await?;
            print_json(&report)?;
            if !report.is_consistent() {
                anyhow::bail!("Store is inconsistent");
            }
            Ok(())
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
