//! Command line interface for the imprint relay engine. Supports key
//! handling, event verification and publishing, relay queries, comment
//! threads, engagement counts, long-form indexing and durability-cache
//! maintenance.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use imprint::{
    client::{Published, PublishStatus, RelayClient},
    comments::CommentService,
    config::{Settings, DEFAULT_NIP46_RELAY, DEFAULT_RELAYS},
    engagement::{EngagementCache, EngagementService, EngagementUpdate},
    event::{self, Event},
    indexer,
    keys::{self, IdentityKind},
    relay::Filter,
    signer::Signer,
    store::FileStore,
};
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "imprint",
    author,
    version,
    about = "Nostr relay coordination for long-form publishing",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the durability cache tree at `STORE_ROOT`.
    Init,
    /// Generate, decode and encode keys.
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },
    /// Check ids and signatures of event files.
    Verify {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Publish signed event files to the configured relays.
    Publish {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Query the configured relays and print matching events.
    Fetch {
        /// Comma-separated kinds.
        #[arg(long, value_delimiter = ',')]
        kinds: Vec<u32>,
        /// Referenced event id (`#e`).
        #[arg(long)]
        event: Vec<String>,
        #[arg(long)]
        author: Vec<String>,
        #[arg(long)]
        since: Option<u64>,
        #[arg(long)]
        until: Option<u64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the comment thread under a root event.
    Comments {
        root: String,
        /// Other ids whose comments belong to the same thread.
        #[arg(long)]
        related: Vec<String>,
        #[arg(long)]
        viewer: Option<String>,
    },
    /// Sign a comment with the instance key and publish it.
    Comment {
        root: String,
        /// Author of the root event.
        #[arg(long)]
        author: String,
        #[arg(long)]
        content: String,
        #[arg(long)]
        parent: Option<String>,
    },
    /// Publish a deletion request for a comment.
    DeleteComment {
        id: String,
        #[arg(long)]
        root: String,
    },
    /// Print like and zap counts for events.
    Engagement {
        #[arg(required = true)]
        ids: Vec<String>,
        #[arg(long)]
        viewer: Option<String>,
    },
    /// Like an event with the instance key, or undo the like.
    Like {
        id: String,
        #[arg(long)]
        author: String,
    },
    /// Publish a zap request with the instance key.
    Zap {
        id: String,
        #[arg(long)]
        author: String,
        #[arg(long)]
        sats: u64,
    },
    /// Index long-form posts from the configured relays.
    Index {
        #[arg(long)]
        since: Option<u64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Hide a pubkey's comments and engagement from a viewer.
    Block { viewer: String, pubkey: String },
    /// Remove a pubkey from a viewer's block list.
    Unblock { viewer: String, pubkey: String },
    /// Rebuild the durability cache index.
    Reindex,
    /// Verify a random sample of cached events.
    VerifyCache {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
}

/// Operations available under `imprint keys`.
#[derive(Subcommand)]
enum KeysAction {
    /// Print a fresh private key and its public key.
    Generate,
    /// Decode an `npub`/`nsec` string to hex.
    Decode {
        value: String,
        /// Accept an `npub` whose checksum does not validate.
        #[arg(long)]
        lenient: bool,
    },
    /// Encode 64 hex chars as `npub` (or `nsec` with `--private`).
    Encode {
        hex: String,
        #[arg(long)]
        private: bool,
    },
    /// Print the public key of a private key (`nsec` or hex).
    Derive { secret: String },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let command = match cli.command {
        Commands::Keys { action } => return handle_keys(action),
        Commands::Verify { files } => return verify_files(&files),
        command => command,
    };

    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let store = Arc::new(FileStore::new(cfg.store_root.clone()));
    let client = Arc::new(RelayClient::new(cfg.relay_config()));
    match command {
        Commands::Init => {
            store.init()?;
            println!("initialized {}", store.root().display());
        }
        Commands::Publish { files } => {
            for f in files {
                let ev = read_event(&f)?;
                event::check_event(&ev).with_context(|| format!("{f}: event {}", ev.id))?;
                let relays = client.publish(&ev, &cfg.relays).await;
                print_published(&Published { event: ev, relays });
            }
        }
        Commands::Fetch {
            kinds,
            event,
            author,
            since,
            until,
            limit,
        } => {
            let mut filter = Filter::new();
            if !kinds.is_empty() {
                filter = filter.kinds(kinds);
            }
            if !event.is_empty() {
                filter = filter.events(event);
            }
            if !author.is_empty() {
                filter = filter.authors(author);
            }
            filter.since = since;
            filter.until = until;
            filter.limit = Some(limit.unwrap_or(cfg.feed_limit));
            for ev in client.fetch_events(&[filter], &cfg.relays, None).await {
                println!("{}", serde_json::to_string(&ev)?);
            }
        }
        Commands::Comments {
            root,
            related,
            viewer,
        } => {
            let svc = CommentService::new(client, store.clone(), store, cfg.comment_config());
            let thread = svc
                .fetch_thread(&root, &related, None, viewer.as_deref(), &cfg.relays)
                .await;
            println!("{}", serde_json::to_string_pretty(&thread)?);
        }
        Commands::Comment {
            root,
            author,
            content,
            parent,
        } => {
            let signer = instance_signer(&cfg)?;
            let svc = CommentService::new(client, store.clone(), store, cfg.comment_config());
            let published = svc
                .publish_comment(&signer, &root, &author, &content, parent.as_deref(), &cfg.relays)
                .await?;
            print_published(&published);
        }
        Commands::DeleteComment { id, root } => {
            let signer = instance_signer(&cfg)?;
            let svc = CommentService::new(client, store.clone(), store, cfg.comment_config());
            let published = svc.delete_comment(&signer, &id, &root, &cfg.relays).await?;
            print_published(&published);
        }
        Commands::Engagement { ids, viewer } => {
            let svc = engagement_service(&cfg, client, store);
            svc.hydrate(&ids, &cfg.relays).await;
            for id in &ids {
                let e = svc.engagement_for(id, viewer.as_deref());
                println!("{}", serde_json::to_string(&e)?);
            }
        }
        Commands::Like { id, author } => {
            let signer = instance_signer(&cfg)?;
            let svc = engagement_service(&cfg, client, store);
            svc.hydrate(&[id.clone()], &cfg.relays).await;
            let update = svc.toggle_like(&signer, &id, &author, &cfg.relays).await?;
            print_update(&update)?;
        }
        Commands::Zap { id, author, sats } => {
            let signer = instance_signer(&cfg)?;
            let svc = engagement_service(&cfg, client, store);
            let update = svc.add_zap(&signer, &id, &author, sats, &cfg.relays).await?;
            print_update(&update)?;
        }
        Commands::Index { since, limit } => {
            let index = indexer::index_long_form(
                &client,
                &cfg.relays,
                since,
                limit.unwrap_or(cfg.feed_limit),
            )
            .await;
            for entry in index.latest_versions() {
                println!("{}", serde_json::to_string(entry)?);
            }
        }
        Commands::Block { viewer, pubkey } => {
            store.block(&viewer, &pubkey)?;
        }
        Commands::Unblock { viewer, pubkey } => {
            if !store.unblock(&viewer, &pubkey)? {
                bail!("{pubkey} is not blocked for {viewer}");
            }
        }
        Commands::Reindex => {
            let count = store.reindex()?;
            println!("indexed {count} events");
        }
        Commands::VerifyCache { sample } => {
            let checked = store.verify_sample(sample)?;
            println!("verified {checked} events");
        }
        Commands::Keys { .. } | Commands::Verify { .. } => {}
    }
    Ok(())
}

fn verify_files(files: &[String]) -> anyhow::Result<()> {
    for f in files {
        let ev = read_event(f)?;
        event::check_event(&ev).with_context(|| format!("{f}: event {}", ev.id))?;
        println!("{f}: ok {}", ev.id);
    }
    Ok(())
}

fn handle_keys(action: KeysAction) -> anyhow::Result<()> {
    match action {
        KeysAction::Generate => {
            let sk = keys::generate_secret_key();
            println!("nsec: {}", keys::encode(&sk.secret_bytes(), IdentityKind::Private)?);
            let pk = keys::derive_public_key(&sk.secret_bytes())?;
            println!("npub: {}", keys::encode(&pk, IdentityKind::Public)?);
        }
        KeysAction::Decode { value, lenient } => {
            let bytes = if lenient {
                keys::decode_lenient(&value)?
            } else {
                keys::decode(&value)?.1
            };
            println!("{}", hex::encode(bytes));
        }
        KeysAction::Encode { hex: input, private } => {
            let raw = hex::decode(input.trim()).context("decoding hex")?;
            let bytes: [u8; 32] = raw
                .try_into()
                .map_err(|_| anyhow::anyhow!("expected 32 bytes"))?;
            let kind = if private {
                IdentityKind::Private
            } else {
                IdentityKind::Public
            };
            println!("{}", keys::encode(&bytes, kind)?);
        }
        KeysAction::Derive { secret } => {
            let sk = keys::load_secret_key(&secret)?;
            println!("{}", keys::derive_public_key_hex(&sk));
        }
    }
    Ok(())
}

fn read_event(path: &str) -> anyhow::Result<Event> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {path}"))
}

fn instance_signer(cfg: &Settings) -> anyhow::Result<Signer> {
    match cfg.secret_key()? {
        Some(sk) => Ok(Signer::local(sk)),
        None => bail!("no instance key configured; set NOSTR_NSEC or NOSTR_SK_HEX"),
    }
}

fn engagement_service(cfg: &Settings, client: Arc<RelayClient>, store: Arc<FileStore>) -> EngagementService {
    let cache = Arc::new(EngagementCache::new(cfg.engagement_ttl));
    EngagementService::new(client, store, cache)
}

fn print_published(published: &Published) {
    println!("{} accepted by {}", published.event.id, published.accepted());
    for (relay, status) in &published.relays {
        match status {
            PublishStatus::Ok => println!("  {relay}: {status}"),
            _ => eprintln!("  {relay}: {status}"),
        }
    }
}

fn print_update(update: &EngagementUpdate) -> anyhow::Result<()> {
    if let Some(published) = &update.published {
        print_published(published);
    }
    println!("{}", serde_json::to_string(&update.engagement)?);
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("imprint-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", display_path(&store_root)));
    content.push_str(&format!("NOSTR_RELAYS={DEFAULT_RELAYS}\n"));
    content.push_str("NOSTR_NSEC=\n");
    content.push_str(&format!("NIP46_RELAY={DEFAULT_NIP46_RELAY}\n"));
    content.push_str("RELAY_MAX_CONCURRENT=5\n");
    content.push_str("RELAY_TIMEOUT_SECS=5\n");
    content.push_str("FEED_LIMIT=100\n");
    content.push_str("TOR_SOCKS=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli).await
}
