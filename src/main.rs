use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use article_rag::config::{self, Config};
use article_rag::db::{self, Pool};
use article_rag::discovery::IndexDiscovery;
use article_rag::embedding::{Embedder, HttpEmbedder};
use article_rag::indexer::{self, Indexer};
use article_rag::model::IndexKind;
use article_rag::source::SqlContentSource;
use article_rag::vector::{self, SqliteVectorStore, VectorStore};
use article_rag::{build_prompt, dispatch_pending, CycleOutcome, MultiIndexRetriever, RetrievalSettings, SyncContext, SyncService};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the background sync until interrupted
    Serve,
    /// Run one sync cycle and exit
    Sync,
    /// Index pending replica articles and exit
    Index,
    /// Index a file into the user's knowledge base
    Upload {
        #[arg(long)]
        user: String,
        path: PathBuf,
    },
    /// Remove an uploaded file and its index
    DeleteUpload {
        #[arg(long)]
        user: String,
        filename: String,
    },
    /// Retrieve context for a question and print the assembled prompt
    Ask {
        #[arg(long)]
        user: String,
        query: String,
    },
    /// Print replica articles as JSON
    Articles {
        #[arg(long)]
        author: Option<i64>,
    },
}

struct Services {
    cfg: Config,
    replica: Pool,
    vectors: Arc<dyn VectorStore>,
}

impl Services {
    async fn init(cfg: Config) -> Result<Self> {
        cfg.ensure_dirs()?;
        let replica = db::init_pool(&cfg.app.replica_database_url()).await?;
        db::run_migrations(&replica).await?;
        let vectors: Arc<dyn VectorStore> =
            Arc::new(SqliteVectorStore::connect(&cfg.vector.database_url).await?);
        Ok(Self {
            cfg,
            replica,
            vectors,
        })
    }

    fn embedder(&self) -> Result<Arc<dyn Embedder>> {
        Ok(Arc::new(HttpEmbedder::from_config(&self.cfg.embedding)?))
    }

    async fn sync_service(&self) -> Result<Option<SyncService>> {
        if !self.cfg.source.is_enabled() {
            return Ok(None);
        }
        let source = SqlContentSource::connect(&self.cfg.source).await?;
        let ctx = SyncContext {
            replica: self.replica.clone(),
            source: Arc::new(source),
            embedder: self.embedder()?,
            vectors: self.vectors.clone(),
        };
        Ok(Some(SyncService::new(ctx, self.cfg.app.sync_interval())))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let services = Services::init(cfg).await?;

    match args.command {
        Command::Serve => serve(&services).await,
        Command::Sync => {
            let service = services
                .sync_service()
                .await?
                .ok_or_else(|| anyhow!("source.database_url is not configured"))?;
            match service.run_cycle().await? {
                CycleOutcome::Completed(report) => println!("{:#?}", report),
                CycleOutcome::Skipped => println!("skipped: another cycle is running"),
            }
            Ok(())
        }
        Command::Index => {
            let report =
                dispatch_pending(&services.replica, &services.embedder()?, &services.vectors).await?;
            println!("{:#?}", report);
            Ok(())
        }
        Command::Upload { user, path } => upload(&services, &user, &path).await,
        Command::DeleteUpload { user, filename } => delete_upload(&services, &user, &filename).await,
        Command::Ask { user, query } => ask(&services, &user, &query).await,
        Command::Articles { author } => {
            let articles = match author {
                Some(author_id) => db::list_articles_by_author(&services.replica, author_id).await?,
                None => db::list_articles(&services.replica).await?,
            };
            println!("{}", serde_json::to_string_pretty(&articles)?);
            Ok(())
        }
    }
}

async fn serve(services: &Services) -> Result<()> {
    let Some(service) = services.sync_service().await? else {
        info!("source database not configured, sync service disabled");
        return Ok(());
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = Arc::new(service).start(shutdown_rx);

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    if let Err(err) = handle.await {
        error!(?err, "sync task ended abnormally");
    }
    Ok(())
}

fn discovery(services: &Services) -> IndexDiscovery {
    IndexDiscovery::from_config(&services.cfg, services.replica.clone(), services.vectors.clone())
}

async fn upload(services: &Services, user: &str, path: &Path) -> Result<()> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("invalid file name: {}", path.display()))?
        .to_string();
    let dir = discovery(services)
        .user_upload_dir(user)
        .ok_or_else(|| anyhow!("invalid user name: {}", user))?;
    tokio::fs::create_dir_all(&dir).await?;
    let dest = dir.join(&filename);
    tokio::fs::copy(path, &dest)
        .await
        .with_context(|| format!("failed to copy {} to {}", path.display(), dest.display()))?;

    let indexer = Indexer::open(services.embedder()?, services.vectors.clone(), filename.as_str()).await?;
    indexer.index_file(&dest).await?;
    db::register_index(&services.replica, user, indexer.index_name(), IndexKind::Upload).await?;
    println!("indexed {} into {}", filename, indexer.index_name());
    Ok(())
}

async fn delete_upload(services: &Services, user: &str, filename: &str) -> Result<()> {
    let dir = discovery(services)
        .user_upload_dir(user)
        .ok_or_else(|| anyhow!("invalid user name: {}", user))?;
    if filename.contains(['/', '\\']) {
        bail!("invalid file name: {}", filename);
    }
    let dropped =
        indexer::remove_upload(&services.replica, services.vectors.as_ref(), user, filename).await?;
    if let Err(err) = tokio::fs::remove_file(dir.join(filename)).await {
        warn!(?err, filename, "failed to remove uploaded file");
    }
    if dropped {
        println!("deleted {}", vector::upload_index_name(filename));
    } else {
        println!("unregistered {} for {}", filename, user);
    }
    Ok(())
}

async fn ask(services: &Services, user: &str, query: &str) -> Result<()> {
    let retriever = MultiIndexRetriever::build(
        &discovery(services),
        services.embedder()?,
        services.vectors.clone(),
        RetrievalSettings::from(&services.cfg.retrieval),
        user,
    )
    .await?;
    let docs = retriever.retrieve(query).await?;
    println!("{}", build_prompt(query, &docs));
    Ok(())
}
