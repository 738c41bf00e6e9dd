mod anchors;
mod artifacts;
mod config;
mod error;
mod model;
mod pipeline;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use link_common::cms::{PayloadClient, PayloadConfig};
use link_common::embed_client::{EmbeddingClient, EmbeddingClientConfig};
use link_common::embedding::{EmbeddingBackend, LocalEmbedder};
use link_common::inject::LinkFilter;
use link_common::supervisor::{ServiceSupervisor, SupervisorConfig};

use artifacts::ArtifactStore;
use config::{BackendKind, Config, Profile, RelinkPolicy, RunOptions};
use pipeline::Pipeline;

/// link-pipeline - internal and affiliate linking for CMS articles
#[derive(Parser)]
#[command(name = "link-pipeline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Compute everything but never write to the CMS
    #[arg(long, global = true)]
    dry_run: bool,

    /// Rewrite at most this many articles (indexing always covers every article)
    #[arg(long, global = true)]
    limit: Option<usize>,

    /// Reuse the existing index and embeddings (`run` only)
    #[arg(long, global = true)]
    skip_index: bool,

    /// How to treat articles that were linked before
    #[arg(long, global = true, value_enum, default_value_t = RelinkPolicy::Skip)]
    relink: RelinkPolicy,

    /// TOML profile with boundary policy, anchor vocabulary and scoring limits
    #[arg(long, global = true)]
    policy: Option<PathBuf>,

    /// Also link affiliate products
    #[arg(long, global = true)]
    products: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Index published articles (and products) into posts-index.json
    BuildIndex,

    /// Embed new or changed index entries into embeddings.json
    GenerateEmbeddings,

    /// Rank related articles and products into similarity-matrix.json
    ComputeSimilarity,

    /// Insert links into article bodies and write them back
    ApplyLinks {
        /// Link only this article
        #[arg(long)]
        id: Option<String>,
    },

    /// Unwrap links previously added to article bodies
    RemoveLinks {
        /// Which links to remove
        #[arg(long, value_enum, default_value_t = RemoveTarget::Internal)]
        target: RemoveTarget,
    },

    /// build-index, generate-embeddings, compute-similarity and apply-links in order
    Run,

    /// Print link and artifact statistics as JSON
    Stats,
}

#[derive(Clone, Copy, ValueEnum)]
enum RemoveTarget {
    Internal,
    External,
    Sponsored,
    All,
}

impl From<RemoveTarget> for LinkFilter {
    fn from(target: RemoveTarget) -> Self {
        match target {
            RemoveTarget::Internal => LinkFilter::Internal,
            RemoveTarget::External => LinkFilter::External,
            RemoveTarget::Sponsored => LinkFilter::Sponsored,
            RemoveTarget::All => LinkFilter::All,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let profile = Profile::load(cli.policy.as_deref())?;
    info!(
        data_dir = %config.data_dir.display(),
        backend = ?config.backend,
        profile = ?cli.policy,
        "configuration loaded"
    );

    let options = RunOptions {
        dry_run: cli.dry_run,
        limit: cli.limit,
        skip_index: cli.skip_index,
        relink: cli.relink,
        include_products: cli.products || config.include_products,
        embed_batch_size: config.embed_batch_size,
    };

    let payload_config = PayloadConfig::from_env();
    info!(
        base_url = %payload_config.base_url,
        authenticated = payload_config.api_key.is_some(),
        "cms client configured"
    );
    let repo = PayloadClient::new(payload_config)?;

    let needs_embedder = match cli.command {
        Command::GenerateEmbeddings => true,
        Command::Run => !cli.skip_index,
        _ => false,
    };
    let (embedder, supervisor) = if needs_embedder {
        build_embedder(&config).await?
    } else {
        (None, None)
    };

    let pipeline = Pipeline::new(
        repo,
        embedder,
        ArtifactStore::new(&config.data_dir),
        profile,
        options,
    )?;
    let result = execute(&pipeline, cli.command).await;

    if let Some(supervisor) = supervisor {
        if let Err(e) = supervisor.stop().await {
            warn!(error = %e, "failed to stop embedding service");
        }
    }
    result
}

async fn build_embedder(
    config: &Config,
) -> anyhow::Result<(Option<EmbeddingBackend>, Option<Arc<ServiceSupervisor>>)> {
    match config.backend {
        BackendKind::Local => {
            info!("initializing local embedding model");
            let local = LocalEmbedder::new().await?;
            Ok((Some(EmbeddingBackend::Local(local)), None))
        }
        BackendKind::Http => {
            let client_config = EmbeddingClientConfig::from_env();
            info!(
                base_url = %client_config.base_url,
                model = %client_config.model,
                max_retries = client_config.max_retries,
                "embedding client configured"
            );

            let supervisor = match config
                .service_command
                .as_deref()
                .and_then(|command| SupervisorConfig::from_command_line(command, &client_config.base_url))
            {
                Some(supervisor_config) => {
                    info!(program = %supervisor_config.program, "embedding service supervised");
                    Some(Arc::new(ServiceSupervisor::new(supervisor_config)?))
                }
                None => None,
            };

            let client = EmbeddingClient::new(client_config, supervisor.clone())?;
            Ok((Some(EmbeddingBackend::Http(client)), supervisor))
        }
    }
}

async fn execute(
    pipeline: &Pipeline<PayloadClient, EmbeddingBackend>,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::BuildIndex => {
            pipeline.build_index().await?;
        }
        Command::GenerateEmbeddings => {
            pipeline.generate_embeddings().await?;
        }
        Command::ComputeSimilarity => {
            pipeline.compute_similarity()?;
        }
        Command::ApplyLinks { id: None } => {
            pipeline.apply_links().await?;
        }
        Command::ApplyLinks { id: Some(id) } => {
            pipeline.link_post(&id).await?;
        }
        Command::RemoveLinks { target } => {
            pipeline.remove_links(target.into()).await?;
        }
        Command::Run => {
            let reports = pipeline.run().await?;
            let links: usize = reports.iter().map(|r| r.links_added).sum();
            info!(stages = reports.len(), links_added = links, "pipeline finished");
        }
        Command::Stats => {
            let stats = pipeline.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}
