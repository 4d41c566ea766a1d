mod config;
mod diff;
mod gitlab;
mod report;
mod retrieval;
mod store;
mod tool;

use clap::{Parser, Subcommand};
use rmcp::transport::stdio;
use rmcp::ServiceExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

use gitlab::{GitLabClient, HttpTransport};
use retrieval::Retriever;
use tool::{FetchDiffsArgs, IidArg, ListArgs, MrDiffService, ToolContext};

/// MR Diff Fetcher: materializes every changed file of a GitLab merge
/// request as a unified diff on local disk, for review tooling to read.
#[derive(Parser, Debug)]
#[command(name = "mr-diff-fetcher", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the diffs of one merge request into DOWNLOAD_PATH
    Fetch {
        /// Merge request IID (e.g., 123)
        mr_iid: String,

        /// Project id or path; defaults to PROJECT_ID
        #[arg(long)]
        project_id: Option<String>,

        /// Print the manifest as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// List merge requests of the configured project
    List {
        /// opened, closed, merged, locked or all
        #[arg(long)]
        state: Option<String>,

        /// all, assigned_to_me or created_by_me
        #[arg(long)]
        filter_by: Option<String>,

        /// Filter by this user instead of the token owner
        #[arg(long)]
        git_email: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Serve `fetch_merge_request_diffs` and `list_merge_requests` as MCP tools over stdio
    Serve,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!("loading configuration");
    let config = config::Config::load()?;
    let credentials = config.credentials()?;
    let download_root = config.download_root()?;
    debug!(base_url = %credentials.base_url, project = %credentials.project_id, root = %download_root.display(), "configuration resolved");

    let default_project = credentials.project_id.clone();
    let transport = HttpTransport::new(credentials, config.request_timeout())?;
    let client = GitLabClient::new(Arc::new(transport))
        .with_retry(config.retry_policy())
        .with_per_page(config.per_page());
    let ctx = ToolContext {
        retriever: Retriever::new(client, config.retrieval_options()),
        default_project,
        download_root,
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::Fetch {
            mr_iid,
            project_id,
            json,
        } => {
            let span = info_span!("fetch", mr_iid = %mr_iid);
            let args = FetchDiffsArgs {
                mr_iid: IidArg::Text(mr_iid),
                project_id,
            };
            let manifest = tool::fetch_diffs(&ctx, args, &cancel)
                .instrument(span)
                .await?;
            if json {
                report::print_json(&manifest)?;
            } else {
                report::print_manifest(&manifest);
            }
            info!(status = %manifest.status, failed = manifest.failed_count(), "done");
        }
        Command::List {
            state,
            filter_by,
            git_email,
            json,
        } => {
            let args = ListArgs {
                state,
                filter_by,
                git_email,
            };
            let listing = tool::list_requests(&ctx, args).await?;
            if json {
                report::print_json(&listing)?;
            } else {
                report::print_merge_requests(&listing);
            }
        }
        Command::Serve => {
            info!("serving tools on stdio");
            let server = MrDiffService::new(Arc::new(ctx), cancel.clone())
                .serve(stdio())
                .await?;
            server.waiting().await?;
            cancel.cancel();
        }
    }

    Ok(())
}
