// Command-line front end

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::pipeline::{
    DestinationTarget, MediaSourceReference, PipelineConfig, PipelineOrchestrator, PostMetadata,
    PublishRequest, Visibility,
};

#[derive(Parser)]
#[command(name = "post-relay")]
#[command(author, version, about = "Relay a hosted video to a page as native video")]
pub struct Cli {
    /// Path to a JSON config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Acquire, fit and publish one video
    Publish {
        /// Source link (HTTP URL, Drive/Dropbox share link, video-site URL)
        #[arg(long)]
        source: String,

        /// Destination page (container) id
        #[arg(long)]
        page_id: String,

        /// Page access token
        #[arg(long, env = "POST_RELAY_TOKEN", hide_env_values = true)]
        token: String,

        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        description: String,

        /// Tag, may be repeated
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// public, unlisted or private
        #[arg(long, default_value = "public")]
        visibility: Visibility,

        /// Text the verifier looks for (defaults to the title)
        #[arg(long)]
        marker: Option<String>,

        /// Expected source size in bytes, also the transcode target
        #[arg(long)]
        target_size: Option<u64>,

        /// Expected duration in seconds
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Show the canonical id and candidate list for a source
    Resolve {
        source: String,
    },

    /// Check that a token can read the page
    CheckToken {
        #[arg(long)]
        page_id: String,

        #[arg(long, env = "POST_RELAY_TOKEN", hide_env_values = true)]
        token: String,
    },

    /// Report availability of ffprobe, ffmpeg and yt-dlp
    Tools,
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "post_relay_lib=debug,post_relay=debug"
    } else {
        "post_relay_lib=info,post_relay=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: cannot encode output: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn fail(e: impl std::fmt::Display) -> ExitCode {
    eprintln!("error: {}", e);
    ExitCode::FAILURE
}

/// Parse arguments, run the command and map the outcome to an exit code
pub async fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match PipelineConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return fail(e),
    };
    let orchestrator = match PipelineOrchestrator::new(config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => return fail(e),
    };

    match cli.command {
        Commands::Publish {
            source,
            page_id,
            token,
            title,
            description,
            tags,
            visibility,
            marker,
            target_size,
            duration,
        } => {
            let request = PublishRequest {
                source: MediaSourceReference::new(source)
                    .with_size_hint(target_size)
                    .with_duration_hint(duration),
                destination: DestinationTarget::new(page_id, token),
                metadata: PostMetadata::new(title)
                    .with_description(description)
                    .with_tags(tags)
                    .with_visibility(visibility)
                    .with_marker(marker),
            };

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling run");
                    on_signal.cancel();
                }
            });

            let result = orchestrator.run(request, cancel).await;
            let printed = print_json(&result);
            if result.success {
                printed
            } else {
                ExitCode::FAILURE
            }
        }

        Commands::Resolve { source } => match orchestrator.resolve(&source) {
            Ok(resolved) => print_json(&resolved),
            Err(e) => {
                if let Some(hint) = e.hint() {
                    eprintln!("hint: {}", hint);
                }
                fail(e)
            }
        },

        Commands::CheckToken { page_id, token } => {
            match orchestrator
                .check_credentials(&DestinationTarget::new(page_id, token))
                .await
            {
                Ok(report) => print_json(&report),
                Err(e) => fail(e),
            }
        }

        Commands::Tools => {
            let report = orchestrator.tool_report();
            let missing = report.iter().any(|t| !t.is_available);
            let printed = print_json(&report);
            if missing {
                ExitCode::FAILURE
            } else {
                printed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_publish_arguments() {
        let cli = Cli::try_parse_from([
            "post-relay",
            "publish",
            "--source",
            "https://files.example.com/v.mp4",
            "--page-id",
            "123",
            "--token",
            "t",
            "--title",
            "Sunset",
            "--tag",
            "travel",
            "--tag",
            "sea",
            "--visibility",
            "unlisted",
            "--target-size",
            "94371840",
        ])
        .unwrap();

        match cli.command {
            Commands::Publish {
                tags,
                visibility,
                target_size,
                ..
            } => {
                assert_eq!(tags, vec!["travel", "sea"]);
                assert_eq!(visibility, Visibility::Unlisted);
                assert_eq!(target_size, Some(94_371_840));
            }
            _ => panic!("expected publish"),
        }
    }

    #[test]
    fn test_rejects_unknown_visibility() {
        let parsed = Cli::try_parse_from([
            "post-relay",
            "publish",
            "--source",
            "x",
            "--page-id",
            "1",
            "--token",
            "t",
            "--title",
            "t",
            "--visibility",
            "friends",
        ]);
        assert!(parsed.is_err());
    }
}
