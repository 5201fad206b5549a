use crate::archive::{self, Format};
use crate::backup::{Options, Summary, run_backup};
use crate::github::{Client, Credentials, DEFAULT_API_URL, RepoRef};
use anyhow::Result;
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "bbs-backup",
    version,
    about = "Back up the issues, comments, reactions and labels of a GitHub repository",
    after_help = r#"EXAMPLES:
    bbs-backup -u username:token net4people/bbs bbs-20201231.zip
    bbs-backup -u username:token net4people/bbs bbs.sqlite3
    bbs-backup net4people/bbs bbs.zip --no-reactions     Unauthenticated, fewer requests

Without -u GitHub allows 60 requests per hour; with a personal access token
(no scopes needed) it allows 5000."#
)]
pub struct Cli {
    /// Authenticate with a personal access token
    #[arg(
        short = 'u',
        long = "user",
        value_name = "USERNAME:TOKEN",
        env = "GITHUB_AUTH",
        hide_env_values = true
    )]
    pub auth: Option<Credentials>,

    /// Repository to back up
    #[arg(value_name = "OWNER/REPO")]
    pub repo: RepoRef,

    /// Archive to write (.zip, or .sqlite3/.sqlite/.db)
    #[arg(value_name = "OUTPUT-FILE")]
    pub output: PathBuf,

    /// Archive format, instead of guessing from the file extension
    #[arg(long, value_enum, help_heading = "Archive Options")]
    pub format: Option<Format>,

    /// Skip reactions on issues and comments
    #[arg(long, help_heading = "Archive Options")]
    pub no_reactions: bool,

    /// Parallel detail requests
    #[arg(
        long,
        default_value_t = 1,
        value_parser = clap::value_parser!(u16).range(1..=16),
        help_heading = "Network Options"
    )]
    pub jobs: u16,

    /// GitHub REST API base URL
    #[arg(
        long,
        env = "GITHUB_API_URL",
        default_value = DEFAULT_API_URL,
        help_heading = "Network Options"
    )]
    pub api_url: Url,
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn print_summary(summary: &Summary, requests: usize) {
    println!("\n--- Summary ---");
    println!("  Issues:    {}", summary.issues);
    println!("  Comments:  {}", summary.comments);
    println!("  Reactions: {}", summary.reactions);
    println!("  Labels:    {}", summary.labels);
    println!("  Requests:  {requests}");
}

pub fn run() -> Result<()> {
    let args = Cli::parse();
    init_logging();

    // Settle the format before touching the network.
    let format = match args.format {
        Some(f) => f,
        None => Format::from_path(&args.output)?,
    };
    if args.auth.is_none() {
        log::warn!(
            "No credentials given; GitHub limits unauthenticated clients to 60 requests per hour"
        );
    }

    let client = Client::new(args.auth.clone())?;
    let options = Options {
        reactions: !args.no_reactions,
        jobs: usize::from(args.jobs),
    };
    println!("Backing up {} to {} ({format})", args.repo, args.output.display());

    let summary = archive::create(&args.output, format, |archive| {
        run_backup(&client, &args.api_url, &args.repo, archive, &options)
    })?;

    print_summary(&summary, client.request_count());
    Ok(())
}
