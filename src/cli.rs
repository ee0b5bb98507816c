use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser};

use crate::{
    config::Config,
    types::{MergeMethod, PrKey},
};

const BUILD_INFO_HUMAN: &str = env!("BUILD_INFO_HUMAN");

/// What the binary does after loading the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Enrich and print the table.
    List,
    Approve(PrKey),
    Merge(PrKey, MergeMethod),
    AutoMerge(PrKey, MergeMethod),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    Normal,
    /// URLs only.
    Quiet,
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub config_path: Option<PathBuf>,
    pub query: Option<String>,
    pub no_cache: bool,
    pub no_ai: bool,
    pub debug: bool,
    pub action: Action,
    pub display_mode: DisplayMode,
}

impl Options {
    /// Overlays command-line settings on `config`.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(query) = &self.query {
            config.github.query = query.clone();
        }
        config.github.query = format_user_query(&config.github.query);
        if self.no_cache {
            config.cache.enabled = false;
        }
        if self.no_ai {
            config.ai.enabled = false;
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
struct ActionArgs {
    /// Approve a pull request
    #[arg(long, help_heading = "Actions", value_name = "PR")]
    pub approve: Option<String>,

    /// Merge a pull request
    #[arg(long, help_heading = "Actions", value_name = "PR")]
    pub merge: Option<String>,

    /// Enable auto-merge on a pull request
    #[arg(long = "auto-merge", help_heading = "Actions", value_name = "PR")]
    pub auto_merge: Option<String>,

    /// Merge method for --merge and --auto-merge (merge, squash, rebase)
    #[arg(long, help_heading = "Actions", default_value = "squash", value_name = "METHOD")]
    pub method: String,
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "prtriage",
    about = "Triage open GitHub pull requests: diff size, CI, reviews and an optional AI recommendation"
)]
#[command(long_version = BUILD_INFO_HUMAN)]
struct CliArgs {
    /// Config file (default: $XDG_CONFIG_HOME/prtriage/config.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// GitHub search query (overrides github.query)
    #[arg(long, value_name = "SEARCH-QUERY")]
    pub query: Option<String>,

    /// Bypass and disable the on-disk cache
    #[arg(long = "no-cache")]
    pub no_cache: bool,

    /// Skip AI analysis
    #[arg(long = "no-ai")]
    pub no_ai: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    pub debug: bool,

    /// Print PR URLs only
    #[arg(short = 'q', long)]
    pub quiet: bool,

    #[command(flatten)]
    pub actions: ActionArgs,
}

impl CliArgs {
    fn validate(&self) -> Result<()> {
        let selected = [
            &self.actions.approve,
            &self.actions.merge,
            &self.actions.auto_merge,
        ]
        .iter()
        .filter(|a| a.is_some())
        .count();
        if selected > 1 {
            anyhow::bail!("Only one of --approve, --merge or --auto-merge may be given");
        }
        if let Some(query) = &self.query
            && query.trim().is_empty()
        {
            anyhow::bail!("--query cannot be empty");
        }
        Ok(())
    }

    fn action(&self) -> Result<Action> {
        let method: MergeMethod = self
            .actions
            .method
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        let action = if let Some(pr) = &self.actions.approve {
            Action::Approve(PrKey::parse(pr)?)
        } else if let Some(pr) = &self.actions.merge {
            Action::Merge(PrKey::parse(pr)?, method)
        } else if let Some(pr) = &self.actions.auto_merge {
            Action::AutoMerge(PrKey::parse(pr)?, method)
        } else {
            Action::List
        };
        Ok(action)
    }
}

/// Makes sure a search only returns open pull requests.
fn format_user_query(query: &str) -> String {
    let mut final_query = query.trim().to_string();

    if !final_query.contains("is:pr") {
        final_query = format!("{final_query} is:pr");
    }

    if !final_query.contains("is:open") && !final_query.contains("is:closed") {
        final_query = format!("{final_query} is:open");
    }

    final_query.trim().to_string()
}

/// Parses command-line arguments.
pub fn parse_args<I, T>(args: I) -> Result<Options>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = CliArgs::try_parse_from(args)?;
    cli.validate()?;

    Ok(Options {
        action: cli.action()?,
        display_mode: if cli.quiet {
            DisplayMode::Quiet
        } else {
            DisplayMode::Normal
        },
        config_path: cli.config,
        query: cli.query,
        no_cache: cli.no_cache,
        no_ai: cli.no_ai,
        debug: cli.debug,
    })
}
