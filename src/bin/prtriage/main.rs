mod display;

use std::sync::Arc;

use anyhow::{Context, Result};
use prtriage::{
    Action, Agent, AgentSettings, BackoffPolicies, Board, Config, DisplayMode, Enricher, Event,
    Gateway, GitHub, OpenAiClient, PromptTemplate, SecretResolver, ToolRegistry, parse_args,
};
use tracing::{debug, info, warn};

use display::{display_analyses, display_pr_table};

fn handle_clap_help_version(clap_err: &clap::Error) -> ! {
    use clap::error::ErrorKind;
    match clap_err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            print!("{clap_err}");
            std::process::exit(0);
        }
        _ => {
            eprint!("{clap_err}");
            std::process::exit(2);
        }
    }
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let default_level = if debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn build_agent(
    config: &Config,
    gateway: &Arc<Gateway>,
    policies: &BackoffPolicies,
) -> Result<Agent> {
    let model = OpenAiClient::new(
        &config.ai.base_url,
        config.ai_api_key(),
        &config.ai.model,
        &policies.llm,
        config.timeouts.analysis,
    )?;
    let tools = ToolRegistry::standard(
        config.ai.tools,
        gateway.clone(),
        &policies.default,
        config.tool_timeout(),
        config.cache.max_age,
    )?;
    let template = match &config.ai.prompt_template {
        Some(path) => PromptTemplate::from_file(path)?,
        None => PromptTemplate::default(),
    };

    Ok(Agent::new(
        Arc::new(model),
        Arc::new(tools),
        gateway.cache().clone(),
        template,
        AgentSettings {
            max_iterations: config.ai.max_iterations,
            analysis_timeout: config.timeouts.analysis,
            tool_timeout: config.tool_timeout(),
            ttl: config.cache.max_age,
        },
    ))
}

async fn run_action(gateway: &Gateway, query: &str, action: &Action) -> Result<()> {
    let target = match action {
        Action::List => return Ok(()),
        Action::Approve(pr) | Action::Merge(pr, _) | Action::AutoMerge(pr, _) => pr,
    };
    let pr = gateway
        .search(query)
        .await?
        .into_iter()
        .find(|pr| pr.key() == *target)
        .with_context(|| format!("{target} is not among the open PRs matching '{query}'"))?;

    match action {
        Action::Approve(_) => {
            gateway.approve(&pr).await?;
            println!("Approved {target}");
        }
        Action::Merge(_, method) => {
            gateway.merge(&pr, *method).await?;
            println!("Merged {target} ({method})", method = method.as_str());
        }
        Action::AutoMerge(_, method) => {
            gateway.enable_auto_merge(&pr, *method).await?;
            println!("Enabled auto-merge for {target} ({method})", method = method.as_str());
        }
        Action::List => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = match parse_args(std::env::args()) {
        Ok(options) => options,
        Err(err) => {
            if let Some(clap_err) = err.downcast_ref::<clap::Error>() {
                handle_clap_help_version(clap_err);
            } else {
                return Err(err);
            }
        }
    };
    init_tracing(options.debug);

    let mut config = Config::load(options.config_path.as_deref())?;
    options.apply_to(&mut config);
    config.resolve_secrets(&SecretResolver::new())?;

    let cache = config.open_cache();
    match cache.cleanup().await {
        Ok(removed) => debug!(removed, "Removed expired cache entries"),
        Err(e) => warn!(error = %e, "Cache cleanup failed"),
    }

    let policies = config.backoff_policies();
    let forge = Arc::new(GitHub::new(config.github_token()?)?);
    let gateway = Arc::new(Gateway::new(
        forge,
        cache.clone(),
        policies.github.clone(),
        config.check_filter(),
        config.cache.max_age,
    ));
    let query = config.github.query.clone();
    let mut stdout = std::io::stdout();

    if options.action != Action::List {
        let result = run_action(&gateway, &query, &options.action).await;
        cache.close().await?;
        return result;
    }

    if options.display_mode == DisplayMode::Quiet {
        for pr in gateway.search(&query).await? {
            println!("{}", pr.url);
        }
        cache.close().await?;
        return Ok(());
    }

    let agent = if config.ai.enabled {
        Some(Arc::new(build_agent(&config, &gateway, &policies)?))
    } else {
        None
    };
    let mut board = Board::new(agent.is_some(), config.github.stagger);
    let mut enricher = Enricher::new(gateway.clone(), agent, query, config.timeouts.github);

    let commands = board.fetch_prs();
    enricher
        .settle(&mut board, commands, |event| {
            if let Event::PrsLoaded(Ok(prs)) = event {
                info!(count = prs.len(), "Enriching pull requests");
            }
        })
        .await;

    if let Some(error) = board.list_error() {
        cache.close().await?;
        anyhow::bail!("Failed to load pull requests: {error}");
    }

    display_pr_table(board.prs(), &mut stdout)?;
    display_analyses(board.prs(), &mut stdout)?;
    cache.close().await?;
    Ok(())
}
