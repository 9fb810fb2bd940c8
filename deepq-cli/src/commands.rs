//! CLI subcommand handlers.

use crate::{Commands, ConfigAction};
use anyhow::Context;
use deepq_core::config::{DeepqConfig, load_config, user_config_path};
use deepq_core::gateway::{AppState, ConfiguredEngines, run_gateway};
use deepq_core::research::output::ReportGenerator;
use deepq_core::research::{
    CycleSummary, FetchStatus, Query, ResearchCallback, ResearchEngine, SearchResult,
    create_search_gateway,
};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Options {
    pub workspace: PathBuf,
    pub config_file: Option<PathBuf>,
    pub quiet: bool,
}

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, options: &Options) -> anyhow::Result<()> {
    match command {
        Commands::Research {
            topic,
            cycles,
            output,
            model,
            json,
        } => handle_research(options, &topic, cycles, &output, model, json).await,
        Commands::Search { query, max_results } => {
            handle_search(options, &query, max_results).await
        }
        Commands::Serve { host, port } => handle_serve(options, host, port).await,
        Commands::Config { action } => handle_config(options, action),
    }
}

fn load(options: &Options) -> anyhow::Result<DeepqConfig> {
    let config = load_config(
        Some(&options.workspace),
        options.config_file.as_deref(),
        None,
    )
    .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    for warning in config.validate() {
        tracing::warn!("{warning}");
    }
    Ok(config)
}

async fn handle_research(
    options: &Options,
    topic: &str,
    cycles: Option<usize>,
    output: &Path,
    model: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let topic = topic.trim();
    if topic.is_empty() {
        anyhow::bail!("topic must not be empty");
    }

    let mut config = load(options)?;
    if let Some(model) = model {
        config.llm.model = model;
    }
    let params = config.research.params(topic, cycles);

    let mut engine = ResearchEngine::from_config(&config)?;
    if !options.quiet {
        engine = engine.with_callback(Arc::new(ProgressPrinter));
    }

    let report = engine
        .run(&params)
        .await
        .map_err(|e| anyhow::anyhow!("Research failed during {}: {}", e.stage(), e))?;

    report
        .save_markdown(output)
        .with_context(|| format!("writing {}", output.display()))?;
    if json {
        let json_path = output.with_extension("json");
        report
            .save_json(&json_path)
            .with_context(|| format!("writing {}", json_path.display()))?;
        println!("JSON written to {}", json_path.display());
    }

    println!("{}", ReportGenerator::digest(&report));
    println!("Report written to {}", output.display());
    Ok(())
}

async fn handle_search(options: &Options, query: &str, max_results: usize) -> anyhow::Result<()> {
    let config = load(options)?;
    let timeout = Duration::from_secs(config.research.search_timeout_secs.max(1));
    let gateway = create_search_gateway(&config.search, timeout)?;
    let results = tokio::time::timeout(timeout, gateway.search(query, max_results.max(1)))
        .await
        .map_err(|_| anyhow::anyhow!("search timed out after {}s", timeout.as_secs()))??;
    print!("{}", format_results(&results));
    Ok(())
}

async fn handle_serve(
    options: &Options,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let mut config = load(options)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    println!("deepq API listening on http://{}", config.server.bind_addr());
    println!("Press Ctrl+C to stop.");

    let state = AppState::new(config, Arc::new(ConfiguredEngines));
    run_gateway(state).await?;
    Ok(())
}

fn handle_config(options: &Options, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load(options)?;
            println!("{}", toml::to_string_pretty(&config.redacted())?);
        }
        ConfigAction::Path => print!("{}", config_paths(options)),
    }
    Ok(())
}

/// Config file locations in load order, lowest priority first.
fn config_paths(options: &Options) -> String {
    let mut paths: Vec<PathBuf> = Vec::new();
    if let Some(user) = user_config_path() {
        paths.push(user);
    }
    paths.push(options.workspace.join("deepq.toml"));
    if let Some(file) = &options.config_file {
        paths.push(file.clone());
    }

    let mut out = String::new();
    for path in paths {
        let marker = if path.exists() { "found" } else { "missing" };
        let _ = writeln!(out, "{} ({marker})", path.display());
    }
    out.push_str("Environment variables: DEEPQ_<SECTION>__<KEY>\n");
    out
}

fn format_results(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No results.\n".to_string();
    }
    let mut out = String::new();
    for (i, result) in results.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, result.title);
        let _ = writeln!(out, "   {}", result.url);
        let snippet = result.snippet.trim();
        if !snippet.is_empty() {
            let _ = writeln!(out, "   {snippet}");
        }
    }
    out
}

/// Prints research progress to stderr.
struct ProgressPrinter;

impl ResearchCallback for ProgressPrinter {
    fn on_cycle_start(&self, cycle: usize, budget: usize) {
        eprintln!("[cycle {cycle}/{budget}]");
    }

    fn on_queries_planned(&self, _cycle: usize, queries: &[Query], fallback: bool) {
        if fallback {
            eprintln!("  planner unavailable, searching the topic directly");
        }
        for query in queries {
            eprintln!("  query: {}", query.text);
        }
    }

    fn on_search_complete(&self, query: &str, results: usize) {
        eprintln!("  {results} result(s) for \"{query}\"");
    }

    fn on_fetch_complete(&self, url: &str, status: &FetchStatus) {
        match status {
            FetchStatus::Ok => eprintln!("  read {url}"),
            FetchStatus::Failed(reason) => eprintln!("  skipped {url} ({reason})"),
        }
    }

    fn on_cycle_complete(&self, summary: &CycleSummary) {
        eprintln!(
            "  cycle {} done: {} source(s) read, {} open gap(s)",
            summary.cycle, summary.fetched_ok, summary.open_gaps
        );
    }

    fn on_synthesis_start(&self, sources: usize) {
        eprintln!("Writing report from {sources} source(s)...");
    }
}
