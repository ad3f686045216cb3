use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub mod annotation;
pub mod batch;
pub mod enrichment;
pub mod logging;
pub mod materialize;
pub mod prompts;
mod providers;
pub mod region;
pub mod rows;
pub mod settings;
#[cfg(test)]
mod test_util;
pub mod translator;
pub mod workbook;

pub use batch::{Pipeline, Progress, ResultTable, RowOutcome, RowStage};
pub use enrichment::SearchMode;
pub use providers::{
    Claude, Gemini, OpenAI, Provider, ProviderImpl, ProviderKind, ProviderResponse, ProviderUsage,
    RetryPolicy,
};

use enrichment::Enricher;
use prompts::{Prompts, TargetProfile};
use region::RegionTable;
use rows::GlRow;
use settings::Settings;
use translator::{TranslationBrief, Translator};
use workbook::Table;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub data: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub model: Option<String>,
    pub search_model: Option<String>,
    pub key: Option<String>,
    pub search_mode: Option<SearchMode>,
    pub target_company: Option<String>,
    pub target_industry: Option<String>,
    pub supplier_hint: Option<String>,
    pub context: Option<String>,
    pub instruction: Option<String>,
    pub settings_path: Option<String>,
    pub country_codes: Option<PathBuf>,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub output_path: PathBuf,
    pub rows: usize,
}

/// A decoded input sheet whose columns and size have been validated.
#[derive(Debug, Clone)]
pub struct BatchInput {
    pub table: Table,
    pub rows: Vec<GlRow>,
}

/// Translates the `--data` workbook and writes the annotated copy.
pub async fn run<F>(config: Config, on_progress: F) -> Result<BatchReport>
where
    F: FnMut(Progress),
{
    let settings = load_config_settings(&config)?;
    let provider = provider_from_config(&config, &settings)?;
    run_with_provider(provider, &config, &settings, on_progress).await
}

/// Translates a single `国名 / サプライヤ名 / 費目 / 案件名 / 摘要` line.
pub async fn run_sample(config: Config, input: &str) -> Result<String> {
    let settings = load_config_settings(&config)?;
    let provider = provider_from_config(&config, &settings)?;
    run_sample_with_provider(provider, &config, &settings, input).await
}

pub async fn run_with_provider<P, F>(
    provider: P,
    config: &Config,
    settings: &Settings,
    on_progress: F,
) -> Result<BatchReport>
where
    P: Provider + Clone,
    F: FnMut(Progress),
{
    let data = config
        .data
        .as_deref()
        .ok_or_else(|| anyhow!("no input workbook given (use --data)"))?;
    let bytes =
        fs::read(data).with_context(|| format!("failed to read input: {}", data.display()))?;
    let input = load_batch_input(&bytes, settings.max_rows)
        .with_context(|| format!("invalid input: {}", data.display()))?;
    let rows = input.rows.len();

    let pipeline = build_pipeline(provider, config, settings).await?;
    let workers = config
        .workers
        .filter(|workers| *workers > 0)
        .unwrap_or(settings.workers);
    let table = translate_table(&pipeline, input, workers, on_progress).await?;
    let bytes = workbook::write_xlsx(&table)?;

    let dir = config
        .output_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create output dir: {}", dir.display()))?;
    let name = materialize::output_filename(&settings.output_prefix, materialize::local_now())?;
    let output_path = dir.join(name);
    fs::write(&output_path, bytes)
        .with_context(|| format!("failed to write output: {}", output_path.display()))?;
    info!("wrote {} rows to {}", rows, output_path.display());

    Ok(BatchReport { output_path, rows })
}

pub async fn run_sample_with_provider<P>(
    provider: P,
    config: &Config,
    settings: &Settings,
    input: &str,
) -> Result<String>
where
    P: Provider + Clone,
{
    let row = GlRow::parse_composite(input)?;
    let pipeline = build_pipeline(provider, config, settings).await?;
    let outcome = pipeline.process_row(0, &row).await;
    Ok(format_outcome(&outcome))
}

/// Decodes and validates the input before any provider call is made.
pub fn load_batch_input(bytes: &[u8], max_rows: usize) -> Result<BatchInput> {
    let table = workbook::read_xlsx(bytes)?;
    let rows = rows::rows_from_table(&table)?;
    if rows.len() > max_rows {
        return Err(anyhow!(
            "input has {} rows; at most {} rows can be processed at once",
            rows.len(),
            max_rows
        ));
    }
    Ok(BatchInput { table, rows })
}

pub async fn translate_table<P, F>(
    pipeline: &Pipeline<P>,
    input: BatchInput,
    workers: usize,
    on_progress: F,
) -> Result<Table>
where
    P: Provider + Clone,
    F: FnMut(Progress),
{
    let results = batch::run_batch(pipeline, &input.rows, workers, on_progress).await?;
    materialize::materialize(input.table, results)
}

/// Resolves prompts, regions and the target-company profile into a pipeline.
pub async fn build_pipeline<P>(
    provider: P,
    config: &Config,
    settings: &Settings,
) -> Result<Pipeline<P>>
where
    P: Provider + Clone,
{
    let prompts = Prompts::new(&settings.prompts)?;
    let mut regions = RegionTable::from_settings(settings);
    if let Some(path) = config.country_codes.as_deref() {
        let added = regions.extend_from_workbook(path)?;
        info!("loaded {} country codes from {}", added, path.display());
    }
    if regions.is_empty() {
        warn!(
            "no country codes configured; every search uses region {}",
            regions.fallback()
        );
    }

    let target = TargetProfile {
        company: non_blank(config.target_company.as_deref())
            .unwrap_or_default()
            .to_string(),
        industry: non_blank(config.target_industry.as_deref()).map(str::to_string),
        info: String::new(),
    };
    let target = lookup_target(&provider, &prompts, target).await;

    let context = match non_blank(config.context.as_deref()) {
        Some(context) => context.to_string(),
        None => prompts.context(&target)?,
    };
    let instruction = match non_blank(config.instruction.as_deref()) {
        Some(instruction) => instruction.to_string(),
        None => prompts.instruction()?,
    };
    let supplier_hint = match non_blank(config.supplier_hint.as_deref()) {
        Some(hint) => hint.to_string(),
        None => prompts.supplier_hint(&target)?,
    };

    let mode = config.search_mode.unwrap_or(settings.search_mode);
    let policy = RetryPolicy::fixed(settings.search_retries, settings.search_retry_delay);
    info!(
        "search mode {}, {} retries, {} regions with fallback {}",
        mode.as_str(),
        settings.search_retries,
        regions.len(),
        regions.fallback()
    );

    let translator = Translator::new(provider.clone(), prompts.clone())?;
    let enricher = Enricher::new(
        provider,
        prompts,
        regions,
        mode,
        settings.miss_markers.clone(),
        supplier_hint,
        policy,
    );
    Ok(Pipeline::new(
        translator,
        enricher,
        TranslationBrief {
            context,
            instruction,
        },
    ))
}

async fn lookup_target<P: Provider + Clone>(
    provider: &P,
    prompts: &Prompts,
    mut target: TargetProfile,
) -> TargetProfile {
    if target.company.is_empty() {
        return target;
    }
    match enrichment::describe_company(provider, prompts, &target.company).await {
        Ok(info) => target.info = info,
        Err(err) => warn!(
            "company lookup for '{}' failed: {:#}",
            target.company, err
        ),
    }
    target
}

fn load_config_settings(config: &Config) -> Result<Settings> {
    let settings_path = config.settings_path.as_deref().map(Path::new);
    settings::load_settings(settings_path)
}

fn provider_from_config(config: &Config, settings: &Settings) -> Result<ProviderImpl> {
    let selection =
        providers::resolve_provider_selection(config.model.as_deref(), config.key.as_deref())?;
    let kind = selection.provider;
    let key = providers::resolve_key(kind, config.key.as_deref())
        .with_context(|| "no API key found for selected provider")?;
    let setup = providers::ProviderSetup {
        model: selection
            .requested_model
            .or_else(|| settings.model_for(kind.as_str()).map(str::to_string)),
        search_model: non_blank(config.search_model.as_deref())
            .or_else(|| settings.model_for(kind.search_key()))
            .map(str::to_string),
        base_url: settings.endpoint_for(kind.as_str()).map(str::to_string),
    };
    info!(
        "provider {} (model {}, search model {})",
        kind.as_str(),
        setup.model.as_deref().unwrap_or("default"),
        setup.search_model.as_deref().unwrap_or("default")
    );
    Ok(providers::build_provider(kind, key, setup))
}

fn format_outcome(outcome: &RowOutcome) -> String {
    [
        format!("{}: {}", materialize::COLUMN_TRANSLATION, outcome.translation),
        format!("{}: {}", materialize::COLUMN_NOTE, outcome.note),
        format!(
            "{}: {}",
            materialize::COLUMN_SUPPLIER_INFO,
            outcome.supplier_info.as_deref().unwrap_or("-")
        ),
    ]
    .join("\n")
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
