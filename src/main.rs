use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use gl_translator_rust::{Config, Progress, SearchMode};

#[derive(Parser, Debug)]
#[command(
    name = "gl-translator-rust",
    version,
    about = "Translate general-ledger rows into Japanese with LLM annotations"
)]
struct Cli {
    /// GL workbook (.xlsx) with 国名/サプライヤ名/費目/案件名/摘要 columns.
    /// Without it, one "国名 / サプライヤ名 / 費目 / 案件名 / 摘要" line is read from stdin.
    #[arg(short = 'd', long = "data")]
    data: Option<PathBuf>,

    /// Directory for the translated workbook (default: current directory)
    #[arg(short = 'o', long = "output-dir")]
    output_dir: Option<PathBuf>,

    /// Model name or provider:model (e.g. openai:gpt-4o)
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// Model used for web-search lookups
    #[arg(long = "search-model")]
    search_model: Option<String>,

    /// API key (overrides environment variables)
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    /// When to run the supplier web search
    #[arg(short = 's', long = "search-mode", value_enum)]
    search_mode: Option<SearchMode>,

    /// Company whose ledger is being translated
    #[arg(short = 't', long = "target-company")]
    target_company: Option<String>,

    /// Industry of the target company (default: 各種業界)
    #[arg(long = "target-industry")]
    target_industry: Option<String>,

    /// What to research about each supplier
    #[arg(long = "supplier-hint")]
    supplier_hint: Option<String>,

    /// Replace the rendered translation context
    #[arg(long = "context")]
    context: Option<String>,

    /// Replace the rendered translation rules
    #[arg(long = "instruction")]
    instruction: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// Workbook with 国名/ISOコード columns merged into the region table
    #[arg(long = "country-codes")]
    country_codes: Option<PathBuf>,

    /// Number of rows processed concurrently
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    gl_translator_rust::logging::init(cli.verbose)?;

    let config = Config {
        data: cli.data,
        output_dir: cli.output_dir,
        model: cli.model,
        search_model: cli.search_model,
        key: cli.key,
        search_mode: cli.search_mode,
        target_company: cli.target_company,
        target_industry: cli.target_industry,
        supplier_hint: cli.supplier_hint,
        context: cli.context,
        instruction: cli.instruction,
        settings_path: cli.read_settings,
        country_codes: cli.country_codes,
        workers: cli.workers,
    };

    if config.data.is_none() {
        let input = read_stdin_line()?;
        let output = gl_translator_rust::run_sample(config, &input).await?;
        println!("{}", output);
        return Ok(());
    }

    let report = gl_translator_rust::run(config, print_progress).await?;
    eprintln!();
    println!("{}", report.output_path.display());
    Ok(())
}

fn print_progress(progress: Progress) {
    let mut stderr = io::stderr();
    let _ = write!(
        stderr,
        "\r{}/{} 件処理中...",
        progress.completed, progress.total
    );
    let _ = stderr.flush();
}

fn read_stdin_line() -> Result<String> {
    if io::stdin().is_terminal() {
        eprint!("国名 / サプライヤ名 / 費目 / 案件名 / 摘要: ");
        let _ = io::stderr().flush();
        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        return non_empty(line);
    }
    let mut buffer = String::new();
    io::stdin().read_to_string(&mut buffer)?;
    non_empty(buffer)
}

fn non_empty(input: String) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("stdin is empty"));
    }
    Ok(trimmed.to_string())
}
