use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::enrichment::SearchMode;

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone)]
pub struct Settings {
    pub workers: usize,
    pub max_rows: usize,
    pub search_mode: SearchMode,
    pub search_retries: usize,
    pub search_retry_delay: Duration,
    pub miss_markers: Vec<String>,
    pub models: HashMap<String, String>,
    pub endpoints: HashMap<String, String>,
    pub prompts: PromptOverrides,
    pub default_region: String,
    pub countries: HashMap<String, String>,
    pub output_prefix: String,
}

/// Template overrides for the embedded prompts. Each value is a tera template.
#[derive(Debug, Clone, Default)]
pub struct PromptOverrides {
    pub system: Option<String>,
    pub translation: Option<String>,
    pub context: Option<String>,
    pub instruction: Option<String>,
    pub supplier_hint: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 10,
            max_rows: 100,
            search_mode: SearchMode::OnMiss,
            search_retries: 2,
            search_retry_delay: Duration::from_secs(2),
            miss_markers: Vec::new(),
            models: HashMap::new(),
            endpoints: HashMap::new(),
            prompts: PromptOverrides::default(),
            default_region: "JP".to_string(),
            countries: HashMap::new(),
            output_prefix: "翻訳結果".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    batch: Option<BatchSettings>,
    search: Option<SearchSettings>,
    models: Option<HashMap<String, String>>,
    endpoints: Option<HashMap<String, String>>,
    prompts: Option<PromptSettings>,
    region: Option<RegionSettings>,
    countries: Option<HashMap<String, String>>,
    output: Option<OutputSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct BatchSettings {
    workers: Option<usize>,
    max_rows: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchSettings {
    mode: Option<SearchMode>,
    retries: Option<usize>,
    retry_delay_secs: Option<u64>,
    miss_markers: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct PromptSettings {
    system: Option<String>,
    translation: Option<String>,
    context: Option<String>,
    instruction: Option<String>,
    supplier_hint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RegionSettings {
    default: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OutputSettings {
    file_prefix: Option<String>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    load_settings_with_home(home_dir().as_deref(), extra_path)
}

pub(crate) fn load_settings_with_home(
    home: Option<&Path>,
    extra_path: Option<&Path>,
) -> Result<Settings> {
    let mut settings = Settings::default();
    let defaults: SettingsFile =
        toml::from_str(DEFAULT_SETTINGS_TOML).with_context(|| "failed to parse default settings")?;
    settings.merge(defaults);

    if let Some(home) = home {
        ensure_home_settings_file(home)?;
    }

    let mut ordered_paths = Vec::new();
    ordered_paths.push(PathBuf::from("settings.toml"));
    ordered_paths.push(PathBuf::from("settings.local.toml"));

    if let Some(home) = home {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            let parsed: SettingsFile = toml::from_str(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
            settings.merge(parsed);
        }
    }

    Ok(settings)
}

impl Settings {
    fn merge(&mut self, incoming: SettingsFile) {
        if let Some(batch) = incoming.batch {
            if let Some(workers) = batch.workers
                && workers > 0
            {
                self.workers = workers;
            }
            if let Some(max_rows) = batch.max_rows
                && max_rows > 0
            {
                self.max_rows = max_rows;
            }
        }
        if let Some(search) = incoming.search {
            if let Some(mode) = search.mode {
                self.search_mode = mode;
            }
            if let Some(retries) = search.retries {
                self.search_retries = retries;
            }
            if let Some(secs) = search.retry_delay_secs {
                self.search_retry_delay = Duration::from_secs(secs);
            }
            if let Some(markers) = search.miss_markers {
                self.miss_markers = markers
                    .into_iter()
                    .filter(|marker| !marker.trim().is_empty())
                    .collect();
            }
        }
        if let Some(models) = incoming.models {
            for (key, value) in models {
                if !value.trim().is_empty() {
                    self.models.insert(key, value);
                }
            }
        }
        if let Some(endpoints) = incoming.endpoints {
            for (key, value) in endpoints {
                if !value.trim().is_empty() {
                    self.endpoints.insert(key, value);
                }
            }
        }
        if let Some(prompts) = incoming.prompts {
            merge_template(&mut self.prompts.system, prompts.system);
            merge_template(&mut self.prompts.translation, prompts.translation);
            merge_template(&mut self.prompts.context, prompts.context);
            merge_template(&mut self.prompts.instruction, prompts.instruction);
            merge_template(&mut self.prompts.supplier_hint, prompts.supplier_hint);
        }
        if let Some(region) = incoming.region
            && let Some(code) = region.default
            && !code.trim().is_empty()
        {
            self.default_region = code.trim().to_uppercase();
        }
        if let Some(countries) = incoming.countries {
            for (name, code) in countries {
                self.countries
                    .insert(name.trim().to_string(), code.trim().to_uppercase());
            }
        }
        if let Some(output) = incoming.output
            && let Some(prefix) = output.file_prefix
            && !prefix.trim().is_empty()
        {
            self.output_prefix = prefix;
        }
    }

    pub fn model_for(&self, key: &str) -> Option<&str> {
        self.models.get(key).map(String::as_str)
    }

    pub fn endpoint_for(&self, key: &str) -> Option<&str> {
        self.endpoints.get(key).map(String::as_str)
    }
}

fn merge_template(slot: &mut Option<String>, incoming: Option<String>) {
    if let Some(value) = incoming
        && !value.trim().is_empty()
    {
        *slot = Some(value);
    }
}

fn ensure_home_settings_file(home: &Path) -> Result<()> {
    fs::create_dir_all(home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".gl-translator-rust"))
        }
    })
}
