use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::prompts::Prompts;
use crate::providers::{retry_with_policy, Provider, RetryPolicy};
use crate::region::RegionTable;
use crate::rows::GlRow;

/// Supplier-info value when no search was run for the row.
pub const NOT_SEARCHED: &str = "注釈に記載の通り";

/// Region used for the target-company lookup.
const COMPANY_LOOKUP_REGION: &str = "JP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SearchMode {
    /// Search only when the note says the supplier could not be identified.
    #[default]
    OnMiss,
    /// Search for every row.
    Always,
    /// Never search.
    Never,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::OnMiss => "on-miss",
            SearchMode::Always => "always",
            SearchMode::Never => "never",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Enrichment {
    pub supplier_info: String,
    pub searched: bool,
}

/// Decides per row whether to run a web-search lookup for the supplier and
/// performs it with a bounded retry.
#[derive(Debug, Clone)]
pub struct Enricher<P: Provider + Clone> {
    provider: P,
    prompts: Prompts,
    regions: RegionTable,
    mode: SearchMode,
    miss_markers: Vec<String>,
    supplier_hint: String,
    policy: RetryPolicy,
}

impl<P: Provider + Clone> Enricher<P> {
    pub fn new(
        provider: P,
        prompts: Prompts,
        regions: RegionTable,
        mode: SearchMode,
        miss_markers: Vec<String>,
        supplier_hint: String,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            prompts,
            regions,
            mode,
            miss_markers,
            supplier_hint,
            policy,
        }
    }

    pub fn should_search(&self, note: &str) -> bool {
        match self.mode {
            SearchMode::Never => false,
            SearchMode::Always => true,
            SearchMode::OnMiss => self
                .miss_markers
                .iter()
                .any(|marker| note.contains(marker.as_str())),
        }
    }

    pub async fn enrich(&self, row: &GlRow, note: &str) -> Enrichment {
        if !self.should_search(note) {
            return Enrichment {
                supplier_info: NOT_SEARCHED.to_string(),
                searched: false,
            };
        }
        Enrichment {
            supplier_info: self.lookup_supplier(row).await,
            searched: true,
        }
    }

    /// Runs the supplier search. Once the retry budget is spent the failure
    /// is returned as text so it lands in the output column.
    pub async fn lookup_supplier(&self, row: &GlRow) -> String {
        let region = self.regions.resolve(&row.country).to_string();
        let query = match self.prompts.supplier_query(&row.supplier, &self.supplier_hint) {
            Ok(query) => query,
            Err(err) => return search_failure(1, &err),
        };
        debug!("searching supplier '{}' in region {}", row.supplier, region);

        let result = retry_with_policy("supplier search", self.policy, || {
            self.provider
                .clone()
                .append_user_input(query.clone())
                .search(&region)
        })
        .await;

        match result {
            Ok(response) => response.text.trim().to_string(),
            Err(err) => {
                warn!(
                    "supplier search for '{}' gave up after {} attempts: {:#}",
                    row.supplier,
                    self.policy.attempts(),
                    err
                );
                search_failure(self.policy.attempts(), &err)
            }
        }
    }
}

fn search_failure(attempts: usize, err: &anyhow::Error) -> String {
    format!("Web検索失敗（{}回試行後）: {:#}", attempts, err)
}

/// Looks up the target company once before the batch so its profile can be
/// embedded in the translation context.
pub async fn describe_company<P: Provider + Clone>(
    provider: &P,
    prompts: &Prompts,
    company: &str,
) -> Result<String> {
    let query = prompts.company_lookup(company)?;
    let response = provider
        .clone()
        .append_user_input(query)
        .search(COMPANY_LOOKUP_REGION)
        .await?;
    Ok(response.text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::PromptOverrides;
    use crate::test_util::ScriptedProvider;
    use anyhow::anyhow;
    use std::collections::HashMap;
    use std::time::Duration;

    fn markers() -> Vec<String> {
        ["不明", "情報が見つかりません", "補足情報なし"]
            .iter()
            .map(|marker| marker.to_string())
            .collect()
    }

    fn enricher(provider: ScriptedProvider, mode: SearchMode) -> Enricher<ScriptedProvider> {
        let mut codes = HashMap::new();
        codes.insert("アメリカ".to_string(), "US".to_string());
        Enricher::new(
            provider,
            Prompts::new(&PromptOverrides::default()).unwrap(),
            RegionTable::new(codes, "JP"),
            mode,
            markers(),
            "事業概要".to_string(),
            RetryPolicy::fixed(2, Duration::ZERO),
        )
    }

    fn row() -> GlRow {
        GlRow::new("アメリカ", "JWALK, LLC", "Consulting Fee", "Research", "NY")
    }

    #[tokio::test]
    async fn on_miss_searches_when_note_reports_unknown() {
        let provider = ScriptedProvider::default().with_search(|_, _| Ok("NYの調査会社".to_string()));
        let enricher = enricher(provider.clone(), SearchMode::OnMiss);

        let result = enricher.enrich(&row(), "JWALKは不明な企業です").await;
        assert!(result.searched);
        assert_eq!(result.supplier_info, "NYの調査会社");
        assert_eq!(provider.searches(), 1);

        let request = provider.last_request().unwrap();
        assert_eq!(request.region.as_deref(), Some("US"));
        assert_eq!(request.user, "JWALK, LLC の 事業概要 を調査してください。");
    }

    #[tokio::test]
    async fn on_miss_skips_known_suppliers() {
        let provider = ScriptedProvider::default();
        let enricher = enricher(provider.clone(), SearchMode::OnMiss);

        let result = enricher.enrich(&row(), "米国のコンサルティング会社").await;
        assert!(!result.searched);
        assert_eq!(result.supplier_info, NOT_SEARCHED);
        assert_eq!(provider.searches(), 0);
    }

    #[test]
    fn modes_gate_the_search() {
        let provider = ScriptedProvider::default();
        let always = enricher(provider.clone(), SearchMode::Always);
        let never = enricher(provider.clone(), SearchMode::Never);
        let on_miss = enricher(provider, SearchMode::OnMiss);

        assert!(always.should_search("米国のコンサルティング会社"));
        assert!(!never.should_search("不明"));
        assert!(on_miss.should_search("補足情報なし"));
        assert!(on_miss.should_search("情報が見つかりませんでした"));
        assert!(!on_miss.should_search(""));
    }

    #[tokio::test]
    async fn failures_are_retried_then_reported() {
        let provider = ScriptedProvider::default().with_search(|_, _| Err(anyhow!("timeout")));
        let enricher = enricher(provider.clone(), SearchMode::Always);

        let result = enricher.enrich(&row(), "").await;
        assert!(result.searched);
        assert_eq!(result.supplier_info, "Web検索失敗（3回試行後）: timeout");
        assert_eq!(provider.searches(), 3);
    }

    #[tokio::test]
    async fn unknown_country_searches_in_fallback_region() {
        let provider = ScriptedProvider::default().with_search(|_, _| Ok("info".to_string()));
        let enricher = enricher(provider.clone(), SearchMode::Always);
        let mut row = row();
        row.country = "Atlantis".to_string();

        enricher.enrich(&row, "").await;
        assert_eq!(provider.last_request().unwrap().region.as_deref(), Some("JP"));
    }

    #[tokio::test]
    async fn company_lookup_uses_japan_region() {
        let provider = ScriptedProvider::default().with_search(|query, _| Ok(format!("回答: {}", query)));
        let prompts = Prompts::new(&PromptOverrides::default()).unwrap();
        let info = describe_company(&provider, &prompts, "武田薬品").await.unwrap();
        assert_eq!(
            info,
            "回答: 武田薬品 の事業概要、主力製品、代表ブランド、業界分類を教えてください"
        );
        assert_eq!(provider.last_request().unwrap().region.as_deref(), Some("JP"));
    }
}
