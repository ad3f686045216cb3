use anyhow::{anyhow, Result};
use futures_util::{stream, FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tracing::{debug, info, warn};

use crate::enrichment::Enricher;
use crate::providers::{Provider, ProviderUsage};
use crate::rows::GlRow;
use crate::translator::{
    error_note, TranslationBrief, TranslationStatus, Translator, ERROR_TRANSLATION,
};

/// Final result of one row. `supplier_info` is absent when the translation
/// call itself failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowOutcome {
    pub translation: String,
    pub note: String,
    pub supplier_info: Option<String>,
}

impl RowOutcome {
    pub fn failed(cause: impl std::fmt::Display) -> Self {
        Self {
            translation: ERROR_TRANSLATION.to_string(),
            note: error_note(cause),
            supplier_info: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStage {
    Pending,
    Translating,
    Enriching,
    SkipEnrichment,
    Done,
}

impl RowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStage::Pending => "pending",
            RowStage::Translating => "translating",
            RowStage::Enriching => "enriching",
            RowStage::SkipEnrichment => "skip-enrichment",
            RowStage::Done => "done",
        }
    }

    /// Stages only move forward; `Done` is terminal.
    pub fn can_advance_to(&self, next: RowStage) -> bool {
        matches!(
            (self, next),
            (RowStage::Pending, RowStage::Translating)
                | (RowStage::Translating, RowStage::Enriching)
                | (RowStage::Translating, RowStage::SkipEnrichment)
                | (RowStage::Enriching, RowStage::Done)
                | (RowStage::SkipEnrichment, RowStage::Done)
        )
    }
}

struct StageTracker {
    index: usize,
    stage: RowStage,
}

impl StageTracker {
    fn new(index: usize) -> Self {
        Self {
            index,
            stage: RowStage::Pending,
        }
    }

    fn advance(&mut self, next: RowStage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "row {} cannot move from {} to {}",
            self.index,
            self.stage.as_str(),
            next.as_str()
        );
        debug!(
            "row {}: {} -> {}",
            self.index,
            self.stage.as_str(),
            next.as_str()
        );
        self.stage = next;
    }
}

/// Token and search totals for a batch, logged when it finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BatchUsage {
    searches: usize,
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

impl BatchUsage {
    fn record(&mut self, row: &RowRun) {
        if row.searched {
            self.searches += 1;
        }
        if let Some(usage) = &row.usage {
            self.prompt_tokens += usage.prompt_tokens.unwrap_or_default();
            self.completion_tokens += usage.completion_tokens.unwrap_or_default();
            self.total_tokens += usage.total_tokens.unwrap_or_default();
        }
    }
}

struct RowRun {
    outcome: RowOutcome,
    usage: Option<ProviderUsage>,
    searched: bool,
}

impl RowRun {
    fn aborted(cause: String) -> Self {
        Self {
            outcome: RowOutcome::failed(cause),
            usage: None,
            searched: false,
        }
    }
}

/// Per-row work: translate, then optionally enrich.
#[derive(Debug, Clone)]
pub struct Pipeline<P: Provider + Clone> {
    translator: Translator<P>,
    enricher: Enricher<P>,
    brief: TranslationBrief,
}

impl<P: Provider + Clone> Pipeline<P> {
    pub fn new(translator: Translator<P>, enricher: Enricher<P>, brief: TranslationBrief) -> Self {
        Self {
            translator,
            enricher,
            brief,
        }
    }

    pub fn brief(&self) -> &TranslationBrief {
        &self.brief
    }

    pub async fn process_row(&self, index: usize, row: &GlRow) -> RowOutcome {
        self.run_row(index, row).await.outcome
    }

    async fn run_row(&self, index: usize, row: &GlRow) -> RowRun {
        let mut stage = StageTracker::new(index);
        stage.advance(RowStage::Translating);
        let translation = self.translator.translate(row, &self.brief).await;
        let annotation = translation.annotation;
        let usage = translation.usage;

        if translation.status == TranslationStatus::Failed {
            stage.advance(RowStage::SkipEnrichment);
            stage.advance(RowStage::Done);
            return RowRun {
                outcome: RowOutcome {
                    translation: annotation.translation,
                    note: annotation.note,
                    supplier_info: None,
                },
                usage,
                searched: false,
            };
        }

        if self.enricher.should_search(&annotation.note) {
            stage.advance(RowStage::Enriching);
        } else {
            stage.advance(RowStage::SkipEnrichment);
        }
        let enrichment = self.enricher.enrich(row, &annotation.note).await;
        stage.advance(RowStage::Done);
        debug!(
            "row {}: model {}, searched {}",
            index,
            translation.model.as_deref().unwrap_or("unknown"),
            enrichment.searched
        );

        RowRun {
            outcome: RowOutcome {
                translation: annotation.translation,
                note: annotation.note,
                supplier_info: Some(enrichment.supplier_info),
            },
            usage,
            searched: enrichment.searched,
        }
    }
}

/// Fixed-size, write-once container of row outcomes indexed by input position.
#[derive(Debug, Clone, Default)]
pub struct ResultTable {
    slots: Vec<Option<RowOutcome>>,
}

impl ResultTable {
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![None; len],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn insert(&mut self, index: usize, outcome: RowOutcome) -> Result<()> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| anyhow!("row index {} is out of range for {} rows", index, len))?;
        if slot.is_some() {
            return Err(anyhow!("row {} already has a result", index));
        }
        *slot = Some(outcome);
        Ok(())
    }

    /// Outcomes in row order. Fails if any row never received a result.
    pub fn into_dense(self) -> Result<Vec<RowOutcome>> {
        let missing = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(anyhow!(
                "result table is incomplete; missing rows: {}",
                missing.join(", ")
            ));
        }
        Ok(self.slots.into_iter().flatten().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f32 / self.total as f32
        }
    }
}

/// Runs every row through the pipeline with at most `workers` rows in
/// flight. Results are collected as they finish and keyed by input index;
/// `on_progress` is called once per finished row.
pub async fn run_batch<P, F>(
    pipeline: &Pipeline<P>,
    rows: &[GlRow],
    workers: usize,
    mut on_progress: F,
) -> Result<ResultTable>
where
    P: Provider + Clone,
    F: FnMut(Progress),
{
    let total = rows.len();
    let mut table = ResultTable::new(total);
    if total == 0 {
        return Ok(table);
    }
    let workers = workers.max(1);
    info!("processing {} rows with {} workers", total, workers);

    let tasks = stream::iter(rows.iter().enumerate().map(|(index, row)| async move {
        let run = match AssertUnwindSafe(pipeline.run_row(index, row))
            .catch_unwind()
            .await
        {
            Ok(run) => run,
            Err(panic) => {
                let cause = panic_message(panic.as_ref());
                warn!("row {} aborted: {}", index, cause);
                RowRun::aborted(cause)
            }
        };
        (index, run)
    }))
    .buffer_unordered(workers);
    let mut tasks = std::pin::pin!(tasks);

    let mut usage = BatchUsage::default();
    while let Some((index, run)) = tasks.next().await {
        usage.record(&run);
        table.insert(index, run.outcome)?;
        on_progress(Progress {
            completed: table.filled(),
            total,
        });
    }

    info!(
        "finished {} rows: {} searches, {} tokens ({} prompt, {} completion)",
        table.filled(),
        usage.searches,
        usage.total_tokens,
        usage.prompt_tokens,
        usage.completion_tokens
    );
    Ok(table)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {}", message)
    } else {
        "panic".to_string()
    }
}
