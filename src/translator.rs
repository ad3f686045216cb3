use anyhow::Result;
use tracing::debug;

use crate::annotation::{self, Annotation, NOTE_MISSING, TRANSLATION_MISSING};
use crate::prompts::Prompts;
use crate::providers::{retry_with_policy, Provider, ProviderUsage, RetryPolicy};
use crate::rows::GlRow;

/// Translation placeholder for a row whose model call failed.
pub const ERROR_TRANSLATION: &str = "エラー";
const ERROR_NOTE_PREFIX: &str = "APIエラー";

const TRANSLATION_TEMPERATURE: f32 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationStatus {
    /// Both labelled sections were found.
    Complete,
    /// The call succeeded but at least one section fell back to a placeholder.
    Partial,
    /// The call itself failed; the note carries the cause.
    Failed,
}

#[derive(Debug, Clone)]
pub struct Translation {
    pub annotation: Annotation,
    pub status: TranslationStatus,
    pub model: Option<String>,
    pub usage: Option<ProviderUsage>,
}

impl Translation {
    pub fn failed(cause: impl std::fmt::Display) -> Self {
        Self {
            annotation: Annotation {
                translation: ERROR_TRANSLATION.to_string(),
                note: error_note(cause),
            },
            status: TranslationStatus::Failed,
            model: None,
            usage: None,
        }
    }
}

pub fn error_note(cause: impl std::fmt::Display) -> String {
    format!("{}: {}", ERROR_NOTE_PREFIX, cause)
}

/// Shared prompt text for every row of a batch.
#[derive(Debug, Clone)]
pub struct TranslationBrief {
    pub context: String,
    pub instruction: String,
}

#[derive(Debug, Clone)]
pub struct Translator<P: Provider + Clone> {
    provider: P,
    prompts: Prompts,
    system_prompt: String,
}

impl<P: Provider + Clone> Translator<P> {
    pub fn new(provider: P, prompts: Prompts) -> Result<Self> {
        let system_prompt = prompts.system()?;
        Ok(Self {
            provider,
            prompts,
            system_prompt,
        })
    }

    /// Translates one row. Never fails: call errors come back as a
    /// `Failed` translation whose note embeds the cause.
    pub async fn translate(&self, row: &GlRow, brief: &TranslationBrief) -> Translation {
        match self.request(row, brief).await {
            Ok(translation) => translation,
            Err(err) => Translation::failed(format!("{:#}", err)),
        }
    }

    async fn request(&self, row: &GlRow, brief: &TranslationBrief) -> Result<Translation> {
        let source = row.composite_text();
        let prompt = self
            .prompts
            .translation(&source, &brief.context, &brief.instruction)?;

        let response = retry_with_policy("translation", RetryPolicy::none(), || {
            self.provider
                .clone()
                .append_system_input(self.system_prompt.clone())
                .append_user_input(prompt.clone())
                .with_temperature(TRANSLATION_TEMPERATURE)
                .complete()
        })
        .await?;

        let annotation = annotation::parse_annotation(&response.text);
        let status = classify(&annotation);
        debug!(
            "translated '{}' ({:?}, model {})",
            source,
            status,
            response.model.as_deref().unwrap_or("unknown")
        );
        Ok(Translation {
            annotation,
            status,
            model: response.model,
            usage: response.usage,
        })
    }
}

fn classify(annotation: &Annotation) -> TranslationStatus {
    if annotation.translation == TRANSLATION_MISSING || annotation.note == NOTE_MISSING {
        TranslationStatus::Partial
    } else {
        TranslationStatus::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::PromptOverrides;
    use crate::test_util::ScriptedProvider;
    use anyhow::anyhow;

    fn brief() -> TranslationBrief {
        TranslationBrief {
            context: "本データは製薬業界のGLデータです。".to_string(),
            instruction: "- 逐語訳すること".to_string(),
        }
    }

    fn translator(provider: ScriptedProvider) -> Translator<ScriptedProvider> {
        Translator::new(provider, Prompts::new(&PromptOverrides::default()).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn parses_labelled_response() {
        let provider = ScriptedProvider::new(|_| Ok("翻訳結果: 米国 / GSK\n注釈: 製薬会社".to_string()));
        let translator = translator(provider.clone());
        let row = GlRow::new("US", "GSK", "Fee", "Study", "Invoice");
        let result = translator.translate(&row, &brief()).await;

        assert_eq!(result.status, TranslationStatus::Complete);
        assert_eq!(result.annotation.translation, "米国 / GSK");
        assert_eq!(result.annotation.note, "製薬会社");
        assert_eq!(provider.completions(), 1);

        let request = provider.last_request().unwrap();
        assert_eq!(request.temperature, Some(0.0));
        assert!(request.system.contains("日本語専門のプロ翻訳者"));
        assert!(request.user.contains("【原文】\nUS / GSK / Fee / Study / Invoice"));
        assert!(request.user.contains("本データは製薬業界のGLデータです。"));
    }

    #[tokio::test]
    async fn call_failure_becomes_error_placeholder_without_retry() {
        let provider = ScriptedProvider::new(|_| Err(anyhow!("OpenAI API error (401): bad key")));
        let translator = translator(provider.clone());
        let result = translator.translate(&GlRow::default(), &brief()).await;

        assert_eq!(result.status, TranslationStatus::Failed);
        assert_eq!(result.annotation.translation, ERROR_TRANSLATION);
        assert_eq!(result.annotation.note, "APIエラー: OpenAI API error (401): bad key");
        assert_eq!(provider.completions(), 1);
    }

    #[tokio::test]
    async fn unlabelled_response_is_partial() {
        let provider = ScriptedProvider::new(|_| Ok("翻訳結果: 会議費".to_string()));
        let result = translator(provider).translate(&GlRow::default(), &brief()).await;
        assert_eq!(result.status, TranslationStatus::Partial);
        assert_eq!(result.annotation.note, NOTE_MISSING);
    }
}
