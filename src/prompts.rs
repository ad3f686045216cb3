use anyhow::{Context, Result};
use tera::{Context as TeraContext, Tera};

use crate::settings::PromptOverrides;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.tera");
const TRANSLATION_TEMPLATE: &str = include_str!("prompts/translation.tera");
const CONTEXT_TEMPLATE: &str = include_str!("prompts/context.tera");
const INSTRUCTION_TEMPLATE: &str = include_str!("prompts/instruction.tera");
const SUPPLIER_HINT_TEMPLATE: &str = include_str!("prompts/supplier_hint.tera");
const SUPPLIER_QUERY_TEMPLATE: &str = include_str!("prompts/supplier_query.tera");
const COMPANY_LOOKUP_TEMPLATE: &str = include_str!("prompts/company_lookup.tera");

const DEFAULT_INDUSTRY: &str = "各種業界";

/// The company whose ledger is being translated.
#[derive(Debug, Clone, Default)]
pub struct TargetProfile {
    pub company: String,
    pub industry: Option<String>,
    pub info: String,
}

impl TargetProfile {
    pub fn industry(&self) -> &str {
        self.industry
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_INDUSTRY)
    }
}

/// Compiled prompt templates. Overrides from settings replace the embedded
/// defaults; every template is compiled up front so syntax errors surface
/// before the batch starts.
#[derive(Debug, Clone)]
pub struct Prompts {
    tera: Tera,
}

impl Prompts {
    pub fn new(overrides: &PromptOverrides) -> Result<Self> {
        let mut tera = Tera::default();
        let templates = [
            ("system", overrides.system.as_deref().unwrap_or(SYSTEM_TEMPLATE)),
            (
                "translation",
                overrides
                    .translation
                    .as_deref()
                    .unwrap_or(TRANSLATION_TEMPLATE),
            ),
            (
                "context",
                overrides.context.as_deref().unwrap_or(CONTEXT_TEMPLATE),
            ),
            (
                "instruction",
                overrides
                    .instruction
                    .as_deref()
                    .unwrap_or(INSTRUCTION_TEMPLATE),
            ),
            (
                "supplier_hint",
                overrides
                    .supplier_hint
                    .as_deref()
                    .unwrap_or(SUPPLIER_HINT_TEMPLATE),
            ),
            ("supplier_query", SUPPLIER_QUERY_TEMPLATE),
            ("company_lookup", COMPANY_LOOKUP_TEMPLATE),
        ];
        for (name, body) in templates {
            tera.add_raw_template(name, body)
                .with_context(|| format!("failed to compile prompt template '{}'", name))?;
        }
        tera.autoescape_on(Vec::new());
        Ok(Self { tera })
    }

    pub fn system(&self) -> Result<String> {
        self.render("system", &TeraContext::new())
    }

    pub fn context(&self, target: &TargetProfile) -> Result<String> {
        let mut context = TeraContext::new();
        context.insert("industry", target.industry());
        context.insert("company", target.company.trim());
        context.insert("company_info", target.info.trim());
        self.render("context", &context)
    }

    pub fn instruction(&self) -> Result<String> {
        self.render("instruction", &TeraContext::new())
    }

    pub fn supplier_hint(&self, target: &TargetProfile) -> Result<String> {
        let mut context = TeraContext::new();
        context.insert("company", target.company.trim());
        self.render("supplier_hint", &context)
    }

    pub fn translation(&self, source: &str, context: &str, instruction: &str) -> Result<String> {
        let mut values = TeraContext::new();
        values.insert("source", source);
        values.insert("context", context.trim());
        values.insert("instruction", instruction.trim());
        self.render("translation", &values)
    }

    pub fn supplier_query(&self, supplier: &str, hint: &str) -> Result<String> {
        let mut context = TeraContext::new();
        context.insert("supplier", supplier.trim());
        context.insert("hint", hint.trim());
        self.render("supplier_query", &context)
    }

    pub fn company_lookup(&self, company: &str) -> Result<String> {
        let mut context = TeraContext::new();
        context.insert("company", company.trim());
        self.render("company_lookup", &context)
    }

    fn render(&self, name: &str, context: &TeraContext) -> Result<String> {
        let rendered = self
            .tera
            .render(name, context)
            .with_context(|| format!("failed to render prompt '{}'", name))?;
        Ok(rendered.trim_end().to_string())
    }
}
