use crate::types::{AgencyRecord, ContentSchema, EnrichedRecord, FieldType, PromptSpec};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

pub const TEMPLATE_VERSION_V1: &str = "v1";

/// Editorial rules carried over from the hand-tuned page generator: plain
/// confident register, no guarantees, no testimonials, JSON-only output.
const SYSTEM_PROMPT: &str = "You are writing a marketing service page for a digital agency. \
The content must be high quality, professional, and vanilla (no risky or exaggerated claims). \
Do not make guarantees or risky promises. Maintain a confident, modern, and clear tone. \
Do not generate testimonials.";

/// Renders prompts deterministically from enriched records. Identical inputs
/// produce byte-identical prompt text and therefore the same hash, which is
/// what the cache freshness check keys on.
pub struct PromptBuilder {
    template_version: String,
    schema: ContentSchema,
}

impl PromptBuilder {
    pub fn new(schema: ContentSchema) -> Self {
        Self {
            template_version: TEMPLATE_VERSION_V1.to_string(),
            schema,
        }
    }

    pub fn with_template_version(mut self, version: &str) -> Self {
        self.template_version = version.to_string();
        self
    }

    pub fn template_version(&self) -> &str {
        &self.template_version
    }

    pub fn build(&self, enriched: &EnrichedRecord) -> PromptSpec {
        self.build_with_background(enriched, None)
    }

    /// Like `build`, folding optional background text (a knowledge-backbone
    /// answer) into the prompt.
    pub fn build_with_background(
        &self,
        enriched: &EnrichedRecord,
        background: Option<&str>,
    ) -> PromptSpec {
        let record = &enriched.record;
        let mut text = String::new();

        let _ = writeln!(text, "Agency: {}", record.name);
        if let Some(category) = &record.category {
            let _ = writeln!(text, "Category: {category}");
        }
        if let Some(locale) = &record.locale {
            let _ = writeln!(text, "Locale: {locale}");
        }

        if !record.facts.is_empty() {
            let _ = writeln!(text, "\nKnown facts:");
            for (key, value) in &record.facts {
                let _ = writeln!(text, "- {key}: {value}");
            }
        }

        if !enriched.snippets.is_empty() {
            let _ = writeln!(text, "\nSource material:");
            for snippet in &enriched.snippets {
                let _ = writeln!(text, "[{}]\n{}", snippet.source_url, snippet.text);
            }
        }

        if let Some(background) = background {
            let _ = writeln!(text, "\nBackground on the topic:\n{background}");
        }

        let _ = writeln!(
            text,
            "\nGenerate a complete service page for {}, following the field contract below.",
            record.name
        );
        let _ = writeln!(
            text,
            "Return a single JSON object with exactly these fields:\n\n{}",
            render_schema_skeleton(&self.schema)
        );
        text.push_str(
            "\nUse simple, clear language, but do not skip marketing terms where appropriate. \
             Avoid AI cliches such as 'in today's world' or 'in today's digital landscape'. \
             Do NOT wrap the JSON in a string or markdown code block. \
             The output must be a valid JSON object only.\n",
        );

        let prompt_hash = hash_prompt(&self.template_version, &text);
        PromptSpec {
            text,
            system_prompt: SYSTEM_PROMPT.to_string(),
            prompt_hash,
            template_version: self.template_version.clone(),
            schema: self.schema.clone(),
        }
    }

    /// Freshness key for the content cache: the hash of the prompt rendered
    /// without snippets or background. Scraped text and backbone answers
    /// vary run to run, so keying freshness on them would make a cached
    /// record depend on live fetches; the record's own facts, the template
    /// version, and the schema contract are what must invalidate it.
    pub fn cache_hash(&self, record: &AgencyRecord) -> String {
        let bare = EnrichedRecord {
            record: record.clone(),
            snippets: Vec::new(),
        };
        self.build(&bare).prompt_hash
    }

    /// Short query used for the optional knowledge-backbone pass against a
    /// search-capable provider.
    pub fn backbone_prompt(&self, record: &AgencyRecord) -> String {
        let topic = record
            .category
            .as_deref()
            .unwrap_or("digital marketing agency");
        format!(
            "Give concise, factual background about the \"{topic}\" space that would help \
             write a service page for an agency named {}. A few short paragraphs, no lists.",
            record.name
        )
    }
}

fn render_schema_skeleton(schema: &ContentSchema) -> String {
    let mut out = String::from("{\n");
    for (i, field) in schema.fields.iter().enumerate() {
        let value = match &field.field_type {
            FieldType::ShortText => "\"<short text, one sentence>\"".to_string(),
            FieldType::LongText => "\"<long text, one or more paragraphs>\"".to_string(),
            FieldType::TextList => "[\"<entry>\", \"<entry>\"]".to_string(),
            FieldType::Enumerated(options) => {
                format!("\"<one of: {}>\"", options.join(" | "))
            }
        };
        let trailing = if i + 1 < schema.fields.len() { "," } else { "" };
        let note = if field.required { "" } else { "  // optional" };
        let _ = writeln!(out, "  \"{}\": {value}{trailing}{note}", field.name);
    }
    out.push('}');
    out
}

fn hash_prompt(template_version: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template_version.as_bytes());
    hasher.update(b"\n");
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
