use crate::types::{ContentArtifact, ContentSchema, FieldType, FieldValue};
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Where an accepted response came from, carried into the artifact.
#[derive(Debug, Clone)]
pub struct ArtifactContext {
    pub record_id: String,
    pub prompt_hash: String,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub reasons: Vec<String>,
}

impl ValidationFailure {
    pub fn summary(&self) -> String {
        self.reasons.join("; ")
    }
}

#[derive(Debug)]
pub enum ValidationOutcome {
    Valid(ContentArtifact),
    Invalid(ValidationFailure),
}

/// Parses raw provider output against a content schema. Tolerant of code
/// fences and stray whitespace, strict about field presence and types.
/// Returns a value either way; the orchestrator decides whether to
/// regenerate.
pub struct ResponseValidator;

impl ResponseValidator {
    pub fn validate(
        &self,
        raw_response: &str,
        schema: &ContentSchema,
        ctx: &ArtifactContext,
    ) -> ValidationOutcome {
        let cleaned = strip_code_fences(raw_response);

        let parsed: Value = match serde_json::from_str(cleaned) {
            Ok(value) => value,
            Err(e) => {
                return ValidationOutcome::Invalid(ValidationFailure {
                    reasons: vec![format!("response is not valid JSON: {e}")],
                })
            }
        };
        let obj = match parsed.as_object() {
            Some(obj) => obj,
            None => {
                return ValidationOutcome::Invalid(ValidationFailure {
                    reasons: vec!["response is not a JSON object".to_string()],
                })
            }
        };

        let mut fields = BTreeMap::new();
        let mut reasons = Vec::new();

        for spec in &schema.fields {
            let value = match obj.get(&spec.name) {
                Some(Value::Null) | None => {
                    if spec.required {
                        reasons.push(format!("missing required field '{}'", spec.name));
                    }
                    continue;
                }
                Some(value) => value,
            };

            match check_field(&spec.name, &spec.field_type, spec.required, value) {
                Ok(Some(field_value)) => {
                    fields.insert(spec.name.clone(), field_value);
                }
                Ok(None) => {}
                Err(reason) => reasons.push(reason),
            }
        }

        if !reasons.is_empty() {
            debug!(
                "Response for record {} rejected: {}",
                ctx.record_id,
                reasons.join("; ")
            );
            return ValidationOutcome::Invalid(ValidationFailure { reasons });
        }

        ValidationOutcome::Valid(ContentArtifact {
            record_id: ctx.record_id.clone(),
            schema_version: schema.version.clone(),
            fields,
            generated_at: Utc::now(),
            prompt_hash: ctx.prompt_hash.clone(),
            provider: ctx.provider.clone(),
            model: ctx.model.clone(),
        })
    }
}

fn check_field(
    name: &str,
    field_type: &FieldType,
    required: bool,
    value: &Value,
) -> Result<Option<FieldValue>, String> {
    match field_type {
        FieldType::ShortText | FieldType::LongText => {
            let text = value
                .as_str()
                .ok_or_else(|| format!("field '{name}' must be a string"))?
                .trim();
            if text.is_empty() {
                if required {
                    return Err(format!("required field '{name}' is empty"));
                }
                return Ok(None);
            }
            Ok(Some(FieldValue::Text(text.to_string())))
        }
        FieldType::TextList => {
            let items = value
                .as_array()
                .ok_or_else(|| format!("field '{name}' must be a list of strings"))?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let text = item
                    .as_str()
                    .ok_or_else(|| format!("field '{name}' contains a non-string entry"))?
                    .trim();
                if !text.is_empty() {
                    out.push(text.to_string());
                }
            }
            if out.is_empty() {
                if required {
                    return Err(format!("required list field '{name}' is empty"));
                }
                return Ok(None);
            }
            Ok(Some(FieldValue::List(out)))
        }
        FieldType::Enumerated(options) => {
            let text = value
                .as_str()
                .ok_or_else(|| format!("field '{name}' must be a string"))?
                .trim();
            // Case-insensitive match, but the declared casing is stored.
            match options.iter().find(|o| o.eq_ignore_ascii_case(text)) {
                Some(option) => Ok(Some(FieldValue::Text(option.clone()))),
                None => Err(format!(
                    "field '{name}' value '{text}' is not one of [{}]",
                    options.join(", ")
                )),
            }
        }
    }
}

/// Strips a surrounding markdown code fence (``` or ```json) if present.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
