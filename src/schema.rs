use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::template::ExtractionTemplate;

/// Normalized extraction for one record: every template field is present,
/// with the empty string standing in for anything the model left out.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub id: String,
    values: BTreeMap<String, Value>,
}

impl Extraction {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// The extraction object written to the JSONL artifact: record id plus
    /// every template field.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.clone()));
        for (name, value) in &self.values {
            map.insert(name.clone(), value.clone());
        }
        Value::Object(map)
    }

    /// Field values as display strings, in template field order.
    pub fn flatten_for_csv(&self, template: &ExtractionTemplate) -> Vec<String> {
        template
            .fields
            .iter()
            .map(|field| match self.values.get(field.name) {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            })
            .collect()
    }
}

/// Normalizes raw model JSON against the template's field list. Pure: never
/// fails, never special-cases a template, and never leaves a declared field
/// absent.
pub fn normalise_extraction(raw: &Value, template: &ExtractionTemplate) -> Extraction {
    let mut id = String::new();
    for key in ["id_value", "id"] {
        if let Some(value) = raw.get(key).and_then(Value::as_str) {
            id = value.trim().to_string();
            break;
        }
    }

    let mut values = BTreeMap::new();
    for field in &template.fields {
        let value = match raw.get(field.name) {
            Some(Value::String(text)) => Value::String(text.trim().to_string()),
            Some(Value::Null) | None => Value::String(String::new()),
            Some(other) => other.clone(),
        };
        values.insert(field.name.to_string(), value);
    }

    Extraction { id, values }
}

/// Shared success path for both run modes: pulls the message content out of
/// a chat-completion payload, parses it as JSON, injects the record id when
/// the model omitted it, and normalizes against the template.
pub fn extraction_from_chat_payload(
    payload: &Value,
    record_id: &str,
    template: &ExtractionTemplate,
) -> Result<Extraction> {
    let content = payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .context("Chat response is missing message content")?;

    let mut raw: Value =
        serde_json::from_str(content).context("Model output is not valid JSON")?;
    match raw.as_object_mut() {
        Some(map) => {
            if !map.contains_key("id_value") {
                map.insert(
                    "id_value".to_string(),
                    Value::String(record_id.to_string()),
                );
            }
        }
        None => bail!("Model output is not a JSON object"),
    }

    let mut extraction = normalise_extraction(&raw, template);
    extraction.id = record_id.to_string();
    Ok(extraction)
}
