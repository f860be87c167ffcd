use anyhow::{anyhow, Result};
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};

use crate::cli::config::ExtractionSettings;

/// Turns rendered markup into records. Implementations are pure.
pub trait Extractor: Send + Sync {
    fn extract(&self, html: &str) -> Result<Vec<Value>>;
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow!("Invalid CSS selector {:?}: {:?}", selector, e))
}

struct CompiledField {
    name: String,
    /// None selects the item element itself
    selector: Option<Selector>,
    attribute: Option<String>,
}

/// Extracts one JSON object per item element using configured CSS selectors
pub struct SelectorExtractor {
    item: Selector,
    fields: Vec<CompiledField>,
}

impl SelectorExtractor {
    pub fn new(settings: &ExtractionSettings) -> Result<Self> {
        let item = parse_selector(&settings.item_selector)?;
        let fields = settings
            .fields
            .iter()
            .map(|field| {
                let selector = match field.selector.trim() {
                    "" => None,
                    css => Some(parse_selector(css)?),
                };
                Ok(CompiledField {
                    name: field.name.clone(),
                    selector,
                    attribute: field.attribute.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { item, fields })
    }

    fn field_value(element: ElementRef<'_>, field: &CompiledField) -> Value {
        let target = match &field.selector {
            Some(selector) => element.select(selector).next(),
            None => Some(element),
        };
        let Some(target) = target else {
            return Value::Null;
        };

        let raw = match &field.attribute {
            Some(attribute) => target.value().attr(attribute).map(str::to_string),
            None => Some(target.text().collect::<Vec<_>>().join(" ")),
        };

        match raw.map(|text| text.split_whitespace().collect::<Vec<_>>().join(" ")) {
            Some(text) if !text.is_empty() => Value::String(text),
            _ => Value::Null,
        }
    }
}

impl Extractor for SelectorExtractor {
    fn extract(&self, html: &str) -> Result<Vec<Value>> {
        let document = Html::parse_document(html);

        let records = document
            .select(&self.item)
            .map(|element| {
                let record: Map<String, Value> = self
                    .fields
                    .iter()
                    .map(|field| (field.name.clone(), Self::field_value(element, field)))
                    .collect();
                Value::Object(record)
            })
            .collect();

        Ok(records)
    }
}
