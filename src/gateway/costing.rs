use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

const TOKENS_PER_PRICE_UNIT: u128 = 1000;

/// Model prices, keyed by model identifier.
///
/// Prices are USD micros per 1000 tokens so that the sub-cent list prices of
/// the upstream provider stay exact.
#[derive(Clone, Debug)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_usd_micros_per_1k_tokens: u64,
    pub output_usd_micros_per_1k_tokens: u64,
}

impl ModelPricing {
    pub const FREE: ModelPricing = ModelPricing {
        input_usd_micros_per_1k_tokens: 0,
        output_usd_micros_per_1k_tokens: 0,
    };

    pub fn from_usd_per_1k(input: f64, output: f64) -> Result<Self, PricingTableError> {
        Ok(Self {
            input_usd_micros_per_1k_tokens: usd_to_micros(input, "<inline>", "input_cost")?,
            output_usd_micros_per_1k_tokens: usd_to_micros(output, "<inline>", "output_cost")?,
        })
    }
}

#[derive(Debug, Error)]
pub enum PricingTableError {
    #[error("invalid pricing json: expected object at root")]
    InvalidRoot,
    #[error("invalid pricing entry for model {model}: expected object")]
    InvalidModelEntry { model: String },
    #[error("invalid pricing entry for model {model}: missing both input/output cost")]
    MissingCosts { model: String },
    #[error("invalid pricing entry for model {model}: invalid cost value for {field}")]
    InvalidCostValue { model: String, field: &'static str },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to read pricing file: {0}")]
    Io(#[from] std::io::Error),
}

impl Default for PricingTable {
    fn default() -> Self {
        // USD per 1000 tokens, (input, output).
        const LIST_PRICES: [(&str, u64, u64); 5] = [
            ("gpt-3.5-turbo", 1_500, 2_000),
            ("gpt-3.5-turbo-16k", 3_000, 4_000),
            ("gpt-3.5-turbo-instruct", 1_500, 2_000),
            ("gpt-4", 30_000, 60_000),
            ("gpt-4-32k", 60_000, 120_000),
        ];

        let models = LIST_PRICES
            .iter()
            .map(|(model, input, output)| {
                (
                    (*model).to_string(),
                    ModelPricing {
                        input_usd_micros_per_1k_tokens: *input,
                        output_usd_micros_per_1k_tokens: *output,
                    },
                )
            })
            .collect();
        Self { models }
    }
}

impl PricingTable {
    pub fn empty() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(model.into(), pricing);
        self
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Loads a LiteLLM-style pricing file and layers it over the built-in prices.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PricingTableError> {
        let raw = std::fs::read_to_string(path)?;
        let loaded = Self::from_litellm_json_str(&raw)?;
        let mut table = Self::default();
        table.models.extend(loaded.models);
        Ok(table)
    }

    pub fn from_litellm_json_str(raw: &str) -> Result<Self, PricingTableError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Self::from_litellm_json_value(&value)
    }

    pub fn from_litellm_json_value(value: &serde_json::Value) -> Result<Self, PricingTableError> {
        let Some(root) = value.as_object() else {
            return Err(PricingTableError::InvalidRoot);
        };

        let mut models = HashMap::new();
        for (model, entry) in root {
            let Some(obj) = entry.as_object() else {
                return Err(PricingTableError::InvalidModelEntry {
                    model: model.clone(),
                });
            };

            let input = litellm_cost_per_1k(obj, "input_cost_per_token", "input_cost_per_1k_tokens")
                .map(|usd| usd_to_micros(usd, model, "input_cost"))
                .transpose()?;
            let output =
                litellm_cost_per_1k(obj, "output_cost_per_token", "output_cost_per_1k_tokens")
                    .map(|usd| usd_to_micros(usd, model, "output_cost"))
                    .transpose()?;

            if input.is_none() && output.is_none() {
                return Err(PricingTableError::MissingCosts {
                    model: model.clone(),
                });
            }

            models.insert(
                model.clone(),
                ModelPricing {
                    input_usd_micros_per_1k_tokens: input.unwrap_or(0),
                    output_usd_micros_per_1k_tokens: output.unwrap_or(0),
                },
            );
        }

        Ok(Self { models })
    }

    pub fn model_pricing(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    /// Exact match first, then one retry with the trailing `-<suffix>` removed.
    pub fn resolve(&self, model: &str) -> Option<(&str, &ModelPricing)> {
        if let Some((key, pricing)) = self.models.get_key_value(model) {
            return Some((key.as_str(), pricing));
        }
        let base = strip_variant_suffix(model)?;
        self.models
            .get_key_value(base)
            .map(|(key, pricing)| (key.as_str(), pricing))
    }

    /// The model name ledger rows are keyed under.
    ///
    /// Dated or fine-grained variants (`gpt-3.5-turbo-0613`) collapse onto
    /// their priced base model. Unknown names lose their last `-` component
    /// the same way, so every variant of an unpriced family still shares one
    /// row.
    pub fn canonical_model<'a>(&'a self, model: &'a str) -> &'a str {
        if let Some((key, _)) = self.resolve(model) {
            return key;
        }
        strip_variant_suffix(model).unwrap_or(model)
    }

    /// Prices a call; unresolved models are free rather than an error.
    pub fn cost_usd_micros(&self, model: &str, input_tokens: u64, output_tokens: u64) -> u64 {
        let pricing = self
            .resolve(model)
            .map(|(_, pricing)| *pricing)
            .unwrap_or(ModelPricing::FREE);
        cost_usd_micros(&pricing, input_tokens, output_tokens)
    }
}

/// Token counts times per-1k prices, rounded half-up to whole micros.
pub fn cost_usd_micros(pricing: &ModelPricing, input_tokens: u64, output_tokens: u64) -> u64 {
    let input = u128::from(input_tokens) * u128::from(pricing.input_usd_micros_per_1k_tokens);
    let output = u128::from(output_tokens) * u128::from(pricing.output_usd_micros_per_1k_tokens);
    let scaled = input.saturating_add(output);
    let micros = scaled.saturating_add(TOKENS_PER_PRICE_UNIT / 2) / TOKENS_PER_PRICE_UNIT;
    u64::try_from(micros).unwrap_or(u64::MAX)
}

pub fn usd_to_usd_micros(usd: f64) -> Option<u64> {
    usd_to_micros(usd, "", "").ok()
}

fn strip_variant_suffix(model: &str) -> Option<&str> {
    let idx = model.rfind('-')?;
    Some(&model[..idx])
}

fn litellm_cost_per_1k(
    obj: &serde_json::Map<String, serde_json::Value>,
    per_token_key: &'static str,
    per_1k_key: &'static str,
) -> Option<f64> {
    obj.get(per_token_key)
        .and_then(|value| value.as_f64())
        .map(|usd| usd * 1000.0)
        .or_else(|| obj.get(per_1k_key).and_then(|value| value.as_f64()))
}

fn usd_to_micros(usd: f64, model: &str, field: &'static str) -> Result<u64, PricingTableError> {
    let micros = (usd * 1_000_000.0).round();
    if !usd.is_finite() || usd < 0.0 || !micros.is_finite() {
        return Err(PricingTableError::InvalidCostValue {
            model: model.to_string(),
            field,
        });
    }
    let micros = if micros > u64::MAX as f64 {
        u64::MAX
    } else {
        micros as u64
    };
    Ok(micros)
}
