//! Hyperparameter resolution.
//!
//! Callers hand over whatever JSON the client sent. Every field has a
//! canonical camelCase key and, for most fields, a snake_case alternate. The
//! canonical key wins; the alternate is consulted only when the canonical one
//! is absent or unusable. Resolution is total: bad input degrades to the
//! defaults with a warning and never fails a submission.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const DEFAULT_EPOCHS: u32 = 5;
pub const DEFAULT_BATCH_SIZE: u32 = 50;
pub const DEFAULT_LEARNING_RATE: f64 = 0.0002;
pub const DEFAULT_DISCRIMINATOR_STEPS: u32 = 1;

/// Fully resolved training parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    pub epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
    pub discriminator_steps: u32,
    /// Generator layer sizes, e.g. `"256,256"`. `None` leaves the external
    /// default in place.
    pub generator_dim: Option<String>,
    pub discriminator_dim: Option<String>,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            batch_size: DEFAULT_BATCH_SIZE,
            learning_rate: DEFAULT_LEARNING_RATE,
            discriminator_steps: DEFAULT_DISCRIMINATOR_STEPS,
            generator_dim: None,
            discriminator_dim: None,
        }
    }
}

impl TrainingParams {
    /// Flags understood by the training script.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--epochs".to_string(),
            self.epochs.to_string(),
            "--batch_size".to_string(),
            self.batch_size.to_string(),
            "--learning_rate".to_string(),
            self.learning_rate.to_string(),
            "--discriminator_steps".to_string(),
            self.discriminator_steps.to_string(),
        ];
        if let Some(dim) = &self.generator_dim {
            args.push("--generator_dim".to_string());
            args.push(dim.clone());
        }
        if let Some(dim) = &self.discriminator_dim {
            args.push("--discriminator_dim".to_string());
            args.push(dim.clone());
        }
        args
    }
}

/// Accepted shape of the raw payload. Unknown keys are ignored and JSON
/// `null` reads as absent.
#[derive(Debug, Default, Deserialize)]
struct HyperparameterPayload {
    epochs: Option<Value>,
    #[serde(rename = "batchSize")]
    batch_size_camel: Option<Value>,
    batch_size: Option<Value>,
    #[serde(rename = "learningRate")]
    learning_rate_camel: Option<Value>,
    learning_rate: Option<Value>,
    #[serde(rename = "discriminatorSteps")]
    discriminator_steps_camel: Option<Value>,
    discriminator_steps: Option<Value>,
    #[serde(rename = "generatorDim")]
    generator_dim_camel: Option<Value>,
    generator_dim: Option<Value>,
    #[serde(rename = "discriminatorDim")]
    discriminator_dim_camel: Option<Value>,
    discriminator_dim: Option<Value>,
}

/// Resolve a JSON payload into [`TrainingParams`].
pub fn resolve(payload: Option<&Value>) -> TrainingParams {
    let Some(payload) = payload else {
        return TrainingParams::default();
    };
    if payload.is_null() {
        return TrainingParams::default();
    }
    if !payload.is_object() {
        warn!(payload = %payload, "hyperparameters are not a JSON object, using defaults");
        return TrainingParams::default();
    }
    match HyperparameterPayload::deserialize(payload) {
        Ok(parsed) => resolve_payload(&parsed),
        Err(err) => {
            warn!(error = %err, "unreadable hyperparameters, using defaults");
            TrainingParams::default()
        }
    }
}

/// Resolve a payload stored as JSON text.
pub fn resolve_str(raw: Option<&str>) -> TrainingParams {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return TrainingParams::default();
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => resolve(Some(&value)),
        Err(err) => {
            warn!(error = %err, "hyperparameters are not valid JSON, using defaults");
            TrainingParams::default()
        }
    }
}

fn resolve_payload(p: &HyperparameterPayload) -> TrainingParams {
    let defaults = TrainingParams::default();
    TrainingParams {
        epochs: first_valid(&[("epochs", p.epochs.as_ref())], parse_count)
            .unwrap_or(defaults.epochs),
        batch_size: first_valid(
            &[
                ("batchSize", p.batch_size_camel.as_ref()),
                ("batch_size", p.batch_size.as_ref()),
            ],
            parse_count,
        )
        .unwrap_or(defaults.batch_size),
        learning_rate: first_valid(
            &[
                ("learningRate", p.learning_rate_camel.as_ref()),
                ("learning_rate", p.learning_rate.as_ref()),
            ],
            parse_rate,
        )
        .unwrap_or(defaults.learning_rate),
        discriminator_steps: first_valid(
            &[
                ("discriminatorSteps", p.discriminator_steps_camel.as_ref()),
                ("discriminator_steps", p.discriminator_steps.as_ref()),
            ],
            parse_count,
        )
        .unwrap_or(defaults.discriminator_steps),
        generator_dim: first_valid(
            &[
                ("generatorDim", p.generator_dim_camel.as_ref()),
                ("generator_dim", p.generator_dim.as_ref()),
            ],
            parse_dim,
        ),
        discriminator_dim: first_valid(
            &[
                ("discriminatorDim", p.discriminator_dim_camel.as_ref()),
                ("discriminator_dim", p.discriminator_dim.as_ref()),
            ],
            parse_dim,
        ),
    }
}

/// First candidate, in priority order, that is present and well-formed.
fn first_valid<T>(
    candidates: &[(&'static str, Option<&Value>)],
    parse: fn(&Value) -> Option<T>,
) -> Option<T> {
    candidates.iter().find_map(|(key, value)| {
        let value = (*value).filter(|value| !is_blank(value))?;
        let parsed = parse(value);
        if parsed.is_none() {
            warn!(key, value = %value, "ignoring malformed hyperparameter");
        }
        parsed
    })
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Positive count from an integer, an integral float or numeric text.
fn parse_count(value: &Value) -> Option<u32> {
    let count = match value {
        Value::Number(n) => match n.as_u64() {
            Some(n) => n,
            None => integral(n.as_f64()?)?,
        },
        Value::String(s) => {
            let s = s.trim();
            match s.parse::<u64>() {
                Ok(n) => n,
                Err(_) => integral(s.parse::<f64>().ok()?)?,
            }
        }
        _ => return None,
    };
    u32::try_from(count).ok().filter(|count| *count > 0)
}

fn integral(value: f64) -> Option<u64> {
    (value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64)
        .then_some(value as u64)
}

/// Finite, strictly positive rate.
fn parse_rate(value: &Value) -> Option<f64> {
    let rate = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// Layer sizes as `"a,b,..."`.
fn parse_dim(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => n.as_u64().filter(|n| *n > 0).map(|n| n.to_string()),
        Value::Array(items) if !items.is_empty() => {
            let sizes = items
                .iter()
                .map(|item| item.as_u64().filter(|n| *n > 0).map(|n| n.to_string()))
                .collect::<Option<Vec<_>>>()?;
            Some(sizes.join(","))
        }
        _ => None,
    }
}
