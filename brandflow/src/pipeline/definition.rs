//! Stage descriptors and the standard five-stage pipeline definition.
//!
//! Stages are data: a number, a name, whether the stage depends only on the
//! input or also on the brand, a prompt-context builder and the shape its
//! output must have. A single [`StageRunner`](super::StageRunner) executes
//! any descriptor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::core::STAGE_COUNT;
use crate::errors::{BrandflowError, Failure};
use crate::ports::BrandProfile;

/// Whether a stage's output depends on the brand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageScope {
    /// Depends only on the input document. Cacheable across brands.
    InputOnly,
    /// Depends on the brand profile.
    BrandSpecific,
}

impl fmt::Display for StageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputOnly => write!(f, "input_only"),
            Self::BrandSpecific => write!(f, "brand_specific"),
        }
    }
}

/// Expected shape of a stage's parsed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// A JSON object containing the listed keys.
    Object {
        /// Keys that must be present.
        required: &'static [&'static str],
    },
    /// A JSON object whose `key` holds an array of exactly `count` objects.
    Entries {
        /// Array field.
        key: &'static str,
        /// Required entry count.
        count: usize,
    },
}

impl OutputShape {
    /// Checks a parsed value against the shape.
    pub fn validate(&self, value: &Value) -> Result<(), Failure> {
        let Some(object) = value.as_object() else {
            return Err(Failure::malformed_output("output is not a JSON object"));
        };
        match *self {
            Self::Object { required } => {
                if let Some(missing) = required.iter().find(|k| !object.contains_key(**k)) {
                    return Err(Failure::malformed_output(format!(
                        "output is missing field '{missing}'"
                    )));
                }
                Ok(())
            }
            Self::Entries { key, count } => {
                let entries = object
                    .get(key)
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        Failure::malformed_output(format!("output field '{key}' is not a list"))
                    })?;
                if entries.len() != count {
                    return Err(Failure::malformed_output(format!(
                        "expected exactly {count} {key}, got {}",
                        entries.len()
                    )));
                }
                if !entries.iter().all(Value::is_object) {
                    return Err(Failure::malformed_output(format!(
                        "every entry in '{key}' must be an object"
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Brand data available to brand-specific stages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BrandContext {
    /// Brand identifier.
    pub brand_id: String,
    /// Loaded profile.
    pub profile: BrandProfile,
    /// Research notes; empty when none were available.
    pub research: String,
}

/// Everything a stage may read when building its prompt context.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageInputs {
    /// Source document identifier.
    pub input_id: String,
    /// Extracted document text.
    pub document_text: String,
    /// Brand data, present once brand-specific stages start.
    pub brand: Option<BrandContext>,
    /// Accepted outputs of earlier stages.
    pub outputs: BTreeMap<u8, Value>,
}

impl StageInputs {
    /// Inputs for the input-only prefix.
    #[must_use]
    pub fn for_document(input_id: impl Into<String>, document_text: impl Into<String>) -> Self {
        Self {
            input_id: input_id.into(),
            document_text: document_text.into(),
            brand: None,
            outputs: BTreeMap::new(),
        }
    }

    /// Sets the brand data.
    #[must_use]
    pub fn with_brand(mut self, brand: BrandContext) -> Self {
        self.brand = Some(brand);
        self
    }

    /// Records an accepted stage output.
    pub fn record(&mut self, stage: u8, output: Value) {
        self.outputs.insert(stage, output);
    }

    fn output(&self, stage: u8) -> Result<Value, Failure> {
        self.outputs
            .get(&stage)
            .cloned()
            .ok_or_else(|| Failure::logic(format!("stage {stage} output is not available")))
    }

    fn brand(&self) -> Result<&BrandContext, Failure> {
        self.brand
            .as_ref()
            .ok_or_else(|| Failure::logic("brand context is not loaded"))
    }
}

/// Request handed to the generation provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptContext {
    /// Stage number.
    pub stage: u8,
    /// Stage name.
    pub stage_name: String,
    /// Named template variables.
    pub variables: BTreeMap<String, Value>,
}

/// Builds a stage's template variables from the accumulated inputs.
pub type ContextBuilder = fn(&StageInputs) -> Result<BTreeMap<String, Value>, Failure>;

/// One pipeline stage as data.
#[derive(Debug, Clone, Copy)]
pub struct StageDescriptor {
    /// Stage number (1-based).
    pub number: u8,
    /// Human-readable name.
    pub name: &'static str,
    /// Input-only or brand-specific.
    pub scope: StageScope,
    /// Template variable builder.
    pub build_context: ContextBuilder,
    /// Output shape.
    pub shape: OutputShape,
}

impl StageDescriptor {
    /// Builds the provider request for this stage.
    pub fn prompt_context(&self, inputs: &StageInputs) -> Result<PromptContext, Failure> {
        Ok(PromptContext {
            stage: self.number,
            stage_name: self.name.to_string(),
            variables: (self.build_context)(inputs)?,
        })
    }
}

fn vars<const N: usize>(pairs: [(&str, Value); N]) -> BTreeMap<String, Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn input_processing(inputs: &StageInputs) -> Result<BTreeMap<String, Value>, Failure> {
    if inputs.document_text.trim().is_empty() {
        return Err(Failure::input_parse(format!(
            "no text could be extracted from input {}",
            inputs.input_id
        )));
    }
    Ok(vars([("input_text", Value::String(inputs.document_text.clone()))]))
}

fn signal_amplification(inputs: &StageInputs) -> Result<BTreeMap<String, Value>, Failure> {
    Ok(vars([("stage1_output", inputs.output(1)?)]))
}

fn general_translation(inputs: &StageInputs) -> Result<BTreeMap<String, Value>, Failure> {
    Ok(vars([
        ("stage1_output", inputs.output(1)?),
        ("stage2_output", inputs.output(2)?),
    ]))
}

fn brand_contextualization(inputs: &StageInputs) -> Result<BTreeMap<String, Value>, Failure> {
    let brand = inputs.brand()?;
    let profile = serde_json::to_value(&brand.profile)?;
    Ok(vars([
        ("stage3_output", inputs.output(3)?),
        ("brand_profile", profile),
        ("research_data", Value::String(brand.research.clone())),
    ]))
}

fn opportunity_generation(inputs: &StageInputs) -> Result<BTreeMap<String, Value>, Failure> {
    let brand = inputs.brand()?;
    Ok(vars([
        ("stage4_output", inputs.output(4)?),
        ("brand_name", Value::String(brand.profile.display_name(&brand.brand_id))),
        ("input_source", Value::String(inputs.input_id.clone())),
    ]))
}

/// Number of opportunities the final stage must produce.
pub const OPPORTUNITY_COUNT: usize = 5;

/// Ordered stage list plus the length of the cacheable prefix.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    stages: Vec<StageDescriptor>,
    prefix_len: usize,
}

impl PipelineDefinition {
    /// Creates and validates a definition.
    ///
    /// Stages must be numbered `1..=5` in order, the first `prefix_len`
    /// must be input-only and the rest brand-specific.
    pub fn new(stages: Vec<StageDescriptor>, prefix_len: usize) -> Result<Self, BrandflowError> {
        if stages.len() != usize::from(STAGE_COUNT) {
            return Err(BrandflowError::InvalidDefinition(format!(
                "expected {STAGE_COUNT} stages, got {}",
                stages.len()
            )));
        }
        if prefix_len > stages.len() {
            return Err(BrandflowError::InvalidDefinition(format!(
                "prefix length {prefix_len} exceeds stage count"
            )));
        }
        for (index, stage) in stages.iter().enumerate() {
            if usize::from(stage.number) != index + 1 {
                return Err(BrandflowError::InvalidDefinition(format!(
                    "stage '{}' has number {} at position {}",
                    stage.name,
                    stage.number,
                    index + 1
                )));
            }
            let expected = if index < prefix_len {
                StageScope::InputOnly
            } else {
                StageScope::BrandSpecific
            };
            if stage.scope != expected {
                return Err(BrandflowError::InvalidDefinition(format!(
                    "stage {} is {} but must be {expected}",
                    stage.number, stage.scope
                )));
            }
        }
        Ok(Self { stages, prefix_len })
    }

    /// The five-stage brand translation pipeline with a three-stage prefix.
    #[must_use]
    pub fn standard() -> Self {
        let object = OutputShape::Object { required: &[] };
        Self {
            stages: vec![
                StageDescriptor {
                    number: 1,
                    name: "Input Processing",
                    scope: StageScope::InputOnly,
                    build_context: input_processing,
                    shape: object,
                },
                StageDescriptor {
                    number: 2,
                    name: "Signal Amplification",
                    scope: StageScope::InputOnly,
                    build_context: signal_amplification,
                    shape: object,
                },
                StageDescriptor {
                    number: 3,
                    name: "General Translation",
                    scope: StageScope::InputOnly,
                    build_context: general_translation,
                    shape: object,
                },
                StageDescriptor {
                    number: 4,
                    name: "Brand Contextualization",
                    scope: StageScope::BrandSpecific,
                    build_context: brand_contextualization,
                    shape: object,
                },
                StageDescriptor {
                    number: 5,
                    name: "Opportunity Generation",
                    scope: StageScope::BrandSpecific,
                    build_context: opportunity_generation,
                    shape: OutputShape::Entries {
                        key: "opportunities",
                        count: OPPORTUNITY_COUNT,
                    },
                },
            ],
            prefix_len: 3,
        }
    }

    /// All stages in order.
    #[must_use]
    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Input-only stages.
    #[must_use]
    pub fn prefix(&self) -> &[StageDescriptor] {
        &self.stages[..self.prefix_len]
    }

    /// Brand-specific stages.
    #[must_use]
    pub fn brand_stages(&self) -> &[StageDescriptor] {
        &self.stages[self.prefix_len..]
    }

    /// Looks up a stage by number.
    #[must_use]
    pub fn stage(&self, number: u8) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.number == number)
    }

    /// Name of a stage, or `"Unknown"`.
    #[must_use]
    pub fn stage_name(&self, number: u8) -> &'static str {
        self.stage(number).map_or("Unknown", |s| s.name)
    }
}

impl Default for PipelineDefinition {
    fn default() -> Self {
        Self::standard()
    }
}
