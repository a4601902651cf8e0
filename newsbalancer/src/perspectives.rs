//! Versioned perspective configuration.
//!
//! The document is TOML; formula and confidence method are plain strings on disk
//! and are turned into closed enums here, so everything past load time matches
//! exhaustively on them.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::error::ConfigError;

/// Instruction used when a perspective does not provide its own template.
pub const DEFAULT_PROMPT_TEMPLATE: &str = "Please analyze the political bias of the following article on a scale \
from -1.0 (strongly left) to 1.0 (strongly right). Respond ONLY with a valid JSON object containing \
'score', 'explanation', and 'confidence' (0.0 to 1.0). Do not include any other text or formatting.";

/// How per-perspective scores are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Formula {
    Weighted,
    Average,
}

impl Formula {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weighted => "weighted",
            Self::Average => "average",
        }
    }
}

impl FromStr for Formula {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "weighted" => Ok(Self::Weighted),
            "average" => Ok(Self::Average),
            other => Err(ConfigError::UnknownFormula(other.to_string())),
        }
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the composite confidence is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceMethod {
    Average,
    Min,
    Max,
    SpreadBased,
}

impl ConfidenceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Average => "average",
            Self::Min => "min",
            Self::Max => "max",
            Self::SpreadBased => "spread_based",
        }
    }
}

impl FromStr for ConfidenceMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "average" => Ok(Self::Average),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "spread_based" => Ok(Self::SpreadBased),
            other => Err(ConfigError::UnknownConfidenceMethod(other.to_string())),
        }
    }
}

impl fmt::Display for ConfidenceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One viewpoint/model combination to query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Perspective {
    pub id: String,
    pub model: String,
    /// Overrides the service URL from the application config
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Independent calls made for this perspective; their results are averaged
    #[serde(default = "default_samples")]
    pub samples: u32,
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub examples: Vec<String>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_samples() -> u32 {
    1
}

impl Perspective {
    pub fn new(id: impl Into<String>, model: impl Into<String>, weight: f64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            endpoint: None,
            weight,
            samples: 1,
            prompt_template: None,
            examples: Vec::new(),
        }
    }

    /// Template, examples, then the article text.
    pub fn format_prompt(&self, content: &str) -> String {
        let template = self
            .prompt_template
            .as_deref()
            .unwrap_or(DEFAULT_PROMPT_TEMPLATE);
        format!("{}\n{}\nArticle:\n{}", template, self.examples.join("\n"), content)
    }
}

/// On-disk shape. Kept separate so unknown formula names surface as `ConfigError`.
#[derive(Debug, Deserialize)]
struct RawPerspectiveConfig {
    version: String,
    formula: String,
    confidence_method: String,
    quorum: usize,
    #[serde(default)]
    min_confidence: f64,
    #[serde(default)]
    perspectives: Vec<Perspective>,
}

/// Immutable, validated snapshot. Shared read-only across jobs.
#[derive(Debug, Clone, Serialize)]
pub struct PerspectiveConfig {
    pub version: String,
    pub formula: Formula,
    pub confidence_method: ConfidenceMethod,
    /// Minimum number of perspectives with a usable result
    pub quorum: usize,
    /// Usable results below this confidence are left out of aggregation
    pub min_confidence: f64,
    pub perspectives: Vec<Perspective>,
}

impl PerspectiveConfig {
    /// Build and validate a config in code.
    pub fn new(
        version: impl Into<String>,
        formula: Formula,
        confidence_method: ConfidenceMethod,
        quorum: usize,
        perspectives: Vec<Perspective>,
    ) -> Result<Self, ConfigError> {
        let cfg = Self {
            version: version.into(),
            formula,
            confidence_method,
            quorum,
            min_confidence: 0.0,
            perspectives,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let cfg = Self::from_toml_str(&data)?;
        info!(
            path = %path.display(),
            version = %cfg.version,
            perspectives = cfg.perspectives.len(),
            formula = %cfg.formula,
            confidence_method = %cfg.confidence_method,
            "perspective config loaded"
        );
        Ok(cfg)
    }

    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        let raw: RawPerspectiveConfig = toml::from_str(data)?;
        let cfg = Self {
            version: raw.version.trim().to_string(),
            formula: raw.formula.parse()?,
            confidence_method: raw.confidence_method.parse()?,
            quorum: raw.quorum,
            min_confidence: raw.min_confidence,
            perspectives: raw.perspectives,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version.trim().is_empty() {
            return Err(ConfigError::EmptyVersion);
        }
        if self.perspectives.is_empty() {
            return Err(ConfigError::NoPerspectives);
        }
        let mut seen = HashSet::new();
        for p in &self.perspectives {
            if p.id.trim().is_empty() {
                return Err(ConfigError::EmptyPerspectiveId);
            }
            if !seen.insert(p.id.as_str()) {
                return Err(ConfigError::DuplicatePerspective(p.id.clone()));
            }
            if p.model.trim().is_empty() {
                return Err(ConfigError::EmptyModel(p.id.clone()));
            }
            if !p.weight.is_finite() || p.weight < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    id: p.id.clone(),
                    weight: p.weight,
                });
            }
            if p.samples == 0 {
                return Err(ConfigError::ZeroSamples(p.id.clone()));
            }
        }
        if self.quorum == 0 || self.quorum > self.perspectives.len() {
            return Err(ConfigError::InvalidQuorum {
                quorum: self.quorum,
                perspectives: self.perspectives.len(),
            });
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::InvalidMinConfidence(self.min_confidence));
        }
        Ok(())
    }

    pub fn perspective(&self, id: &str) -> Option<&Perspective> {
        self.perspectives.iter().find(|p| p.id == id)
    }

    /// Total number of model calls one job makes.
    pub fn total_calls(&self) -> usize {
        self.perspectives.iter().map(|p| p.samples as usize).sum()
    }
}
