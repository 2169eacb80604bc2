//! Job requests, routing and pricing
//!
//! A create request is validated into [`JobParams`] before anything is
//! charged. Routing decides which provider runs each kind; pricing decides
//! what it costs.

use crate::error::{OrchestratorError, Result};
use kiln_core::{Direction, JobKind, JobParams, ProviderKind};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longest accepted prompt, in characters
pub const MAX_PROMPT_CHARS: usize = 2000;

/// Accepted image side lengths
pub const DIMENSION_RANGE: std::ops::RangeInclusive<u32> = 64..=2048;

/// Accepted camera elevation, in degrees
pub const ELEVATION_RANGE: std::ops::RangeInclusive<i32> = -90..=90;

const DEFAULT_DIMENSION: u32 = 1024;
const DEFAULT_ELEVATION: i32 = 20;
const PUBLIC_ID_LEN: usize = 10;

/// Short URL-safe id for a new job
pub fn generate_public_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PUBLIC_ID_LEN)
        .map(char::from)
        .collect()
}

/// Which provider runs each job kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    routes: BTreeMap<JobKind, ProviderKind>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            routes: BTreeMap::from([
                (JobKind::Sprite, ProviderKind::Serverless),
                (JobKind::Texture, ProviderKind::SelfHosted),
                (JobKind::Rotation8, ProviderKind::Serverless),
                (JobKind::Rotation4, ProviderKind::Serverless),
                (JobKind::RotationSingle, ProviderKind::Serverless),
            ]),
        }
    }
}

impl RoutingTable {
    /// Route `kind` to `provider`
    pub fn with_route(mut self, kind: JobKind, provider: ProviderKind) -> Self {
        self.routes.insert(kind, provider);
        self
    }

    pub fn provider_for(&self, kind: JobKind) -> Option<ProviderKind> {
        self.routes.get(&kind).copied()
    }

    pub fn routes(&self) -> impl Iterator<Item = (JobKind, ProviderKind)> + '_ {
        self.routes.iter().map(|(k, p)| (*k, *p))
    }
}

/// Token cost of each job kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    costs: BTreeMap<JobKind, i64>,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            costs: BTreeMap::from([
                (JobKind::Sprite, 2),
                (JobKind::Texture, 4),
                (JobKind::Rotation8, 8),
                (JobKind::Rotation4, 4),
                (JobKind::RotationSingle, 1),
            ]),
        }
    }
}

impl Pricing {
    pub fn with_cost(mut self, kind: JobKind, cost: i64) -> Self {
        self.costs.insert(kind, cost);
        self
    }

    /// Cost of `kind`; unpriced kinds are free
    pub fn cost(&self, kind: JobKind) -> i64 {
        self.costs.get(&kind).copied().unwrap_or(0)
    }
}

/// Body of a create request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub kind: Option<JobKind>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub elevation: Option<i32>,
    #[serde(default)]
    pub source: Option<Direction>,
    #[serde(default)]
    pub target: Option<Direction>,
}

impl CreateJobRequest {
    /// Prompt-driven request (sprite, texture)
    pub fn prompt(kind: JobKind, prompt: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    /// Image-driven request (rotations)
    pub fn image(kind: JobKind, image_url: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            image_url: Some(image_url.into()),
            ..Default::default()
        }
    }

    /// Set single-view directions
    pub fn with_directions(mut self, source: Direction, target: Direction) -> Self {
        self.source = Some(source);
        self.target = Some(target);
        self
    }

    /// Check the request and build the job input
    pub fn validate(&self) -> Result<(JobKind, JobParams)> {
        let kind = self
            .kind
            .ok_or_else(|| OrchestratorError::validation("job kind is required"))?;

        let params = match kind {
            JobKind::Sprite | JobKind::Texture => JobParams::Prompt {
                prompt: validate_prompt(self.prompt.as_deref(), "prompt")?
                    .ok_or_else(|| OrchestratorError::validation("prompt is required"))?,
                negative_prompt: validate_prompt(self.negative_prompt.as_deref(), "negative prompt")?,
                width: validate_dimension(self.width, "width")?,
                height: validate_dimension(self.height, "height")?,
                seed: self.seed,
            },
            JobKind::Rotation8 | JobKind::Rotation4 => JobParams::Rotation {
                image_url: validate_image_url(self.image_url.as_deref())?,
                elevation: validate_elevation(self.elevation)?,
            },
            JobKind::RotationSingle => {
                let (Some(source), Some(target)) = (self.source, self.target) else {
                    return Err(OrchestratorError::validation(
                        "source and target directions are required",
                    ));
                };
                if source == target {
                    return Err(OrchestratorError::validation(
                        "source and target directions must differ",
                    ));
                }
                JobParams::SingleView {
                    image_url: validate_image_url(self.image_url.as_deref())?,
                    source,
                    target,
                    elevation: validate_elevation(self.elevation)?,
                }
            }
        };
        Ok((kind, params))
    }
}

/// Trimmed prompt, `None` when absent or blank
fn validate_prompt(value: Option<&str>, field: &str) -> Result<Option<String>> {
    let Some(trimmed) = value.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    if trimmed.chars().count() > MAX_PROMPT_CHARS {
        return Err(OrchestratorError::validation(format!(
            "{} must be at most {} characters",
            field, MAX_PROMPT_CHARS
        )));
    }
    Ok(Some(trimmed.to_string()))
}

fn validate_dimension(value: Option<u32>, field: &str) -> Result<u32> {
    let value = value.unwrap_or(DEFAULT_DIMENSION);
    if !DIMENSION_RANGE.contains(&value) {
        return Err(OrchestratorError::validation(format!(
            "{} must be between {} and {}",
            field,
            DIMENSION_RANGE.start(),
            DIMENSION_RANGE.end()
        )));
    }
    Ok(value)
}

fn validate_elevation(value: Option<i32>) -> Result<i32> {
    let value = value.unwrap_or(DEFAULT_ELEVATION);
    if !ELEVATION_RANGE.contains(&value) {
        return Err(OrchestratorError::validation(
            "elevation must be between -90 and 90 degrees",
        ));
    }
    Ok(value)
}

fn validate_image_url(value: Option<&str>) -> Result<String> {
    let url = value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| OrchestratorError::validation("image URL is required"))?;
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| OrchestratorError::validation("image URL must use http or https"))?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(OrchestratorError::validation("image URL has no host"));
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_validation() {
        let (kind, params) = CreateJobRequest::prompt(JobKind::Sprite, "  knight  ")
            .validate()
            .unwrap();
        assert_eq!(kind, JobKind::Sprite);
        assert_eq!(
            params,
            JobParams::Prompt {
                prompt: "knight".into(),
                negative_prompt: None,
                width: 1024,
                height: 1024,
                seed: None,
            }
        );

        assert!(CreateJobRequest::prompt(JobKind::Sprite, "   ").validate().is_err());
        assert!(CreateJobRequest::prompt(JobKind::Sprite, "x".repeat(2001))
            .validate()
            .is_err());
        assert!(CreateJobRequest::prompt(JobKind::Texture, "é".repeat(2000))
            .validate()
            .is_ok());

        let mut small = CreateJobRequest::prompt(JobKind::Sprite, "knight");
        small.width = Some(32);
        assert!(small.validate().is_err());
    }

    #[test]
    fn test_rotation_validation() {
        let (_, params) = CreateJobRequest::image(JobKind::Rotation8, "https://cdn.example/a.png")
            .validate()
            .unwrap();
        assert_eq!(
            params,
            JobParams::Rotation {
                image_url: "https://cdn.example/a.png".into(),
                elevation: 20
            }
        );

        assert!(CreateJobRequest::image(JobKind::Rotation4, "ftp://x/a.png")
            .validate()
            .is_err());
        assert!(CreateJobRequest::image(JobKind::Rotation4, "https://")
            .validate()
            .is_err());

        let mut steep = CreateJobRequest::image(JobKind::Rotation4, "https://x/a.png");
        steep.elevation = Some(91);
        assert!(steep.validate().is_err());
    }

    #[test]
    fn test_single_view_needs_distinct_directions() {
        let base = CreateJobRequest::image(JobKind::RotationSingle, "https://x/a.png");
        assert!(base.clone().validate().is_err());
        assert!(base
            .clone()
            .with_directions(Direction::Front, Direction::Front)
            .validate()
            .is_err());
        assert!(base
            .with_directions(Direction::Front, Direction::Left)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_missing_kind() {
        assert!(CreateJobRequest::default().validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let routing = RoutingTable::default();
        assert_eq!(routing.provider_for(JobKind::Texture), Some(ProviderKind::SelfHosted));
        assert_eq!(routing.provider_for(JobKind::Rotation8), Some(ProviderKind::Serverless));
        assert_eq!(Pricing::default().cost(JobKind::Rotation8), 8);

        let id = generate_public_id();
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_request_wire_format() {
        let request: CreateJobRequest = serde_json::from_str(
            r#"{"kind":"rotation_single","imageUrl":"https://x/a.png","source":"front","target":"back","elevation":-10}"#,
        )
        .unwrap();
        let (kind, params) = request.validate().unwrap();
        assert_eq!(kind, JobKind::RotationSingle);
        assert!(matches!(params, JobParams::SingleView { elevation: -10, .. }));
    }
}
