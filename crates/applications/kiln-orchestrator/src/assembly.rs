//! Result assembly
//!
//! Turns provider artifacts into the job's `name -> URL` result map. Outputs
//! the worker already uploaded are kept as-is; outputs held by the provider
//! are downloaded through the adapter and re-hosted in object storage under
//! `jobs/{public_id}/{name}.png`.

use crate::error::{OrchestratorError, Result};
use kiln_core::{Artifact, ArtifactLocation, ComputeProvider, Job, KilnError, ObjectStorage};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Collects artifacts into hosted URLs
#[derive(Clone)]
pub struct Assembler {
    storage: Arc<dyn ObjectStorage>,
}

impl Assembler {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    /// Storage path for one output of a job
    pub fn object_path(job: &Job, name: &str) -> String {
        format!("jobs/{}/{}.png", job.public_id, name)
    }

    /// Build the result map. An empty artifact list is an error: a job with
    /// nothing to deliver must not be charged.
    pub async fn assemble(
        &self,
        provider: &dyn ComputeProvider,
        job: &Job,
        artifacts: &[Artifact],
    ) -> Result<BTreeMap<String, String>> {
        if artifacts.is_empty() {
            return Err(OrchestratorError::Core(KilnError::invalid_response(
                "provider reported completion without outputs",
            )));
        }

        let mut result = BTreeMap::new();
        for artifact in artifacts {
            let url = match &artifact.location {
                ArtifactLocation::Hosted(url) => url.clone(),
                ArtifactLocation::Remote { .. } => {
                    let bytes = provider.fetch_artifact(job, artifact).await?;
                    let path = Self::object_path(job, &artifact.name);
                    let url = self.storage.put(&path, bytes, "image/png").await?;
                    debug!(job_id = %job.id, output = %artifact.name, url = %url, "Re-hosted output");
                    url
                }
            };
            result.insert(artifact.name.clone(), url);
        }
        Ok(result)
    }
}
