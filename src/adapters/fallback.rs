//! Ordered provider fallback for code generation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{CodeGenerator, GenerationError, GenerationRequest};
use crate::domain::FileSet;

/// Tries each generator in order until one produces a candidate.
///
/// Any failure moves on to the next provider, credentials included, since
/// each provider has its own. When all fail the last error is returned.
pub struct FallbackGenerator {
    name: String,
    generators: Vec<Arc<dyn CodeGenerator>>,
}

impl FallbackGenerator {
    pub fn new(generators: Vec<Arc<dyn CodeGenerator>>) -> Self {
        let name = generators
            .iter()
            .map(|g| g.name())
            .collect::<Vec<_>>()
            .join(" > ");
        Self { name, generators }
    }
}

#[async_trait]
impl CodeGenerator for FallbackGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn produce(&self, request: &GenerationRequest<'_>) -> Result<FileSet, GenerationError> {
        let mut last_error = GenerationError::Provider("no generator configured".to_string());

        for (position, generator) in self.generators.iter().enumerate() {
            match generator.produce(request).await {
                Ok(files) => {
                    if position > 0 {
                        info!(generator = generator.name(), "Fallback provider produced the candidate");
                    }
                    return Ok(files);
                }
                Err(e) => {
                    warn!(generator = generator.name(), error = %e, "Provider failed, trying next");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Healthy while any provider answers
    async fn health_check(&self) -> Result<(), GenerationError> {
        let mut last_error = GenerationError::Provider("no generator configured".to_string());
        for generator in &self.generators {
            match generator.health_check().await {
                Ok(()) => return Ok(()),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}
