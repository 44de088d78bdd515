use super::registry::{ModelRegistry, ModelSpec};

/// Candidates in the order the synthesis client should try them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChain {
    pub candidates: Vec<ModelSpec>,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

impl ModelChain {
    pub fn names(&self) -> Vec<String> {
        self.candidates
            .iter()
            .map(|model| model.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Build the fallback chain for `provider`, moving `requested` to the
    /// front when the registry knows it.
    pub fn chain(&self, requested: Option<&str>, provider: &str) -> Result<ModelChain, String> {
        let mut candidates = self.registry.by_provider(provider);
        if candidates.is_empty() {
            return Err(format!("No models available for provider '{provider}'."));
        }

        let Some(requested_value) = requested else {
            return Ok(ModelChain {
                candidates,
                requested: None,
                fallback_reason: None,
            });
        };

        if let Some(model) = self.registry.ensure(requested_value, provider) {
            candidates.retain(|candidate| candidate.name != model.name);
            candidates.insert(0, model);
            return Ok(ModelChain {
                candidates,
                requested: Some(requested_value.to_string()),
                fallback_reason: None,
            });
        }

        Ok(ModelChain {
            candidates,
            requested: Some(requested_value.to_string()),
            fallback_reason: Some(format!(
                "Requested model '{requested_value}' unavailable for provider '{provider}'; using default order."
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::models::{ModelRegistry, ModelSelector, ModelSpec};

    fn selector() -> ModelSelector {
        ModelSelector::new(Some(ModelRegistry::from_specs(vec![
            ModelSpec::new("flux", "huggingface"),
            ModelSpec::new("sdxl", "huggingface"),
            ModelSpec::new("tiny", "huggingface"),
            ModelSpec::new("dryrun-image-1", "dryrun"),
        ])))
    }

    #[test]
    fn chain_keeps_registry_order_without_request() {
        let chain = selector().chain(None, "huggingface").unwrap();
        assert_eq!(chain.names(), vec!["flux", "sdxl", "tiny"]);
        assert!(chain.fallback_reason.is_none());
    }

    #[test]
    fn chain_moves_requested_model_first() {
        let chain = selector().chain(Some("tiny"), "huggingface").unwrap();
        assert_eq!(chain.names(), vec!["tiny", "flux", "sdxl"]);
        assert_eq!(chain.requested.as_deref(), Some("tiny"));
    }

    #[test]
    fn chain_explains_unknown_request() {
        let chain = selector().chain(Some("missing"), "huggingface").unwrap();
        assert_eq!(chain.names(), vec!["flux", "sdxl", "tiny"]);
        assert_eq!(
            chain.fallback_reason.as_deref(),
            Some("Requested model 'missing' unavailable for provider 'huggingface'; using default order.")
        );
    }

    #[test]
    fn chain_rejects_request_from_other_provider() {
        let chain = selector()
            .chain(Some("dryrun-image-1"), "huggingface")
            .unwrap();
        assert_eq!(chain.names(), vec!["flux", "sdxl", "tiny"]);
        assert!(chain.fallback_reason.is_some());
    }

    #[test]
    fn chain_raises_when_provider_has_no_models() {
        let err = selector()
            .chain(None, "replicate")
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No models available for provider 'replicate'.");
    }
}
