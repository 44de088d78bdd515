use indexmap::IndexMap;

/// One text-to-image model the synthesis client can try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
}

impl ModelSpec {
    pub fn new(name: &str, provider: &str) -> Self {
        Self {
            name: name.to_string(),
            provider: provider.to_string(),
        }
    }
}

/// Ordered set of known models. Order is fallback priority.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn from_specs(specs: Vec<ModelSpec>) -> Self {
        let models = specs
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();
        Self { models }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn by_provider(&self, provider: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.provider == provider)
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, provider: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.provider == provider {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    // Fallback order: quality first, then latency.
    for (name, provider) in [
        ("black-forest-labs/FLUX.1-schnell", "huggingface"),
        ("stabilityai/sdxl-turbo", "huggingface"),
        ("dryrun-image-1", "dryrun"),
    ] {
        map.insert(name.to_string(), ModelSpec::new(name, provider));
    }

    map
}
