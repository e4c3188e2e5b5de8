// Configuration values consumed by the kernel.
//
// Everything here is plain serde data, so collaborators can produce it from
// JSON (reading files and resolving cross-file references is their job, not
// the kernel's):
// - `FeatureConfiguration`: per-feature settings plus the seed the resolver
//   overwrites with a derived sub-seed.
// - `EntityConfig`: everything needed to build one entity.
// - `ModuleLayerDefinition`: which plugin modules an isolated loading layer
//   exposes.
// - `KernelConfig`: process-wide setup, installed once by the entry point.
//
// See also: `resolver.rs` for how configurations are matched to features by
// name and checked against the feature's declared configuration kind,
// `loader.rs` for how layer definitions become `ModuleLayer`s.
//
// **Critical constraint: determinism.** Configurations are keyed by
// `BTreeMap` so iteration order never depends on hashing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::{KernelError, Result};
use crate::specification::FeatureSpecification;
use crate::types::Force;

// ---------------------------------------------------------------------------
// FeatureConfiguration
// ---------------------------------------------------------------------------

fn base_kind() -> String {
    FeatureConfiguration::BASE_KIND.to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfiguration {
    /// Configuration type name, checked against the feature's declared kind.
    #[serde(default = "base_kind")]
    pub kind: String,
    /// Overwritten by the resolver before `configure` runs.
    #[serde(default)]
    pub seed: u64,
    /// Feature-specific settings.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Default for FeatureConfiguration {
    fn default() -> Self {
        Self::default_for(Self::BASE_KIND)
    }
}

impl FeatureConfiguration {
    /// The kind every feature accepts.
    pub const BASE_KIND: &'static str = "FeatureConfiguration";

    /// An empty configuration of `kind`, used when none was provided.
    pub fn default_for(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            seed: 0,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(kind: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            params,
            ..Self::default_for(kind)
        }
    }

    /// Whether a feature declaring `required` may be configured with this.
    pub fn satisfies(&self, required: &str) -> bool {
        required == Self::BASE_KIND || required == self.kind
    }

    pub fn check_kind(&self, feature: &str, required: &str) -> Result<()> {
        if self.satisfies(required) {
            Ok(())
        } else {
            Err(KernelError::ConfigurationMismatch {
                feature: feature.to_string(),
                provided: self.kind.clone(),
                required: required.to_string(),
            })
        }
    }

    /// Deserialize `params` into the feature's settings type. Absent params
    /// read as an empty object, so `#[serde(default)]` settings work.
    pub fn params_as<T: DeserializeOwned>(&self, feature: &str) -> Result<T> {
        let value = match &self.params {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            other => other.clone(),
        };
        serde_json::from_value(value).map_err(|e| KernelError::InvalidConfiguration {
            feature: feature.to_string(),
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Module layers
// ---------------------------------------------------------------------------

/// Plugin modules an isolated loading layer exposes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleLayerDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub modules: Vec<String>,
}

impl ModuleLayerDefinition {
    pub fn new(name: impl Into<String>, modules: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            modules: modules.into_iter().map(Into::into).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// EntityConfig
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Empty means `entity-<id>`.
    #[serde(default)]
    pub name: String,
    /// Registry path. Empty means the name.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub force: Force,
    /// Zero means "use the entity id".
    #[serde(default)]
    pub seed: u64,
    /// Top-level features, resolved in order.
    #[serde(default)]
    pub features: Vec<FeatureSpecification>,
    /// Per-feature configurations, keyed by feature name.
    #[serde(default)]
    pub configurations: BTreeMap<String, FeatureConfiguration>,
    /// Plugin layer for this entity; `None` uses the loader's layer as is.
    #[serde(default)]
    pub layer: Option<ModuleLayerDefinition>,
}

impl EntityConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_force(mut self, force: Force) -> Self {
        self.force = force;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_feature(mut self, spec: FeatureSpecification) -> Self {
        self.features.push(spec);
        self
    }

    pub fn with_configuration(
        mut self,
        feature: impl Into<String>,
        configuration: FeatureConfiguration,
    ) -> Self {
        self.configurations.insert(feature.into(), configuration);
        self
    }

    pub fn with_layer(mut self, layer: ModuleLayerDefinition) -> Self {
        self.layer = Some(layer);
        self
    }
}

// ---------------------------------------------------------------------------
// KernelConfig
// ---------------------------------------------------------------------------

/// Process-wide setup. The only static in the crate; reserved for the
/// top-level entry point. Library code takes explicit values instead.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub root_layer: Option<ModuleLayerDefinition>,
}

static KERNEL_CONFIG: OnceLock<KernelConfig> = OnceLock::new();

impl KernelConfig {
    /// Install the process-wide configuration. Returns false if one was
    /// already installed (or already read), leaving it unchanged.
    pub fn install(self) -> bool {
        KERNEL_CONFIG.set(self).is_ok()
    }

    /// The installed configuration, or the default if none was installed.
    pub fn global() -> &'static KernelConfig {
        KERNEL_CONFIG.get_or_init(KernelConfig::default)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| KernelError::InvalidConfiguration {
            feature: "KernelConfig".to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct PaceSettings {
        speed: u32,
        label: String,
    }

    #[test]
    fn base_kind_accepts_anything() {
        let config = FeatureConfiguration::default_for("PaceConfiguration");
        assert!(config.satisfies(FeatureConfiguration::BASE_KIND));
        assert!(config.satisfies("PaceConfiguration"));
        assert!(config.check_kind("Pace", "OtherConfiguration").is_err());
    }

    #[test]
    fn kind_mismatch_names_both_kinds() {
        let err = FeatureConfiguration::default()
            .check_kind("Pace", "PaceConfiguration")
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("Pace"));
        assert!(text.contains("FeatureConfiguration"));
        assert!(text.contains("PaceConfiguration"));
    }

    #[test]
    fn params_read_into_settings() {
        let config: FeatureConfiguration = serde_json::from_str(
            r#"{"kind":"PaceConfiguration","params":{"speed":7}}"#,
        )
        .unwrap();
        assert_eq!(config.seed, 0);
        let settings: PaceSettings = config.params_as("Pace").unwrap();
        assert_eq!(settings, PaceSettings { speed: 7, label: String::new() });

        let empty: PaceSettings = FeatureConfiguration::default().params_as("Pace").unwrap();
        assert_eq!(empty, PaceSettings::default());
    }

    #[test]
    fn bad_params_are_invalid_configuration() {
        let config = FeatureConfiguration::with_params(
            "PaceConfiguration",
            serde_json::json!({"speed": "fast"}),
        );
        let result: Result<PaceSettings> = config.params_as("Pace");
        assert!(matches!(result, Err(KernelError::InvalidConfiguration { .. })));
    }

    #[test]
    fn entity_config_reads_from_json_with_defaults() {
        let config: EntityConfig = serde_json::from_str(
            r#"{
                "name": "scout",
                "force": "RED",
                "features": [{"name": "Pace", "major": 1}],
                "configurations": {"Pace": {"kind": "PaceConfiguration"}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.name, "scout");
        assert_eq!(config.force, Force::Red);
        assert_eq!(config.seed, 0);
        assert_eq!(config.features, vec![FeatureSpecification::named("Pace", 1, 0)]);
        assert_eq!(config.configurations["Pace"].kind, "PaceConfiguration");
        assert!(config.layer.is_none());
    }
}
