// Recursive feature-graph wiring.
//
// The resolver turns a top-level `FeatureSpecification` into a fully wired
// feature: it loads the best implementation, fills each of its `Requirement`
// slots (loading dependencies as needed, recursively), attaches the owner
// handle, and configures every newly loaded feature with a derived sub-seed.
//
// All resolvers of one entity share one `FeatureCache`. A freshly loaded
// feature is inserted into the cache *before* its own requirements are
// resolved, so a cyclic graph (A needs B needs C needs A) finds the
// half-wired A on the way back around instead of recursing forever. Recursion
// depth is bounded by the true dependency depth.
//
// Cache lookup is first-match in insertion order, so the first cached
// feature satisfying a request always wins.
//
// See also: `loader.rs` for discovery and version ranking, `feature.rs` for
// requirement slots, `manager.rs` which owns the cache.
//
// **Critical constraint: determinism.** Sub-seeds are drawn from one
// `SimRng` seeded by the caller, in resolution order. Identical
// configurations and seeds give every feature the same seed on every run.

use std::collections::BTreeMap;
use std::sync::Arc;

use muster_prng::SimRng;

use crate::address::EntityHandle;
use crate::config::FeatureConfiguration;
use crate::error::{KernelError, Result};
use crate::feature::{Feature, FeatureRef, downcast_feature};
use crate::loader::FeatureLoader;
use crate::specification::FeatureSpecification;

// ---------------------------------------------------------------------------
// FeatureCache
// ---------------------------------------------------------------------------

/// Insertion-ordered `(identity, feature)` list.
#[derive(Clone, Debug, Default)]
pub struct FeatureCache {
    entries: Vec<(FeatureSpecification, FeatureRef)>,
}

impl FeatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first cached feature whose identity satisfies `spec`.
    pub fn find(&self, spec: &FeatureSpecification) -> Option<&FeatureRef> {
        self.entries
            .iter()
            .find(|(have, _)| spec.is_satisfied_by(have))
            .map(|(_, feature)| feature)
    }

    pub fn contains_key(&self, key: &FeatureSpecification) -> bool {
        self.entries.iter().any(|(have, _)| have == key)
    }

    /// Append `feature` under its own specification.
    pub fn insert(&mut self, feature: FeatureRef) {
        let key = feature.specification();
        log::trace!("caching {key} ({} entries before)", self.entries.len());
        self.entries.push((key, feature));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(FeatureSpecification, FeatureRef)> {
        self.entries.iter()
    }

    pub fn features(&self) -> impl Iterator<Item = &FeatureRef> {
        self.entries.iter().map(|(_, f)| f)
    }

    /// Every cached feature of concrete type `T`.
    pub fn features_of<T: Feature>(&self) -> Vec<Arc<T>> {
        self.features().filter_map(downcast_feature::<T>).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct Resolver<'a> {
    cache: &'a mut FeatureCache,
    configurations: &'a BTreeMap<String, FeatureConfiguration>,
    owner: EntityHandle,
    rng: SimRng,
    loader: &'a FeatureLoader,
}

impl<'a> Resolver<'a> {
    pub fn new(
        cache: &'a mut FeatureCache,
        configurations: &'a BTreeMap<String, FeatureConfiguration>,
        owner: &EntityHandle,
        seed: u64,
        loader: &'a FeatureLoader,
    ) -> Self {
        Self {
            cache,
            configurations,
            owner: owner.clone(),
            rng: SimRng::new(seed),
            loader,
        }
    }

    /// Return a cached feature satisfying `spec`, or load, wire, and
    /// configure a new one.
    pub fn load_and_resolve(&mut self, spec: &FeatureSpecification) -> Result<FeatureRef> {
        log::debug!("{} - loading and resolving for {spec}", self.owner.path());
        if let Some(cached) = self.cache.find(spec) {
            return Ok(Arc::clone(cached));
        }

        log::trace!("{} - feature not in cache, loading {spec}", self.owner.path());
        let Some(feature) = self.loader.load(spec) else {
            log::error!("{}", self.loader.help_with(spec));
            return Err(KernelError::MissingImplementation {
                owner: self.owner.path().to_string(),
                specification: spec.to_string(),
            });
        };
        self.cache.insert(Arc::clone(&feature));
        feature.core().attach_owner(&self.owner);
        self.resolve_dependencies(&feature)?;

        match self.configurations.get(feature.name()) {
            Some(config) => self.configure(&feature, config.clone())?,
            None => log::info!("no configuration was provided for {}", feature.name()),
        }
        Ok(feature)
    }

    /// Fill every empty requirement slot of `target`, loading and
    /// configuring dependencies that are not cached yet.
    pub fn resolve_dependencies(&mut self, target: &FeatureRef) -> Result<()> {
        let path = self.owner.path().to_string();
        log::trace!("{path}:{} - resolving requirements", target.name());
        for requirement in target.requirements() {
            if requirement.is_filled() {
                log::trace!(
                    "{path}:{} - skipping '{}', already set",
                    target.name(),
                    requirement.field()
                );
                continue;
            }
            let spec = requirement.specification();
            let dependency = match self.cache.find(spec) {
                Some(cached) => {
                    log::debug!(
                        "{path}:{}/{} found match in cache, reusing {spec}",
                        target.name(),
                        requirement.field()
                    );
                    Arc::clone(cached)
                }
                None => self.load_dependency(target, requirement.field(), spec)?,
            };
            log::debug!(
                "{} - injecting {} into '{}'",
                target.name(),
                dependency.name(),
                requirement.field()
            );
            requirement.fill(&dependency);
        }
        Ok(())
    }

    fn load_dependency(
        &mut self,
        target: &FeatureRef,
        field: &str,
        spec: &FeatureSpecification,
    ) -> Result<FeatureRef> {
        let path = self.owner.path().to_string();
        log::debug!("{path}:{}/{field} loading new instance of {spec}", target.name());
        let loaded = self
            .loader
            .load(spec)
            .ok_or_else(|| KernelError::UnresolvedRequirement {
                owner: path.clone(),
                feature: target.name().to_string(),
                requirement: field.to_string(),
                specification: spec.identifier(),
            })?;

        self.cache.insert(Arc::clone(&loaded));
        log::trace!(
            "{path}:{} - recursing into {} ({} cached)",
            target.name(),
            loaded.name(),
            self.cache.len()
        );
        self.resolve_dependencies(&loaded)?;

        loaded.core().attach_owner(&self.owner);
        let config = match self.configurations.get(loaded.name()) {
            Some(config) => config.clone(),
            None => {
                log::debug!(
                    "{path}:{} - no configuration provided for {}, using default",
                    target.name(),
                    loaded.name()
                );
                FeatureConfiguration::default_for(loaded.configuration_kind())
            }
        };
        self.configure(&loaded, config)?;
        Ok(loaded)
    }

    /// Check the configuration kind, stamp a fresh sub-seed, and configure.
    fn configure(&mut self, feature: &FeatureRef, mut config: FeatureConfiguration) -> Result<()> {
        config.check_kind(feature.name(), feature.configuration_kind())?;
        config.seed = self.rng.sub_seed();
        log::trace!("configuring {} with seed {}", feature.name(), config.seed);
        feature.configure(&config)
    }

    pub fn owner(&self) -> &EntityHandle {
        &self.owner
    }
}
