// Plugin discovery and version matching.
//
// Implementations are found through two kinds of source, scanned in a fixed
// order:
// 1. the explicit `FeatureRegistry` handed to the loader (manual
//    registration, used for deterministic and test setups);
// 2. the `ModuleLayer` chain: the loader's own layer first, then each
//    ancestor up to the root.
//
// A `PluginModule` is the unit of discovery: a named bundle of
// `FeatureFactory` entries plus the capabilities it declares (exports and
// requires, reported for diagnostics only). A `ModuleCatalog` holds every
// module the process knows about; a `ModuleLayer` exposes a subset of them,
// so different entities can sandbox different plugin sets or versions.
//
// Matching works on `FeatureDescriptor`s alone. Only the winning factory is
// ever invoked.
//
// See also: `specification.rs` for the satisfaction rule,
// `resolver.rs` for the caller, `config.rs` for `ModuleLayerDefinition`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use crate::config::{KernelConfig, ModuleLayerDefinition};
use crate::error::{KernelError, Result};
use crate::feature::{Feature, FeatureRef};
use crate::specification::{FeatureDescriptor, FeatureSpecification};

// ---------------------------------------------------------------------------
// Factories
// ---------------------------------------------------------------------------

type BuildFn = Arc<dyn Fn() -> FeatureRef + Send + Sync>;

/// Static identity of an implementation plus the constructor that makes one.
#[derive(Clone)]
pub struct FeatureFactory {
    descriptor: FeatureDescriptor,
    build: BuildFn,
}

impl FeatureFactory {
    pub fn new(
        descriptor: FeatureDescriptor,
        build: impl Fn() -> FeatureRef + Send + Sync + 'static,
    ) -> Self {
        Self {
            descriptor,
            build: Arc::new(build),
        }
    }

    pub fn of<T: FeatureProvider>() -> Self {
        Self::new(T::descriptor(), || -> FeatureRef { Arc::new(T::create()) })
    }

    pub fn descriptor(&self) -> &FeatureDescriptor {
        &self.descriptor
    }

    pub fn instantiate(&self) -> FeatureRef {
        (self.build)()
    }
}

impl fmt::Debug for FeatureFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FeatureFactory({} {} by {})",
            self.descriptor.name,
            self.descriptor.version,
            self.descriptor.implementation.name()
        )
    }
}

/// A feature type that can be registered by type alone.
pub trait FeatureProvider: Feature + Sized {
    fn descriptor() -> FeatureDescriptor;
    fn create() -> Self;
}

/// Manually registered implementations. Passed by value; no global state.
#[derive(Clone, Debug, Default)]
pub struct FeatureRegistry {
    factories: Vec<FeatureFactory>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A second factory with the same implementing type,
    /// name, and version is ignored.
    pub fn register(&mut self, factory: FeatureFactory) {
        let d = &factory.descriptor;
        if self.factories.iter().any(|f| {
            f.descriptor.implementation == d.implementation
                && f.descriptor.name == d.name
                && f.descriptor.version == d.version
        }) {
            log::debug!("{} {} already registered", d.name, d.version);
            return;
        }
        self.factories.push(factory);
    }

    pub fn register_type<T: FeatureProvider>(&mut self) {
        self.register(FeatureFactory::of::<T>());
    }

    pub fn with(mut self, factory: FeatureFactory) -> Self {
        self.register(factory);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureFactory> {
        self.factories.iter()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn clear(&mut self) {
        self.factories.clear();
    }
}

// ---------------------------------------------------------------------------
// Modules and layers
// ---------------------------------------------------------------------------

/// A named bundle of factories and declared capabilities.
#[derive(Clone, Debug, Default)]
pub struct PluginModule {
    pub name: String,
    pub exports: Vec<String>,
    pub requires: Vec<String>,
    pub factories: Vec<FeatureFactory>,
}

impl PluginModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn exporting(mut self, export: impl Into<String>) -> Self {
        self.exports.push(export.into());
        self
    }

    pub fn requiring(mut self, module: impl Into<String>) -> Self {
        self.requires.push(module.into());
        self
    }

    pub fn providing(mut self, factory: FeatureFactory) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn providing_type<T: FeatureProvider>(self) -> Self {
        self.providing(FeatureFactory::of::<T>())
    }
}

/// Every module known to the process.
#[derive(Clone, Debug, Default)]
pub struct ModuleCatalog {
    modules: BTreeMap<String, Arc<PluginModule>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module, replacing any module of the same name.
    pub fn add(&mut self, module: PluginModule) {
        self.modules.insert(module.name.clone(), Arc::new(module));
    }

    pub fn with(mut self, module: PluginModule) -> Self {
        self.add(module);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<PluginModule>> {
        self.modules.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }
}

/// An isolated loading context exposing a fixed set of modules, plus
/// whatever its ancestors expose.
#[derive(Debug)]
pub struct ModuleLayer {
    name: String,
    modules: Vec<Arc<PluginModule>>,
    parent: Option<Arc<ModuleLayer>>,
}

impl ModuleLayer {
    /// A root layer exposing nothing.
    pub fn empty(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            modules: Vec::new(),
            parent: None,
        })
    }

    pub fn new(
        name: impl Into<String>,
        modules: Vec<Arc<PluginModule>>,
        parent: Option<Arc<ModuleLayer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            modules,
            parent,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<ModuleLayer>> {
        self.parent.as_ref()
    }

    pub fn modules(&self) -> &[Arc<PluginModule>] {
        &self.modules
    }

    /// This layer, then each ancestor.
    pub fn chain(&self) -> impl Iterator<Item = &ModuleLayer> {
        std::iter::successors(Some(self), |layer| layer.parent.as_deref())
    }

    /// Look a module up in this layer, then its ancestors.
    pub fn find_module(&self, name: &str) -> Option<&Arc<PluginModule>> {
        self.chain()
            .flat_map(|layer| layer.modules.iter())
            .find(|m| m.name == name)
    }

    /// Every `(module, factory)` visible from this layer, child first.
    pub fn factories(&self) -> impl Iterator<Item = (&PluginModule, &FeatureFactory)> {
        self.chain()
            .flat_map(|layer| layer.modules.iter())
            .flat_map(|m| m.factories.iter().map(move |f| (&**m, f)))
    }

    /// Module listing of this layer and its ancestors.
    pub fn report(&self, prefix: &str) -> String {
        let mut out = String::new();
        let mut label = prefix.to_string();
        for layer in self.chain() {
            let _ = writeln!(out, "{label} ({}) contains:", layer.name);
            if layer.modules.is_empty() {
                let _ = writeln!(out, "    layer is empty");
            }
            for m in &layer.modules {
                let _ = writeln!(out, "    {}", m.name);
            }
            label.push_str("->parent");
        }
        out
    }
}

/// Build the layer for `definition` on top of `parent`.
///
/// With no definition, or one naming no modules, `parent` itself is reused.
/// Otherwise the new layer exposes exactly the named modules and inherits
/// the parent's.
pub fn make_module_layer(
    parent: &Arc<ModuleLayer>,
    definition: Option<&ModuleLayerDefinition>,
    catalog: &ModuleCatalog,
) -> Result<Arc<ModuleLayer>> {
    let Some(definition) = definition.filter(|d| !d.modules.is_empty()) else {
        log::info!("reusing module layer '{}'", parent.name());
        return Ok(Arc::clone(parent));
    };
    let layer_name = if definition.name.is_empty() {
        format!("{}/child", parent.name())
    } else {
        definition.name.clone()
    };
    let modules = definition
        .modules
        .iter()
        .map(|name| {
            catalog
                .get(name)
                .cloned()
                .ok_or_else(|| KernelError::UnknownModule {
                    layer: layer_name.clone(),
                    module: name.clone(),
                })
        })
        .collect::<Result<Vec<_>>>()?;
    log::info!(
        "creating module layer '{layer_name}' over '{}' with modules {:?}",
        parent.name(),
        definition.modules
    );
    Ok(ModuleLayer::new(layer_name, modules, Some(Arc::clone(parent))))
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Whether `candidate` satisfies a name/version request. An empty `name`
/// matches any name.
pub fn meets_requirements(
    candidate: &FeatureDescriptor,
    name: &str,
    major: u32,
    minor: u32,
    exact: bool,
) -> bool {
    let names_ok = name.is_empty() || candidate.name == name;
    let have = candidate.version;
    if exact {
        names_ok && have.major == major && have.minor == minor
    } else {
        names_ok && (have.major > major || (have.major == major && have.minor >= minor))
    }
}

/// Rank two candidates. `Less` means `a` is preferred (higher version).
pub fn compare_versions(a: &FeatureDescriptor, b: &FeatureDescriptor) -> Ordering {
    b.version.cmp(&a.version)
}

/// Scan `candidates` for the best match for `spec`, starting from
/// `best_so_far`. An exact request takes the first hit, including one
/// already in `best_so_far`; otherwise the highest version wins and ties keep
/// the earlier candidate.
pub fn find_best_match<'a>(
    candidates: impl IntoIterator<Item = &'a FeatureFactory>,
    best_so_far: Option<&'a FeatureFactory>,
    spec: &FeatureSpecification,
) -> Option<&'a FeatureFactory> {
    if spec.exact && best_so_far.is_some() {
        return best_so_far;
    }
    let mut selected = best_so_far;
    for candidate in candidates {
        let d = candidate.descriptor();
        let type_ok = spec.implementation.is_none_or(|t| t == d.implementation);
        if !(type_ok && meets_requirements(d, &spec.name, spec.major, spec.minor, spec.exact)) {
            continue;
        }
        if spec.exact {
            return Some(candidate);
        }
        selected = match selected {
            Some(s) if compare_versions(s.descriptor(), d) != Ordering::Greater => Some(s),
            _ => Some(candidate),
        };
    }
    selected
}

// ---------------------------------------------------------------------------
// FeatureLoader
// ---------------------------------------------------------------------------

/// Finds and instantiates implementations for specifications.
#[derive(Clone, Debug)]
pub struct FeatureLoader {
    registry: FeatureRegistry,
    layer: Arc<ModuleLayer>,
    catalog: Arc<ModuleCatalog>,
}

impl FeatureLoader {
    pub fn new(registry: FeatureRegistry, layer: Arc<ModuleLayer>, catalog: Arc<ModuleCatalog>) -> Self {
        Self {
            registry,
            layer,
            catalog,
        }
    }

    /// A loader that only knows the explicit registry.
    pub fn from_registry(registry: FeatureRegistry) -> Self {
        Self::new(registry, ModuleLayer::empty("root"), Arc::new(ModuleCatalog::new()))
    }

    /// The entry-point loader: root layer built from the installed
    /// `KernelConfig`.
    pub fn from_kernel_config(registry: FeatureRegistry, catalog: ModuleCatalog) -> Result<Self> {
        let boot = ModuleLayer::empty("boot");
        let root = make_module_layer(&boot, KernelConfig::global().root_layer.as_ref(), &catalog)?;
        Ok(Self::new(registry, root, Arc::new(catalog)))
    }

    /// A loader sharing this one's registry and catalog, scoped to the layer
    /// `definition` describes on top of this loader's layer.
    pub fn scoped(&self, definition: Option<&ModuleLayerDefinition>) -> Result<Self> {
        let layer = make_module_layer(&self.layer, definition, &self.catalog)?;
        Ok(Self::new(self.registry.clone(), layer, Arc::clone(&self.catalog)))
    }

    pub fn registry(&self) -> &FeatureRegistry {
        &self.registry
    }

    pub fn layer(&self) -> &Arc<ModuleLayer> {
        &self.layer
    }

    pub fn catalog(&self) -> &ModuleCatalog {
        &self.catalog
    }

    /// The best factory for `spec`: registry first, then the layer chain.
    pub fn find(&self, spec: &FeatureSpecification) -> Option<&FeatureFactory> {
        let mut best = find_best_match(self.registry.iter(), None, spec);
        for layer in self.layer.chain() {
            let candidates = layer.modules.iter().flat_map(|m| m.factories.iter());
            best = find_best_match(candidates, best, spec);
        }
        best
    }

    /// Instantiate the best implementation of `spec`, if any.
    pub fn load(&self, spec: &FeatureSpecification) -> Option<FeatureRef> {
        let factory = self.find(spec)?;
        log::debug!(
            "loading {} {} for {spec}",
            factory.descriptor.name,
            factory.descriptor.version
        );
        Some(factory.instantiate())
    }

    /// Every discoverable implementation, with its origin.
    pub fn service_report(&self) -> String {
        let mut out = String::from("Found implementations of 'Feature'\n");
        for factory in self.registry.iter() {
            write_entry(&mut out, factory, None);
        }
        for (module, factory) in self.layer.factories() {
            write_entry(&mut out, factory, Some(module));
        }
        out
    }

    /// Operator-facing diagnostic for a failed load of `spec`.
    pub fn help_with(&self, spec: &FeatureSpecification) -> String {
        format!(
            "Failed to load the specified feature: '{spec}'\n\
             Check:\n\
             1. The module providing it is in the catalog and is named by the\n   \
                module layer definition of the entity or of the kernel configuration.\n\
             2. The module lists a factory whose descriptor has the requested\n   \
                name and a compatible version.\n\
             3. Or the factory is registered with the feature registry given\n   \
                to the loader.\n\n\
             {}\n{}",
            self.layer.report("Layer"),
            self.service_report()
        )
    }
}

fn write_entry(out: &mut String, factory: &FeatureFactory, module: Option<&PluginModule>) {
    let d = factory.descriptor();
    let _ = writeln!(out, "{} {}", d.name, d.version);
    let _ = writeln!(out, "    Implemented by: {}", d.implementation.name());
    let _ = writeln!(
        out,
        "    Found in Module: {}",
        module.map_or("UNNAMED", |m| m.name.as_str())
    );
    let Some(module) = module else {
        return;
    };
    let _ = writeln!(out, "    Module exports:");
    for export in &module.exports {
        let _ = writeln!(out, "        {export}");
    }
    let _ = writeln!(out, "    Module requires:");
    for required in &module.requires {
        let _ = writeln!(out, "        {required}");
    }
}
