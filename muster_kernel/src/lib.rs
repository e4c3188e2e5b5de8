// muster_kernel: discrete-event, message-driven entity kernel.
//
// Entities exchange typed messages, process them in a deterministic order,
// and host pluggable features that are discovered, version-matched, and wired
// together at construction time.
//
// Module overview (leaf-first):
// - `types.rs`:         SimTime, EntityId + id blocks, Force, Version, ContentKind.
// - `error.rs`:         KernelError, the single error type of the crate.
// - `address.rs`:       EntityHandle (narrow shared view of an entity) and Address.
// - `message.rs`:       Message model, content payloads, queue ordering, InboundQueue.
// - `processing.rs`:    ProcessingResult, the output of one dispatch or tick.
// - `specification.rs`: FeatureSpecification / FeatureDescriptor and satisfaction rules.
// - `config.rs`:        FeatureConfiguration, EntityConfig, KernelConfig, layer definitions.
// - `feature.rs`:       Feature / Handler / Agent contracts, FeatureCore, Requirement slots.
// - `loader.rs`:        Factory tables, module layers, version matching, diagnostics.
// - `resolver.rs`:      Recursive, cycle-safe dependency wiring over a shared cache.
// - `manager.rs`:       FeatureManager: per-entity dispatch and agent ticking.
// - `entity.rs`:        Entity: inbound/outbound queues, processing, routing.
// - `registry.rs`:      EntityRegistry: handle lookup and outbound delivery.
//
// **Critical constraint: determinism.** Given identical configuration, seed,
// and inputs, every entity processes the same messages in the same order and
// hands the same seeds to its features. Randomness comes only from
// `muster_prng::SimRng`; message order comes only from `message::compare_for_queue`.

pub mod address;
pub mod config;
pub mod entity;
pub mod error;
pub mod feature;
pub mod loader;
pub mod manager;
pub mod message;
pub mod processing;
pub mod registry;
pub mod resolver;
pub mod specification;
pub mod types;

pub use muster_prng as prng;

pub use address::{Address, EntityHandle};
pub use config::{EntityConfig, FeatureConfiguration, KernelConfig, ModuleLayerDefinition};
pub use entity::Entity;
pub use error::{KernelError, Result};
pub use feature::{
    Agent, Delivery, Feature, FeatureCore, FeatureRef, Handler, Requirement, downcast_feature,
};
pub use loader::{
    FeatureFactory, FeatureLoader, FeatureProvider, FeatureRegistry, ModuleCatalog, ModuleLayer,
    PluginModule,
};
pub use manager::FeatureManager;
pub use message::{Content, ErrorReport, InboundQueue, Message, MessageKind, Payload};
pub use processing::ProcessingResult;
pub use registry::EntityRegistry;
pub use resolver::{FeatureCache, Resolver};
pub use specification::{FeatureDescriptor, FeatureSpecification, ImplementationType};
pub use types::{ContentKind, EntityId, Force, IdBlock, NEVER, SimTime, Version};
