// Plugin discovery through module layers, version selection, and cyclic
// requirement graphs, observed through fully built entities.

use std::sync::Arc;

use muster_kernel::{
    Address, Entity, EntityConfig, EntityHandle, FeatureLoader, FeatureRegistry,
    FeatureSpecification, KernelError, Message, ModuleLayer, ModuleLayerDefinition, downcast_feature,
};
use muster_tests::{Left, Ping, Pong, Right, echo_catalog, init_logging, standard_registry};

fn layered_loader(registry: FeatureRegistry) -> FeatureLoader {
    FeatureLoader::new(registry, ModuleLayer::empty("root"), Arc::new(echo_catalog()))
}

/// Ask the entity's Echo who it is.
fn responder(entity: &mut Entity) -> String {
    let client = EntityHandle::detached("client").unwrap();
    let ping = Message::action(
        &client,
        Ping(1),
        Address::external(entity.handle()),
        Address::external(&client),
    );
    entity.receive(ping).unwrap();
    entity.process_messages(0).unwrap();
    let out = entity.take_outbound().unwrap();
    out[0]
        .content()
        .and_then(|c| c.downcast_ref::<Pong>())
        .map(|p| p.responder.clone())
        .unwrap()
}

fn echo_entity(loader: &FeatureLoader, spec: FeatureSpecification, layer: Option<ModuleLayerDefinition>) -> muster_kernel::Result<Entity> {
    let mut config = EntityConfig::new("echo").with_feature(spec);
    config.layer = layer;
    let mut entity = Entity::new(config, loader)?;
    entity.init()?;
    Ok(entity)
}

#[test]
fn registry_only_loader_uses_the_registered_version() {
    init_logging();
    let loader = FeatureLoader::from_registry(standard_registry());
    let mut entity = echo_entity(&loader, FeatureSpecification::named("Echo", 1, 0), None).unwrap();
    assert_eq!(responder(&mut entity), "Echo 1.0.0");
}

#[test]
fn entity_layer_offers_newer_versions() {
    init_logging();
    let loader = layered_loader(standard_registry());
    let layer = ModuleLayerDefinition::new("modern", ["echo.v2", "echo.v1"]);
    let mut entity =
        echo_entity(&loader, FeatureSpecification::named("Echo", 1, 0), Some(layer)).unwrap();
    assert_eq!(responder(&mut entity), "Echo 2.1.0");
}

#[test]
fn exact_request_takes_the_exact_version() {
    init_logging();
    let loader = layered_loader(FeatureRegistry::new());
    let layer = ModuleLayerDefinition::new("modern", ["echo.v2", "echo.v1"]);
    let mut entity =
        echo_entity(&loader, FeatureSpecification::exact("Echo", 1, 0), Some(layer)).unwrap();
    assert_eq!(responder(&mut entity), "Echo 1.0.0");
}

#[test]
fn layers_are_isolated_per_entity() {
    init_logging();
    let loader = layered_loader(FeatureRegistry::new());
    let modern = ModuleLayerDefinition::new("modern", ["echo.v2"]);
    let legacy = ModuleLayerDefinition::new("legacy", ["echo.legacy"]);

    let mut a = echo_entity(&loader, FeatureSpecification::named("Echo", 0, 1), Some(modern)).unwrap();
    let mut b = echo_entity(&loader, FeatureSpecification::named("Echo", 0, 1), Some(legacy)).unwrap();
    assert_eq!(responder(&mut a), "Echo 2.1.0");
    assert_eq!(responder(&mut b), "Echo 0.9.0");

    // Without a layer, nothing is visible.
    let err = echo_entity(&loader, FeatureSpecification::named("Echo", 0, 1), None).unwrap_err();
    assert!(matches!(err, KernelError::MissingImplementation { .. }));
}

#[test]
fn child_layer_sees_parent_modules() {
    init_logging();
    let base = layered_loader(FeatureRegistry::new())
        .scoped(Some(&ModuleLayerDefinition::new("base", ["echo.legacy"])))
        .unwrap();
    let child = ModuleLayerDefinition::new("child", ["echo.v1"]);

    let mut entity =
        echo_entity(&base, FeatureSpecification::exact("Echo", 0, 9), Some(child)).unwrap();
    assert_eq!(responder(&mut entity), "Echo 0.9.0");
    assert!(base.service_report().contains("echo.legacy"));
}

#[test]
fn unknown_module_fails_construction() {
    init_logging();
    let loader = layered_loader(FeatureRegistry::new());
    let layer = ModuleLayerDefinition::new("broken", ["echo.v1", "echo.v9"]);
    let err = echo_entity(&loader, FeatureSpecification::named("Echo", 1, 0), Some(layer)).unwrap_err();
    match err {
        KernelError::UnknownModule { layer, module } => {
            assert_eq!(layer, "broken");
            assert_eq!(module, "echo.v9");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn cyclic_requirements_resolve_to_one_instance_each() {
    init_logging();
    let loader = FeatureLoader::from_registry(standard_registry());
    let config = EntityConfig::new("cycle").with_feature(FeatureSpecification::named("Left", 1, 0));
    let mut entity = Entity::new(config, &loader).unwrap();
    entity.init().unwrap();

    let cache = entity.features().cache();
    assert_eq!(cache.len(), 2);
    let left = cache.features_of::<Left>().remove(0);
    let right = cache.features_of::<Right>().remove(0);

    let lefts_peer = left.peer().and_then(|f| downcast_feature::<Right>(&f)).unwrap();
    let rights_peer = right.peer().and_then(|f| downcast_feature::<Left>(&f)).unwrap();
    assert!(Arc::ptr_eq(&lefts_peer, &right));
    assert!(Arc::ptr_eq(&rights_peer, &left));
}
