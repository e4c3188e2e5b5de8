// Process-wide kernel configuration. Kept in its own test binary because
// `KernelConfig::install` can succeed only once per process.

use muster_kernel::{
    Address, Entity, EntityConfig, EntityHandle, FeatureLoader, FeatureRegistry,
    FeatureSpecification, KernelConfig, Message,
};
use muster_tests::{Ping, Pong, echo_catalog, init_logging};

#[test]
fn installed_root_layer_drives_the_entry_point_loader() {
    init_logging();
    let config = KernelConfig::from_json(
        r#"{ "root_layer": { "name": "root", "modules": ["echo.v2", "echo.v1"] } }"#,
    )
    .unwrap();
    assert!(config.clone().install());
    assert!(!KernelConfig::default().install());
    assert_eq!(KernelConfig::global(), &config);

    let loader = FeatureLoader::from_kernel_config(FeatureRegistry::new(), echo_catalog()).unwrap();
    assert_eq!(loader.layer().name(), "root");
    assert_eq!(loader.layer().parent().map(|p| p.name()), Some("boot"));

    let spec = FeatureSpecification::named("Echo", 1, 0);
    let mut entity = Entity::new(EntityConfig::new("echo").with_feature(spec), &loader).unwrap();
    entity.init().unwrap();

    let client = EntityHandle::detached("client").unwrap();
    let ping = Message::action(&client, Ping(3), Address::external(entity.handle()), Address::external(&client));
    entity.receive(ping).unwrap();
    entity.process_messages(0).unwrap();
    let out = entity.take_outbound().unwrap();
    let pong = out[0].content().and_then(|c| c.downcast_ref::<Pong>()).unwrap();
    assert_eq!(pong.responder, "Echo 2.1.0");
}

#[test]
fn malformed_kernel_config_is_rejected() {
    let err = KernelConfig::from_json(r#"{ "root_layer": 5 }"#).unwrap_err();
    assert!(matches!(err, muster_kernel::KernelError::InvalidConfiguration { .. }));
}
