// Entity: one simulation participant and its message queues.
//
// An `Entity` owns:
// - an `EntityHandle`, the only thing other entities ever see;
// - the receiving end of the handle's `mpsc` mailbox;
// - the inbound `InboundQueue`, touched only by this entity's own thread;
// - an outbound `VecDeque`, drained by the scheduler via `take_outbound`;
// - the `FeatureManager` holding the wired feature graph;
// - a `SimRng` seeded from the configured seed (or the entity id).
//
// Lifecycle: `new` resolves and wires every feature, `init` runs once, then
// the scheduler alternates `process_messages` / `run_agents` with delivery of
// the outbound queue. The mailbox is absorbed into the inbound queue at the
// start of both, so cross-thread producers never touch the priority queue.
//
// Routing of every produced message:
// - nowhere destination: dropped;
// - internal destination, or one naming this entity: inbound queue, so an
//   internal chain runs in the same tick when due;
// - anything else: outbound queue.
//
// A handler error never escapes `process_messages`. It is logged and turned
// into exactly one error response to the failed message's respond-to.
//
// See also: `manager.rs` for dispatch, `registry.rs` for delivery of the
// outbound queue.
//
// **Critical constraint: determinism.** Processing order is the inbound
// queue order (`message::compare_for_queue`); the only randomness is the
// seeded `SimRng`.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver};

use muster_prng::SimRng;

use crate::address::{Address, EntityHandle};
use crate::config::EntityConfig;
use crate::error::{KernelError, Result};
use crate::loader::FeatureLoader;
use crate::manager::FeatureManager;
use crate::message::{ErrorReport, InboundQueue, Message};
use crate::processing::ProcessingResult;
use crate::types::{ContentKind, EntityId, Force, IdBlock, NEVER, SimTime};

pub struct Entity {
    handle: EntityHandle,
    mailbox: Receiver<Message>,
    inbound: InboundQueue,
    outbound: VecDeque<Message>,
    features: FeatureManager,
    seed: u64,
    rng: SimRng,
    initialized: bool,
}

enum Route {
    Drop,
    Inbound,
    Outbound,
}

impl Entity {
    /// Build a user entity, resolving every configured feature.
    pub fn new(config: EntityConfig, loader: &FeatureLoader) -> Result<Self> {
        Self::build(config, loader, IdBlock::User)
    }

    /// Build an infrastructure entity with an id from the system block.
    pub fn system(config: EntityConfig, loader: &FeatureLoader) -> Result<Self> {
        Self::build(config, loader, IdBlock::System)
    }

    fn build(config: EntityConfig, loader: &FeatureLoader, block: IdBlock) -> Result<Self> {
        let EntityConfig {
            name,
            path,
            force,
            seed,
            features,
            configurations,
            layer,
        } = config;

        let id = block.allocate()?;
        let name = if name.is_empty() {
            format!("entity-{id}")
        } else {
            name
        };
        let path = if path.is_empty() { name.clone() } else { path };
        let seed = if seed == 0 { id.0 } else { seed };

        let (tx, rx) = mpsc::channel();
        let handle = EntityHandle::new(id, name, path, force, tx);
        log::debug!("building entity {} ({id}, {force})", handle.path_and_name());

        let mut rng = SimRng::new(seed);
        let scoped = loader.scoped(layer.as_ref())?;
        let features =
            FeatureManager::new(&handle, &scoped, &features, &configurations, rng.sub_seed())?;

        Ok(Self {
            handle,
            mailbox: rx,
            inbound: InboundQueue::new(),
            outbound: VecDeque::new(),
            features,
            seed,
            rng,
            initialized: false,
        })
    }

    /// Re-seed, initialize every feature, and open the mailbox. Runs once.
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            log::trace!("{} already initialized", self.handle.path());
            return Ok(());
        }
        log::trace!("initializing entity {}", self.handle.path());
        self.rng.reseed(self.seed);
        self.features.init()?;
        self.handle.mark_initialized();
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn check_init(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(KernelError::not_initialized(format!(
                "entity {}",
                self.handle.path_and_name()
            )))
        }
    }

    // -- input ----------------------------------------------------------------

    /// Enqueue a message from the owning thread.
    pub fn receive(&mut self, message: Message) -> Result<()> {
        self.check_init()?;
        self.inbound.push(message);
        log::trace!(
            "{} received message, queue length {}",
            self.handle.name(),
            self.inbound.len()
        );
        Ok(())
    }

    fn absorb_mailbox(&mut self) {
        for message in self.mailbox.try_iter() {
            self.inbound.push(message);
        }
    }

    // -- processing -----------------------------------------------------------

    /// Dispatch every message due at `now`, including ones produced along the
    /// way. Returns the next wake time.
    pub fn process_messages(&mut self, now: SimTime) -> Result<SimTime> {
        self.check_init()?;
        self.absorb_mailbox();
        log::trace!("{} starting tick at {now}", self.handle.path());

        while let Some(message) = self.inbound.pop_due(now) {
            log::trace!("{} processing {} at {now}", self.handle.path(), message.sequence());
            match self.features.process(&message, now) {
                Ok(result) => self.route(result),
                Err(e) => {
                    log::error!("entity {}: {e}", self.handle.name());
                    let description = format!(
                        "entity {}: error at time {now} ms, processing message {}",
                        self.handle.name(),
                        message.sequence()
                    );
                    self.send_error_response(
                        message.sequence(),
                        description,
                        Some(e.to_string()),
                        message.respond_to(),
                    );
                }
            }
        }
        Ok(self.next_wake_time(now))
    }

    /// Tick every agent and route what they produce. Returns the next wake
    /// time.
    pub fn run_agents(&mut self, now: SimTime) -> Result<SimTime> {
        self.check_init()?;
        self.absorb_mailbox();
        let result = self.features.run_all_agents(now)?;
        self.route(result);
        Ok(self.next_wake_time(now))
    }

    fn route(&mut self, result: ProcessingResult) {
        for message in result.into_messages() {
            let destination = message.destination();
            let route = if destination.is_nowhere() {
                Route::Drop
            } else {
                match destination.entity() {
                    None => Route::Inbound,
                    Some(handle) if *handle == self.handle => Route::Inbound,
                    Some(_) => Route::Outbound,
                }
            };
            match route {
                Route::Drop => {
                    log::trace!(
                        "in {}, dropping message to nowhere from {}",
                        self.handle.name(),
                        message.source()
                    );
                }
                Route::Inbound => {
                    log::trace!(
                        "in {}, submitting local message from {} to {}",
                        self.handle.name(),
                        message.source(),
                        message.destination()
                    );
                    self.inbound.push(message);
                }
                Route::Outbound => {
                    log::trace!(
                        "in {}, submitting message from {} to {}",
                        self.handle.name(),
                        message.source(),
                        message.destination()
                    );
                    self.outbound.push_back(message);
                }
            }
        }
    }

    /// Head event time, `now` when a non-event is still pending, `NEVER` when
    /// the queue is empty.
    fn next_wake_time(&self, now: SimTime) -> SimTime {
        match self.inbound.peek() {
            None => NEVER,
            Some(head) => head.scheduled_time().unwrap_or(now),
        }
    }

    /// Scheduled time of the inbound head if it is an event, else `NEVER`.
    pub fn next_event_time(&self) -> SimTime {
        self.inbound.next_event_time().unwrap_or(NEVER)
    }

    /// Queue an error response on the outbound queue. Dropped when
    /// `destination` is nowhere.
    pub fn send_error_response(
        &mut self,
        id: u64,
        description: impl Into<String>,
        cause: Option<String>,
        destination: &Address,
    ) {
        let report = ErrorReport {
            description: description.into(),
            cause,
        };
        if destination.is_nowhere() {
            log::trace!(
                "{} dropping error response to nowhere: {}",
                self.handle.name(),
                report.description
            );
            return;
        }
        let message = Message::error(
            self.handle.next_sequence(),
            id,
            report,
            Address::external(&self.handle),
            destination.clone(),
        );
        log::trace!("{} sending {message:?}", self.handle.name());
        self.outbound.push_back(message);
    }

    // -- output ---------------------------------------------------------------

    /// Drain the inbound queue in processing order.
    pub fn take_inbound(&mut self) -> Result<Vec<Message>> {
        self.check_init()?;
        self.absorb_mailbox();
        Ok(self.inbound.drain_all())
    }

    /// Drain the outbound queue in production order.
    pub fn take_outbound(&mut self) -> Result<Vec<Message>> {
        self.check_init()?;
        Ok(self.outbound.drain(..).collect())
    }

    pub fn inbound_depth(&self) -> usize {
        self.inbound.len()
    }

    // -- queries --------------------------------------------------------------

    pub fn can_handle(&self, kind: ContentKind) -> bool {
        let ok = self.features.can_handle(kind);
        if !ok {
            log::warn!(
                "entity {} can't process messages of type {kind}, no handler for that type was configured",
                self.handle.name()
            );
        }
        ok
    }

    pub fn generate_sequence_number(&self) -> u64 {
        self.handle.next_sequence()
    }

    pub fn handle(&self) -> &EntityHandle {
        &self.handle
    }

    pub fn id(&self) -> EntityId {
        self.handle.id()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn path(&self) -> &str {
        self.handle.path()
    }

    pub fn force(&self) -> Force {
        self.handle.force()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rng(&mut self) -> &mut SimRng {
        &mut self.rng
    }

    pub fn features(&self) -> &FeatureManager {
        &self.features
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("handle", &self.handle)
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound.len())
            .field("initialized", &self.initialized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureConfiguration;
    use crate::feature::{Delivery, Feature, FeatureCore, Handler};
    use crate::loader::{FeatureProvider, FeatureRegistry};
    use crate::message::MessageKind;
    use crate::specification::{FeatureDescriptor, FeatureSpecification};
    use crate::types::Version;

    #[derive(Debug)]
    struct Ping(u32);
    #[derive(Debug)]
    struct Pong(u32);
    #[derive(Debug)]
    struct Boom;
    #[derive(Debug)]
    struct Countdown(u32);

    /// Answers `Ping`, fails on `Boom`, and counts `Countdown` down through
    /// its own internal address.
    #[derive(Debug)]
    struct Relay {
        core: FeatureCore,
    }

    impl FeatureProvider for Relay {
        fn descriptor() -> FeatureDescriptor {
            FeatureDescriptor::new::<Relay>("Relay", Version::new(1, 0, 0))
        }

        fn create() -> Self {
            Self {
                core: FeatureCore::new(Self::descriptor()),
            }
        }
    }

    impl Feature for Relay {
        fn core(&self) -> &FeatureCore {
            &self.core
        }

        fn as_handler(&self) -> Option<&dyn Handler> {
            Some(self)
        }
    }

    impl Handler for Relay {
        fn content_handled(&self) -> Vec<ContentKind> {
            vec![
                ContentKind::of::<Ping>(),
                ContentKind::of::<Boom>(),
                ContentKind::of::<Countdown>(),
            ]
        }

        fn process(&self, delivery: &Delivery<'_>) -> Result<ProcessingResult> {
            if let Some(ping) = delivery.content.downcast_ref::<Ping>() {
                let reply = self.core.respond(Pong(ping.0), delivery.id, delivery.respond_to)?;
                return Ok(reply.into());
            }
            if delivery.content.is::<Boom>() {
                return Err(KernelError::processing(self.name(), "boom"));
            }
            let Countdown(n) = delivery.content_as::<Countdown>(self.name())?;
            if *n == 0 {
                let done = self.core.send(Pong(0), delivery.respond_to, &Address::nowhere())?;
                return Ok(done.into());
            }
            let next = self.core.send(
                Countdown(n - 1),
                &Address::internal("Relay"),
                delivery.respond_to,
            )?;
            Ok(next.into())
        }
    }

    fn loader() -> FeatureLoader {
        let mut registry = FeatureRegistry::new();
        registry.register_type::<Relay>();
        FeatureLoader::from_registry(registry)
    }

    fn relay_entity(name: &str) -> Entity {
        let config = EntityConfig::new(name)
            .with_feature(FeatureSpecification::named("Relay", 1, 0))
            .with_configuration("Relay", FeatureConfiguration::default());
        let mut entity = Entity::new(config, &loader()).unwrap();
        entity.init().unwrap();
        entity
    }

    fn action(from: &EntityHandle, to: &Entity, content: impl crate::message::Content) -> Message {
        Message::action(from, content, Address::external(to.handle()), Address::external(from))
    }

    #[test]
    fn construction_defaults_name_path_and_seed() {
        let entity = Entity::new(EntityConfig::default(), &loader()).unwrap();
        assert_eq!(entity.name(), format!("entity-{}", entity.id()));
        assert_eq!(entity.path(), entity.name());
        assert_eq!(entity.seed(), entity.id().0);
        assert!(entity.id().0 >= 10_000);
        assert_eq!(entity.force(), Force::Gray);

        let system = Entity::system(EntityConfig::new("ctl").with_seed(9), &loader()).unwrap();
        assert!(system.id().0 < 10_000);
        assert_eq!(system.seed(), 9);
    }

    #[test]
    fn operations_before_init_are_state_errors() {
        let mut entity = Entity::new(EntityConfig::new("cold"), &loader()).unwrap();
        let sender = EntityHandle::detached("s").unwrap();
        let msg = action(&sender, &entity, Ping(1));
        assert!(matches!(entity.receive(msg), Err(KernelError::NotInitialized { .. })));
        assert!(matches!(entity.process_messages(0), Err(KernelError::NotInitialized { .. })));
        assert!(matches!(entity.run_agents(0), Err(KernelError::NotInitialized { .. })));
        assert!(matches!(entity.take_outbound(), Err(KernelError::NotInitialized { .. })));
    }

    #[test]
    fn unknown_feature_fails_construction() {
        let config = EntityConfig::new("x").with_feature(FeatureSpecification::named("Nope", 1, 0));
        let err = Entity::new(config, &loader()).unwrap_err();
        assert!(matches!(err, KernelError::MissingImplementation { .. }));
    }

    #[test]
    fn reply_to_external_sender_goes_outbound() {
        let mut entity = relay_entity("relay");
        let sender = EntityHandle::detached("client").unwrap();
        entity.receive(action(&sender, &entity, Ping(7))).unwrap();

        assert_eq!(entity.process_messages(0).unwrap(), NEVER);
        let out = entity.take_outbound().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].destination(), &Address::external(&sender));
        let pong = out[0].content().and_then(|c| c.downcast_ref::<Pong>()).unwrap();
        assert_eq!(pong.0, 7);
    }

    #[test]
    fn handler_error_yields_one_error_response_and_processing_continues() {
        let mut entity = relay_entity("faulty");
        let sender = EntityHandle::detached("client").unwrap();
        let boom = action(&sender, &entity, Boom);
        let boom_id = boom.sequence();
        entity.receive(boom).unwrap();
        entity.receive(action(&sender, &entity, Ping(2))).unwrap();

        entity.process_messages(0).unwrap();
        let out = entity.take_outbound().unwrap();
        assert_eq!(out.len(), 2);
        let errors: Vec<&Message> = out.iter().filter(|m| m.is_error()).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].in_reply_to(), Some(boom_id));
        assert_eq!(errors[0].destination(), &Address::external(&sender));
        let report = errors[0].content().and_then(|c| c.downcast_ref::<ErrorReport>()).unwrap();
        assert!(report.cause.as_deref().is_some_and(|c| c.contains("boom")));
        assert!(out.iter().any(|m| matches!(m.kind(), MessageKind::Response { .. })));
    }

    #[test]
    fn error_response_to_nowhere_is_dropped() {
        let mut entity = relay_entity("quiet");
        let sender = EntityHandle::detached("client").unwrap();
        let boom = Message::action(&sender, Boom, Address::external(entity.handle()), Address::nowhere());
        entity.receive(boom).unwrap();
        entity.process_messages(0).unwrap();
        assert!(entity.take_outbound().unwrap().is_empty());
    }

    #[test]
    fn internal_chain_runs_in_the_same_tick() {
        let mut entity = relay_entity("chain");
        let sender = EntityHandle::detached("client").unwrap();
        entity.receive(action(&sender, &entity, Countdown(3))).unwrap();

        assert_eq!(entity.process_messages(0).unwrap(), NEVER);
        assert_eq!(entity.inbound_depth(), 0);
        let out = entity.take_outbound().unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].content().is_some_and(|c| c.is::<Pong>()));
    }

    #[test]
    fn future_events_wait_for_their_time() {
        let mut entity = relay_entity("clock");
        let sender = EntityHandle::detached("client").unwrap();
        let event = Message::event(&sender, Ping(1), 500, Address::external(entity.handle()), Address::external(&sender));
        entity.receive(event).unwrap();

        assert_eq!(entity.process_messages(100).unwrap(), 500);
        assert_eq!(entity.next_event_time(), 500);
        assert!(entity.take_outbound().unwrap().is_empty());

        assert_eq!(entity.process_messages(500).unwrap(), NEVER);
        assert_eq!(entity.take_outbound().unwrap().len(), 1);
    }

    #[test]
    fn mailbox_deliveries_are_absorbed_on_processing() {
        let mut entity = relay_entity("mailbox");
        let sender = EntityHandle::detached("client").unwrap();
        let handle = entity.handle().clone();
        let msg = action(&sender, &entity, Ping(4));
        std::thread::spawn(move || handle.deliver(msg).unwrap())
            .join()
            .unwrap();

        entity.process_messages(0).unwrap();
        assert_eq!(entity.take_outbound().unwrap().len(), 1);
    }

    #[test]
    fn unhandled_content_is_reported_back() {
        let mut entity = relay_entity("picky");
        let sender = EntityHandle::detached("client").unwrap();
        assert!(!entity.can_handle(ContentKind::of::<Pong>()));
        assert!(entity.can_handle(ContentKind::of::<Ping>()));
        entity.receive(action(&sender, &entity, Pong(1))).unwrap();
        entity.process_messages(0).unwrap();
        let out = entity.take_outbound().unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_error());
    }

    #[test]
    fn init_runs_once_and_reseeds() {
        let config = EntityConfig::new("seeded")
            .with_seed(31)
            .with_feature(FeatureSpecification::named("Relay", 1, 0))
            .with_configuration("Relay", FeatureConfiguration::default());
        let mut entity = Entity::new(config, &loader()).unwrap();
        // Construction already drew the manager's sub-seed.
        let drawn = entity.rng().next_u64();
        assert_ne!(drawn, SimRng::new(31).next_u64());

        entity.init().unwrap();
        let first = entity.rng().next_u64();
        assert_eq!(first, SimRng::new(31).next_u64());

        entity.init().unwrap();
        let second = entity.rng().next_u64();
        assert_ne!(first, second);
    }
}
