// Feature, Handler, and Agent contracts.
//
// Three layered capability traits:
// - `Feature`: a named, versioned, configurable unit hosted by one entity.
// - `Handler`: a feature that processes specific message content kinds.
// - `Agent`: a handler that is additionally ticked once per simulation step.
//
// Implementations embed a `FeatureCore`, which carries the static descriptor,
// the owner handle (attached once by the resolver or feature manager), and the
// configured/initialized flags. Features are shared as `Arc<dyn Feature>`, so
// any mutable state a feature keeps uses interior mutability.
//
// Dependencies are declared as explicit `Requirement` slots returned from
// `Feature::requirements()`. The resolver fills each slot with a `Weak`
// reference to the resolved feature; the strong references live in the
// owning feature manager's cache, which keeps cyclic graphs (A needs B needs
// A) from leaking.
//
// See also: `resolver.rs` for how requirement slots are filled,
// `manager.rs` for dispatch to handlers and agent ticking.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::address::{Address, EntityHandle};
use crate::config::FeatureConfiguration;
use crate::error::{KernelError, Result};
use crate::message::{Content, ErrorReport, Message, MessageKind, payload};
use crate::processing::ProcessingResult;
use crate::specification::{FeatureDescriptor, FeatureSpecification};
use crate::types::{ContentKind, SimTime, Version};

/// Shared handle to a resolved feature.
pub type FeatureRef = Arc<dyn Feature>;

/// Downcasting support for trait objects.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Recover the concrete type of a resolved feature.
pub fn downcast_feature<T: Feature>(feature: &FeatureRef) -> Option<Arc<T>> {
    Arc::clone(feature).into_any_arc().downcast::<T>().ok()
}

// ---------------------------------------------------------------------------
// FeatureCore
// ---------------------------------------------------------------------------

/// Identity and lifecycle state shared by every feature implementation.
pub struct FeatureCore {
    descriptor: FeatureDescriptor,
    owner: OnceLock<EntityHandle>,
    configured: AtomicBool,
    initialized: AtomicBool,
}

impl FeatureCore {
    pub fn new(descriptor: FeatureDescriptor) -> Self {
        log::trace!("created {} {}", descriptor.name, descriptor.version);
        Self {
            descriptor,
            owner: OnceLock::new(),
            configured: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn descriptor(&self) -> &FeatureDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn version(&self) -> Version {
        self.descriptor.version
    }

    /// Attach the owning entity. The first attachment sticks.
    pub fn attach_owner(&self, owner: &EntityHandle) {
        if self.owner.set(owner.clone()).is_err() {
            log::trace!("{} already owned, keeping existing owner", self.descriptor.name);
        }
    }

    pub fn owner(&self) -> Result<&EntityHandle> {
        self.owner.get().ok_or_else(|| KernelError::OwnerMissing {
            feature: self.descriptor.name.clone(),
        })
    }

    pub fn mark_configured(&self) {
        self.configured.store(true, Ordering::SeqCst);
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn init(&self) -> Result<()> {
        if self.descriptor.requires_configuration && !self.is_configured() {
            let owner = self
                .owner
                .get()
                .map_or_else(|| "Unknown".to_string(), |o| o.path().to_string());
            return Err(KernelError::NotConfigured {
                owner,
                feature: self.descriptor.name.clone(),
            });
        }
        self.initialized.store(true, Ordering::SeqCst);
        log::trace!("{} initialized", self.descriptor.name);
        Ok(())
    }

    /// The owner's address for this feature, used as the source of every
    /// message it builds.
    pub fn address(&self) -> Result<Address> {
        Ok(Address::new(self.owner()?, self.descriptor.name.clone()))
    }

    /// `path[name|id][feature]`, for log lines.
    pub fn info_string(&self) -> String {
        match self.owner.get() {
            Some(o) => format!("{}[{}|{}][{}]", o.path(), o.name(), o.id(), self.descriptor.name),
            None => format!("null[null|-][{}]", self.descriptor.name),
        }
    }

    // -- message builders ---------------------------------------------------

    /// A normal response to message `message_id`.
    pub fn respond(
        &self,
        content: impl Content,
        message_id: u64,
        destination: &Address,
    ) -> Result<Message> {
        let owner = self.owner()?;
        Ok(Message::response(
            owner.next_sequence(),
            Some(payload(content)),
            message_id,
            self.address()?,
            destination.clone(),
        ))
    }

    /// An error response to message `message_id`.
    pub fn respond_error(
        &self,
        description: impl Into<String>,
        cause: Option<String>,
        message_id: u64,
        destination: &Address,
    ) -> Result<Message> {
        let owner = self.owner()?;
        let report = ErrorReport {
            description: description.into(),
            cause,
        };
        Ok(Message::error(
            owner.next_sequence(),
            message_id,
            report,
            self.address()?,
            destination.clone(),
        ))
    }

    /// An immediate action.
    pub fn send(
        &self,
        content: impl Content,
        destination: &Address,
        respond_to: &Address,
    ) -> Result<Message> {
        self.build(MessageKind::Action, content, destination, respond_to)
    }

    /// An event due at `at`.
    pub fn schedule(
        &self,
        content: impl Content,
        at: SimTime,
        destination: &Address,
        respond_to: &Address,
    ) -> Result<Message> {
        self.build(MessageKind::Event { at }, content, destination, respond_to)
    }

    fn build(
        &self,
        kind: MessageKind,
        content: impl Content,
        destination: &Address,
        respond_to: &Address,
    ) -> Result<Message> {
        let owner = self.owner()?;
        Ok(Message::new(
            kind,
            owner.next_sequence(),
            Some(payload(content)),
            self.address()?,
            destination.clone(),
            respond_to.clone(),
        ))
    }
}

impl fmt::Debug for FeatureCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}]",
            self.descriptor.name, self.descriptor.version, self.descriptor.description
        )
    }
}

// ---------------------------------------------------------------------------
// Requirement slots
// ---------------------------------------------------------------------------

/// A declared dependency of a feature and the slot the resolver fills.
pub struct Requirement {
    field: &'static str,
    specification: FeatureSpecification,
    slot: OnceLock<Weak<dyn Feature>>,
}

impl Requirement {
    pub fn new(field: &'static str, specification: FeatureSpecification) -> Self {
        Self {
            field,
            specification,
            slot: OnceLock::new(),
        }
    }

    /// Field name, reported when resolution fails.
    pub fn field(&self) -> &'static str {
        self.field
    }

    pub fn specification(&self) -> &FeatureSpecification {
        &self.specification
    }

    pub fn is_filled(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Fill the slot. Returns false (and keeps the old value) if it was
    /// already filled.
    pub fn fill(&self, feature: &FeatureRef) -> bool {
        self.slot.set(Arc::downgrade(feature)).is_ok()
    }

    pub fn get(&self) -> Option<FeatureRef> {
        self.slot.get().and_then(Weak::upgrade)
    }

    pub fn get_as<T: Feature>(&self) -> Option<Arc<T>> {
        self.get().as_ref().and_then(downcast_feature::<T>)
    }
}

impl fmt::Debug for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requirement")
            .field("field", &self.field)
            .field("specification", &format_args!("{}", self.specification))
            .field("filled", &self.is_filled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

pub trait Feature: AsAny + fmt::Debug {
    fn core(&self) -> &FeatureCore;

    /// Declared dependencies. Filled by the resolver before `configure`.
    fn requirements(&self) -> &[Requirement] {
        &[]
    }

    /// Configuration kind this feature accepts.
    fn configuration_kind(&self) -> &str {
        &self.core().descriptor().configuration_kind
    }

    fn configure(&self, _config: &FeatureConfiguration) -> Result<()> {
        self.core().mark_configured();
        Ok(())
    }

    fn init(&self) -> Result<()> {
        self.core().init()
    }

    fn as_handler(&self) -> Option<&dyn Handler> {
        None
    }

    fn as_agent(&self) -> Option<&dyn Agent> {
        None
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn version(&self) -> Version {
        self.core().version()
    }

    fn specification(&self) -> FeatureSpecification {
        self.core().descriptor().specification()
    }

    fn is_configured(&self) -> bool {
        self.core().is_configured()
    }

    fn is_initialized(&self) -> bool {
        self.core().is_initialized()
    }

    fn owner(&self) -> Result<&EntityHandle> {
        self.core().owner()
    }
}

/// Arguments of one `Handler::process` call.
#[derive(Clone, Copy, Debug)]
pub struct Delivery<'a> {
    pub content: &'a dyn Content,
    /// Event time, `None` for non-events.
    pub scheduled: Option<SimTime>,
    pub now: SimTime,
    pub from: &'a Address,
    /// Sequence number of the message, for responses.
    pub id: u64,
    pub respond_to: &'a Address,
}

impl<'a> Delivery<'a> {
    pub fn new(message: &'a Message, content: &'a dyn Content, now: SimTime) -> Self {
        Self {
            content,
            scheduled: message.scheduled_time(),
            now,
            from: message.source(),
            id: message.sequence(),
            respond_to: message.respond_to(),
        }
    }

    /// Downcast the content, or fail with `ContentMismatch` on behalf of
    /// `feature`.
    pub fn content_as<T: Any>(&self, feature: &str) -> Result<&'a T> {
        self.content
            .downcast_ref::<T>()
            .ok_or_else(|| KernelError::ContentMismatch {
                feature: feature.to_string(),
                expected: std::any::type_name::<T>().to_string(),
            })
    }
}

pub trait Handler: Feature {
    fn content_handled(&self) -> Vec<ContentKind>;

    fn process(&self, delivery: &Delivery<'_>) -> Result<ProcessingResult>;

    fn address(&self) -> Result<Address> {
        self.core().address()
    }

    fn info_string(&self) -> String {
        self.core().info_string()
    }
}

pub trait Agent: Handler {
    fn tick(&self, now: SimTime) -> Result<ProcessingResult>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct Gauge {
        core: FeatureCore,
        level: Mutex<u32>,
    }

    impl Gauge {
        fn new(requires_configuration: bool) -> Self {
            let mut descriptor = FeatureDescriptor::new::<Gauge>("Gauge", Version::new(1, 2, 3));
            descriptor.requires_configuration = requires_configuration;
            Self {
                core: FeatureCore::new(descriptor),
                level: Mutex::new(0),
            }
        }
    }

    impl Feature for Gauge {
        fn core(&self) -> &FeatureCore {
            &self.core
        }
    }

    #[derive(Debug)]
    struct Dial {
        core: FeatureCore,
        requirements: [Requirement; 1],
    }

    impl Feature for Dial {
        fn core(&self) -> &FeatureCore {
            &self.core
        }

        fn requirements(&self) -> &[Requirement] {
            &self.requirements
        }
    }

    #[test]
    fn init_requires_configuration_when_declared() {
        let gauge = Gauge::new(true);
        assert!(matches!(gauge.init(), Err(KernelError::NotConfigured { .. })));
        gauge.configure(&FeatureConfiguration::default()).unwrap();
        assert!(gauge.init().is_ok());
        assert!(gauge.is_initialized());
    }

    #[test]
    fn owner_is_missing_until_attached() {
        let gauge = Gauge::new(false);
        assert!(matches!(gauge.owner(), Err(KernelError::OwnerMissing { .. })));
        let h = EntityHandle::detached("g").unwrap();
        gauge.core().attach_owner(&h);
        assert_eq!(gauge.owner().unwrap(), &h);
        assert_eq!(gauge.core().address().unwrap(), Address::new(&h, "Gauge"));
    }

    #[test]
    fn requirement_slot_fills_once_and_downcasts() {
        let dial = Dial {
            core: FeatureCore::new(FeatureDescriptor::new::<Dial>("Dial", Version::new(1, 0, 0))),
            requirements: [Requirement::new("gauge", FeatureSpecification::named("Gauge", 1, 0))],
        };
        let gauge: FeatureRef = Arc::new(Gauge::new(false));
        let other: FeatureRef = Arc::new(Gauge::new(false));

        let slot = &dial.requirements()[0];
        assert!(!slot.is_filled());
        assert!(slot.fill(&gauge));
        assert!(!slot.fill(&other));

        let got = slot.get_as::<Gauge>().unwrap();
        *got.level.lock().unwrap() = 9;
        let again = downcast_feature::<Gauge>(&gauge).unwrap();
        assert_eq!(*again.level.lock().unwrap(), 9);
        assert!(slot.get_as::<Dial>().is_none());
    }

    #[test]
    fn builders_draw_sequence_from_owner_and_use_feature_address() {
        #[derive(Debug)]
        struct Reading(u32);

        let gauge = Gauge::new(false);
        let h = EntityHandle::detached("b").unwrap();
        gauge.core().attach_owner(&h);

        let to = Address::external(&h);
        let first = gauge.core().send(Reading(1), &to, &Address::nowhere()).unwrap();
        let second = gauge.core().schedule(Reading(2), 40, &to, &to).unwrap();
        let reply = gauge.core().respond(Reading(3), first.sequence(), &to).unwrap();
        let error = gauge
            .core()
            .respond_error("bad reading", None, second.sequence(), &to)
            .unwrap();

        assert!(second.sequence() > first.sequence());
        assert!(reply.sequence() > second.sequence());
        assert_eq!(second.scheduled_time(), Some(40));
        assert_eq!(first.source(), &Address::new(&h, "Gauge"));
        assert_eq!(reply.in_reply_to(), Some(first.sequence()));
        assert!(error.is_error());
        let report = error.content().and_then(|c| c.downcast_ref::<ErrorReport>()).unwrap();
        assert_eq!(report.description, "bad reading");
        let reading = reply.content().and_then(|c| c.downcast_ref::<Reading>()).unwrap();
        assert_eq!(reading.0, 3);
    }

    #[test]
    fn descriptor_drives_identity() {
        let gauge = Gauge::new(false);
        assert_eq!(gauge.name(), "Gauge");
        assert_eq!(gauge.version(), Version::new(1, 2, 3));
        assert_eq!(gauge.configuration_kind(), FeatureConfiguration::BASE_KIND);
        assert!(FeatureSpecification::named("Gauge", 1, 1).is_satisfied_by(&gauge.specification()));
        assert!(gauge.as_handler().is_none());
    }
}
