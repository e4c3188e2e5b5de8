// Routing identifiers: entity handles and addresses.
//
// An `EntityHandle` is the only way one entity refers to another. It wraps the
// small, immutable, thread-shareable part of an entity (id, name, path,
// force, sequence counter, inbound mailbox, published capabilities) and never
// exposes the entity itself. Cross-entity mutation is therefore impossible:
// the only thing another thread can do to an entity is drop a message into
// its mailbox via `deliver`.
//
// An `Address` is `(optional handle, optional handler name)`:
// - internal (no handle): stays inside the sending entity, routed to the named
//   handler.
// - external (handle present): routed to that entity, then to the named
//   handler or, without a name, to whichever handler accepts the content.
// - nowhere: the sentinel destination that makes the router drop a message.
//
// See also: `entity.rs` for the routing rules and the mailbox consumer,
// `message.rs` for how source addresses break ordering ties.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, OnceLock};

use crate::error::{KernelError, Result};
use crate::message::Message;
use crate::types::{ContentKind, EntityId, Force, IdBlock};

/// Separator between force and path in a fully qualified entity path.
pub const ENTITY_PATH_DELIMITER: &str = ":";

/// Handler name of the nowhere sentinel.
pub const NOWHERE_HANDLER: &str = "NOWHERE";

// ---------------------------------------------------------------------------
// EntityHandle
// ---------------------------------------------------------------------------

struct EntityShared {
    id: EntityId,
    name: String,
    path: String,
    force: Force,
    sequence: AtomicU64,
    initialized: AtomicBool,
    mailbox: Sender<Message>,
    capabilities: OnceLock<BTreeSet<ContentKind>>,
}

/// Immutable, cheaply clonable indirection to an entity.
///
/// Equality, hashing, and ordering delegate to the entity id.
#[derive(Clone)]
pub struct EntityHandle {
    shared: Arc<EntityShared>,
}

impl EntityHandle {
    pub(crate) fn new(
        id: EntityId,
        name: String,
        path: String,
        force: Force,
        mailbox: Sender<Message>,
    ) -> Self {
        Self {
            shared: Arc::new(EntityShared {
                id,
                name,
                path,
                force,
                sequence: AtomicU64::new(0),
                initialized: AtomicBool::new(false),
                mailbox,
                capabilities: OnceLock::new(),
            }),
        }
    }

    /// A handle that belongs to no running entity. Its mailbox is closed and
    /// it never reports itself initialized. Used by transient resolvers and
    /// by tests that wire features by hand.
    pub fn detached(name: &str) -> Result<Self> {
        let id = IdBlock::System.allocate()?;
        let (tx, _rx) = mpsc::channel();
        Ok(Self::new(id, name.to_string(), name.to_string(), Force::System, tx))
    }

    pub fn id(&self) -> EntityId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn force(&self) -> Force {
        self.shared.force
    }

    /// `FORCE:path`, the key the registry files handles under.
    pub fn force_path(&self) -> String {
        format!("{}{}{}", self.shared.force, ENTITY_PATH_DELIMITER, self.shared.path)
    }

    pub fn path_and_name(&self) -> String {
        format!("{}[{}]", self.shared.path, self.shared.name)
    }

    /// Next message sequence number of the wrapped entity. Strictly
    /// increasing per entity, shared by every feature the entity hosts.
    pub fn next_sequence(&self) -> u64 {
        self.shared.sequence.fetch_add(1, AtomicOrdering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(AtomicOrdering::SeqCst)
    }

    pub(crate) fn mark_initialized(&self) {
        self.shared.initialized.store(true, AtomicOrdering::SeqCst);
    }

    /// Whether the entity has a handler registered for `kind`. False until
    /// the entity has been initialized.
    pub fn can_handle(&self, kind: ContentKind) -> bool {
        self.shared
            .capabilities
            .get()
            .is_some_and(|kinds| kinds.contains(&kind))
    }

    pub(crate) fn publish_capabilities(&self, kinds: BTreeSet<ContentKind>) {
        // Published once, at init; a second publish keeps the first set.
        let _ = self.shared.capabilities.set(kinds);
    }

    /// Hand a message to the entity from any thread. It is absorbed into the
    /// entity's inbound queue on the entity's own thread at its next
    /// `process_messages` / `run_agents`.
    pub fn deliver(&self, message: Message) -> Result<()> {
        if !self.is_initialized() {
            return Err(KernelError::not_initialized(format!(
                "entity {}",
                self.shared.name
            )));
        }
        self.try_deliver(message)
            .map_err(|_| KernelError::MailboxClosed {
                entity: self.path_and_name(),
            })
    }

    /// Like `deliver`, but hands the message back when it cannot be
    /// delivered.
    pub fn try_deliver(&self, message: Message) -> std::result::Result<(), Message> {
        if !self.is_initialized() {
            return Err(message);
        }
        log::trace!("delivering message {} to {}", message.sequence(), self.path());
        self.shared.mailbox.send(message).map_err(|e| e.0)
    }
}

impl PartialEq for EntityHandle {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for EntityHandle {}

impl Hash for EntityHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

impl PartialOrd for EntityHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntityHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.shared.id.cmp(&other.shared.id)
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EntityHandle(id={} force={} path={} name={})",
            self.shared.id, self.shared.force, self.shared.path, self.shared.name
        )
    }
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// Source or destination of a message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    entity: Option<EntityHandle>,
    handler: Option<String>,
}

impl Address {
    /// Route to `handler` inside the sending entity.
    pub fn internal(handler: impl Into<String>) -> Self {
        Self {
            entity: None,
            handler: Some(handler.into()),
        }
    }

    /// Route to `entity`, letting it choose the handler by content type.
    pub fn external(entity: &EntityHandle) -> Self {
        Self {
            entity: Some(entity.clone()),
            handler: None,
        }
    }

    /// Route to a specific handler of a specific entity.
    pub fn new(entity: &EntityHandle, handler: impl Into<String>) -> Self {
        Self {
            entity: Some(entity.clone()),
            handler: Some(handler.into()),
        }
    }

    /// The drop sentinel.
    pub fn nowhere() -> Self {
        Self::internal(NOWHERE_HANDLER)
    }

    pub fn entity(&self) -> Option<&EntityHandle> {
        self.entity.as_ref()
    }

    pub fn handler(&self) -> Option<&str> {
        self.handler.as_deref()
    }

    pub fn is_internal(&self) -> bool {
        self.entity.is_none()
    }

    pub fn is_external(&self) -> bool {
        self.entity.is_some()
    }

    pub fn is_nowhere(&self) -> bool {
        self.entity.is_none() && self.handler.as_deref() == Some(NOWHERE_HANDLER)
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    /// Internal addresses precede external ones. Otherwise compare entity ids,
    /// then handler names with absent names last.
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.entity, &other.entity) {
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (a, b) => a.cmp(b).then_with(|| match (&self.handler, &other.handler) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(h1), Some(h2)) => h1.cmp(h2),
            }),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handler = self.handler.as_deref().unwrap_or("*");
        match &self.entity {
            Some(entity) => write!(f, "{}/{}", entity.force_path(), handler),
            None => write!(f, "internal/{handler}"),
        }
    }
}
