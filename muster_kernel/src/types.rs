// Core types shared across the kernel.
//
// Defines logical time (`SimTime`), entity identifiers and the id blocks they
// are allocated from, force classification, feature versions, and
// `ContentKind`, the runtime identity of a message content type.
//
// See also: `address.rs` for `EntityHandle`, which carries an `EntityId`, and
// `message.rs` for the `Content` trait whose kinds are described here.

use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Logical time
// ---------------------------------------------------------------------------

/// Opaque logical simulation time in milliseconds. Never wall-clock.
pub type SimTime = u64;

/// "No event pending". Sorts after every real time.
pub const NEVER: SimTime = SimTime::MAX;

// ---------------------------------------------------------------------------
// Entity ids
// ---------------------------------------------------------------------------

/// Globally unique, monotonically assigned entity identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ranges entity ids are drawn from. System entities (controllers, clients)
/// take low ids so user entities are recognizable at a glance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdBlock {
    System,
    User,
}

const SYSTEM_BLOCK_BEGIN: u64 = 0;
const USER_BLOCK_BEGIN: u64 = 10_000;

static SYSTEM_COUNTER: AtomicU64 = AtomicU64::new(SYSTEM_BLOCK_BEGIN);
static USER_COUNTER: AtomicU64 = AtomicU64::new(USER_BLOCK_BEGIN);

impl IdBlock {
    fn bounds(self) -> (&'static AtomicU64, u64) {
        match self {
            IdBlock::System => (&SYSTEM_COUNTER, USER_BLOCK_BEGIN),
            IdBlock::User => (&USER_COUNTER, u64::MAX),
        }
    }

    /// Allocate the next id in this block.
    pub fn allocate(self) -> Result<EntityId> {
        let (counter, upper) = self.bounds();
        take_id(counter, upper)
            .map(EntityId)
            .ok_or(KernelError::EntityIdsExhausted { block: self })
    }
}

/// Claim `counter`'s current value if it is still below `upper`.
fn take_id(counter: &AtomicU64, upper: u64) -> Option<u64> {
    counter
        .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |next| {
            (next < upper).then_some(next + 1)
        })
        .ok()
}

impl fmt::Display for IdBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdBlock::System => write!(f, "system"),
            IdBlock::User => write!(f, "user"),
        }
    }
}

// ---------------------------------------------------------------------------
// Force classification
// ---------------------------------------------------------------------------

/// Side an entity belongs to. `System` entities are infrastructure and never
/// count as simulation participants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Force {
    Blue,
    Red,
    Green,
    #[default]
    Gray,
    System,
}

impl Force {
    pub const ALL: [Force; 5] = [Force::Blue, Force::Red, Force::Green, Force::Gray, Force::System];

    pub fn as_str(self) -> &'static str {
        match self {
            Force::Blue => "BLUE",
            Force::Red => "RED",
            Force::Green => "GREEN",
            Force::Gray => "GRAY",
            Force::System => "SYSTEM",
        }
    }
}

impl fmt::Display for Force {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

/// Semantic version of a feature implementation. Ordered lexicographically by
/// `(major, minor, patch)`, so `max` picks the newest.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ---------------------------------------------------------------------------
// Content kinds
// ---------------------------------------------------------------------------

/// Runtime identity of a message content type.
///
/// Equality, hashing, and ordering use the `TypeId` only; the name is carried
/// for log lines and diagnostic reports.
#[derive(Clone, Copy)]
pub struct ContentKind {
    id: TypeId,
    name: &'static str,
}

impl ContentKind {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Last path segment of the type name, for compact reports.
    pub fn short_name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }
}

impl PartialEq for ContentKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ContentKind {}

impl Hash for ContentKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for ContentKind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContentKind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Debug for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKind({})", self.name)
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
