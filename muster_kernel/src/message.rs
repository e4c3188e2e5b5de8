// Message model and inbound ordering.
//
// A `Message` is an immutable envelope: sequence number, optional content
// payload, and three addresses (source, destination, respond-to). Its
// `MessageKind` distinguishes:
// - `Action`: processed as soon as the entity gets to it.
// - `Event`: gated on a scheduled logical time.
// - `Response` / `Error`: replies to an earlier message, carrying its id.
//
// Content is any `Send + Sync + Debug + 'static` value behind an `Arc`. The
// kernel dispatches on the content's `ContentKind` (its `TypeId`); handlers
// downcast to the concrete type.
//
// `compare_for_queue` is the total order of an entity's inbound queue:
// 1. every non-event sorts before every event, whatever the event's time,
//    so pending actions drain before anything time-gated is considered;
// 2. events by scheduled time, earliest first;
// 3. ties by source address (internal < external, entity id, handler name),
//    then sequence number.
//
// `InboundQueue` wraps a `BinaryHeap` with the order reversed to get a
// min-heap, the same trick the scheduled-event queue of a discrete event sim
// uses.
//
// **Critical constraint: determinism.** Identical inputs must pop in identical
// order on every run. Nothing here may depend on insertion timing, pointer
// values, or hash iteration.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

use crate::address::{Address, EntityHandle};
use crate::types::{ContentKind, SimTime};

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

/// Message content. Implemented for every `Any + Send + Sync + Debug` type.
///
/// Call these methods on `&dyn Content` (e.g. through `Message::content()`),
/// not on a `Payload` directly: `Arc<dyn Content>` is itself `Content`.
pub trait Content: Any + Send + Sync + fmt::Debug + 'static {
    fn kind(&self) -> ContentKind;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync + fmt::Debug> Content for T {
    fn kind(&self) -> ContentKind {
        ContentKind::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn Content {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Shared, immutable message content.
pub type Payload = Arc<dyn Content>;

/// Wrap a value as a payload.
pub fn payload(content: impl Content) -> Payload {
    Arc::new(content)
}

/// Content of error responses: what went wrong and, when known, the
/// underlying cause.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorReport {
    pub description: String,
    pub cause: Option<String>,
}

impl ErrorReport {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            cause: None,
        }
    }

    pub fn with_cause(description: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            cause: Some(cause.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Processed immediately.
    Action,
    /// Processed once logical time reaches `at`.
    Event { at: SimTime },
    /// Normal reply to message `message_id`.
    Response { message_id: u64 },
    /// Error reply to message `message_id`.
    Error { message_id: u64, description: String },
}

/// Immutable routed envelope.
#[derive(Clone)]
pub struct Message {
    kind: MessageKind,
    sequence: u64,
    content: Option<Payload>,
    source: Address,
    destination: Address,
    respond_to: Address,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        sequence: u64,
        content: Option<Payload>,
        source: Address,
        destination: Address,
        respond_to: Address,
    ) -> Self {
        Self {
            kind,
            sequence,
            content,
            source,
            destination,
            respond_to,
        }
    }

    /// An immediate action sent by `sender` (as its external address).
    pub fn action(
        sender: &EntityHandle,
        content: impl Content,
        destination: Address,
        respond_to: Address,
    ) -> Self {
        Self::new(
            MessageKind::Action,
            sender.next_sequence(),
            Some(payload(content)),
            Address::external(sender),
            destination,
            respond_to,
        )
    }

    /// An event sent by `sender`, due at logical time `at`.
    pub fn event(
        sender: &EntityHandle,
        content: impl Content,
        at: SimTime,
        destination: Address,
        respond_to: Address,
    ) -> Self {
        Self::new(
            MessageKind::Event { at },
            sender.next_sequence(),
            Some(payload(content)),
            Address::external(sender),
            destination,
            respond_to,
        )
    }

    /// A normal reply to message `message_id`.
    pub fn response(
        sequence: u64,
        content: Option<Payload>,
        message_id: u64,
        source: Address,
        destination: Address,
    ) -> Self {
        Self::new(
            MessageKind::Response { message_id },
            sequence,
            content,
            source,
            destination,
            Address::nowhere(),
        )
    }

    /// An error reply to message `message_id`. The content is an
    /// `ErrorReport` carrying the same description.
    pub fn error(
        sequence: u64,
        message_id: u64,
        report: ErrorReport,
        source: Address,
        destination: Address,
    ) -> Self {
        let description = report.description.clone();
        Self::new(
            MessageKind::Error {
                message_id,
                description,
            },
            sequence,
            Some(payload(report)),
            source,
            destination,
            Address::nowhere(),
        )
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn content(&self) -> Option<&dyn Content> {
        self.content.as_deref()
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.content.as_ref()
    }

    pub fn content_kind(&self) -> Option<ContentKind> {
        self.content().map(|c| c.kind())
    }

    pub fn source(&self) -> &Address {
        &self.source
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    pub fn respond_to(&self) -> &Address {
        &self.respond_to
    }

    /// The scheduled time of an event; `None` for everything else.
    pub fn scheduled_time(&self) -> Option<SimTime> {
        match self.kind {
            MessageKind::Event { at } => Some(at),
            _ => None,
        }
    }

    pub fn is_event(&self) -> bool {
        matches!(self.kind, MessageKind::Event { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, MessageKind::Error { .. })
    }

    /// The id of the message this one answers, for responses and errors.
    pub fn in_reply_to(&self) -> Option<u64> {
        match self.kind {
            MessageKind::Response { message_id } | MessageKind::Error { message_id, .. } => {
                Some(message_id)
            }
            _ => None,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("sequence", &self.sequence)
            .field("content", &self.content())
            .field("source", &format_args!("{}", self.source))
            .field("destination", &format_args!("{}", self.destination))
            .field("respond_to", &format_args!("{}", self.respond_to))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Total order of pending messages. `Less` is processed first.
pub fn compare_for_queue(a: &Message, b: &Message) -> Ordering {
    match (a.scheduled_time(), b.scheduled_time()) {
        (Some(ta), Some(tb)) => ta.cmp(&tb).then_with(|| compare_by_source(a, b)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => compare_by_source(a, b),
    }
}

fn compare_by_source(a: &Message, b: &Message) -> Ordering {
    a.source
        .cmp(&b.source)
        .then_with(|| a.sequence.cmp(&b.sequence))
}

/// Heap entry; reverses `compare_for_queue` so the max-heap pops the minimum.
struct Queued(Message);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_for_queue(&other.0, &self.0)
    }
}

/// An entity's inbound priority queue.
#[derive(Default)]
pub struct InboundQueue {
    heap: BinaryHeap<Queued>,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.heap.push(Queued(message));
    }

    pub fn peek(&self) -> Option<&Message> {
        self.heap.peek().map(|q| &q.0)
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.heap.pop().map(|q| q.0)
    }

    /// Pop the head unless it is an event scheduled after `now`.
    pub fn pop_due(&mut self, now: SimTime) -> Option<Message> {
        let due = self
            .peek()
            .is_some_and(|m| m.scheduled_time().is_none_or(|at| at <= now));
        if due { self.pop() } else { None }
    }

    /// Scheduled time of the head, if the head is an event.
    pub fn next_event_time(&self) -> Option<SimTime> {
        self.peek().and_then(Message::scheduled_time)
    }

    /// Remove everything, in processing order.
    pub fn drain_all(&mut self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(message) = self.pop() {
            out.push(message);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl fmt::Debug for InboundQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundQueue")
            .field("len", &self.heap.len())
            .field("next_event_time", &self.next_event_time())
            .finish()
    }
}
