// Directory of entity handles, grouped by force.
//
// Handles are registered per force, then `compile` builds the lookup maps:
// id -> handle and `FORCE:path` -> handle. Everything not in the `System`
// force is a simulation participant.
//
// `deliver_all` is the scheduler-side delivery step: it takes messages
// drained from entities' outbound queues and drops each one into its
// destination's mailbox. Messages for unregistered or unready destinations
// are handed back to the caller.
//
// See also: `address.rs` for `EntityHandle::try_deliver`, `entity.rs` for
// `take_outbound`.

use std::collections::BTreeMap;

use crate::address::{Address, ENTITY_PATH_DELIMITER, EntityHandle};
use crate::message::Message;
use crate::types::{EntityId, Force};

#[derive(Debug, Default)]
pub struct EntityRegistry {
    by_force: BTreeMap<Force, Vec<EntityHandle>>,
    by_id: BTreeMap<EntityId, EntityHandle>,
    by_path: BTreeMap<String, EntityHandle>,
    client: Option<Address>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// File `handle` under its force. Registering the same handle twice is
    /// a no-op.
    pub fn register(&mut self, handle: &EntityHandle) {
        let group = self.by_force.entry(handle.force()).or_default();
        if !group.contains(handle) {
            group.push(handle.clone());
        }
    }

    /// Rebuild the id and path maps from everything registered so far.
    pub fn compile(&mut self) {
        self.by_id.clear();
        self.by_path.clear();
        for handle in self.by_force.values().flatten() {
            self.by_id.insert(handle.id(), handle.clone());
            if let Some(previous) = self.by_path.insert(handle.force_path(), handle.clone()) {
                log::warn!(
                    "path {} is shared by entities {} and {}",
                    handle.force_path(),
                    previous.id(),
                    handle.id()
                );
            }
        }
        log::debug!("entity registry compiled with {} entities", self.by_id.len());
    }

    pub fn handle_by_id(&self, id: EntityId) -> Option<&EntityHandle> {
        self.by_id.get(&id)
    }

    /// Look up `FORCE:path`. A bare path is taken to be `BLUE`.
    pub fn handle_by_path(&self, path: &str) -> Option<&EntityHandle> {
        if path.contains(ENTITY_PATH_DELIMITER) {
            self.by_path.get(path)
        } else {
            self.by_path
                .get(&format!("{}{ENTITY_PATH_DELIMITER}{path}", Force::Blue))
        }
    }

    /// Every non-`System` handle, grouped by force.
    pub fn simulation_handles(&self) -> Vec<&EntityHandle> {
        self.by_force
            .iter()
            .filter(|(force, _)| **force != Force::System)
            .flat_map(|(_, handles)| handles)
            .collect()
    }

    pub fn all_handles(&self) -> Vec<&EntityHandle> {
        self.by_force.values().flatten().collect()
    }

    pub fn client_address(&self) -> Option<&Address> {
        self.client.as_ref()
    }

    pub fn set_client(&mut self, client: &EntityHandle) {
        self.client = Some(Address::external(client));
    }

    /// Drop each message into its destination's mailbox, in order. Returns
    /// the messages that could not be delivered.
    pub fn deliver_all(&self, messages: impl IntoIterator<Item = Message>) -> Vec<Message> {
        let mut undelivered = Vec::new();
        for message in messages {
            let target = message
                .destination()
                .entity()
                .and_then(|h| self.by_id.get(&h.id()))
                .cloned();
            let Some(target) = target else {
                log::warn!(
                    "no registered entity for destination {} of message {}",
                    message.destination(),
                    message.sequence()
                );
                undelivered.push(message);
                continue;
            };
            if let Err(message) = target.try_deliver(message) {
                log::error!(
                    "could not deliver message {} to {}",
                    message.sequence(),
                    target.path_and_name()
                );
                undelivered.push(message);
            }
        }
        undelivered
    }
}
