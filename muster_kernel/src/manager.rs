// Per-entity feature graph and message dispatch.
//
// A `FeatureManager` owns the `FeatureCache` its resolver filled, and after
// `init` three indices over it:
// - content kind -> handler (first registrant per kind wins);
// - handler name -> handler (first wins);
// - the agent list, in registration order.
//
// `process` routes one message to a handler: by content kind when the
// destination names no handler, otherwise by name, in which case the named
// handler must also declare the content kind. Messages nobody handles get an
// error response addressed to their respond-to, except error reports, which
// are only logged so two entities can never bounce errors back and forth.
//
// See also: `resolver.rs` for how the cache is filled, `entity.rs` for the
// caller and for how handler errors become error responses.
//
// **Critical constraint: determinism.** Indices are built by walking the
// cache in insertion order; agents tick in that order too.

use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

use muster_prng::SimRng;

use crate::address::{Address, EntityHandle};
use crate::config::FeatureConfiguration;
use crate::error::{KernelError, Result};
use crate::feature::{Delivery, FeatureRef, Handler};
use crate::loader::FeatureLoader;
use crate::message::{ErrorReport, Message};
use crate::processing::ProcessingResult;
use crate::resolver::{FeatureCache, Resolver};
use crate::specification::FeatureSpecification;
use crate::types::{ContentKind, SimTime};

/// Handler name used as the source of errors the manager itself raises.
pub const FEATURE_MANAGER_HANDLER: &str = "FeatureManager";

pub struct FeatureManager {
    owner: Option<EntityHandle>,
    cache: FeatureCache,
    handlers: Vec<FeatureRef>,
    by_content: FxHashMap<ContentKind, usize>,
    by_name: FxHashMap<String, usize>,
    agents: Vec<FeatureRef>,
    initialized: bool,
}

impl FeatureManager {
    /// Resolve `specs` in order for `owner`. Resolution and configuration
    /// errors propagate.
    pub fn new(
        owner: &EntityHandle,
        loader: &FeatureLoader,
        specs: &[FeatureSpecification],
        configurations: &BTreeMap<String, FeatureConfiguration>,
        seed: u64,
    ) -> Result<Self> {
        let mut manager = Self::empty(Some(owner.clone()));
        if !specs.is_empty() {
            log::debug!("{} - resolving {} features", owner.path(), specs.len());
            let mut rng = SimRng::new(seed);
            let mut resolver = Resolver::new(
                &mut manager.cache,
                configurations,
                owner,
                rng.sub_seed(),
                loader,
            );
            for spec in specs {
                let feature = resolver.load_and_resolve(spec)?;
                log::debug!(
                    "{} - got {} / {}",
                    owner.path(),
                    feature.name(),
                    feature.core().descriptor().description
                );
            }
        }
        Ok(manager)
    }

    /// A manager with no features, for hand-wired setups.
    pub fn empty(owner: Option<EntityHandle>) -> Self {
        Self {
            owner,
            cache: FeatureCache::new(),
            handlers: Vec::new(),
            by_content: FxHashMap::default(),
            by_name: FxHashMap::default(),
            agents: Vec::new(),
            initialized: false,
        }
    }

    /// Add a feature unless one with an equal specification is already
    /// present. Only allowed before `init`.
    pub fn register(&mut self, feature: FeatureRef) -> bool {
        if self.initialized {
            log::warn!(
                "{} registered after init and ignored",
                feature.name()
            );
            return false;
        }
        if self.cache.contains_key(&feature.specification()) {
            return false;
        }
        self.cache.insert(feature);
        true
    }

    /// Attach the owner to every feature, build the dispatch indices,
    /// initialize each feature, and publish the handled content kinds.
    /// A second call does nothing.
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let owner = self.owner.clone().ok_or_else(|| KernelError::OwnerMissing {
            feature: FEATURE_MANAGER_HANDLER.to_string(),
        })?;

        self.handlers.clear();
        self.by_content.clear();
        self.by_name.clear();
        self.agents.clear();

        let features: Vec<FeatureRef> = self.cache.features().cloned().collect();
        for feature in &features {
            feature.core().attach_owner(&owner);
            if let Some(handler) = feature.as_handler() {
                let index = self.handlers.len();
                self.handlers.push(Arc::clone(feature));
                for kind in handler.content_handled() {
                    self.by_content.entry(kind).or_insert(index);
                }
                self.by_name
                    .entry(handler.name().to_string())
                    .or_insert(index);
            }
            if feature.as_agent().is_some() {
                self.agents.push(Arc::clone(feature));
            }
            feature.init()?;
        }

        owner.publish_capabilities(self.by_content.keys().copied().collect::<BTreeSet<_>>());
        self.initialized = true;
        log::debug!(
            "{} - feature manager initialized: {}",
            owner.path(),
            self.configuration_report()
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn check_init(&self) -> Result<&EntityHandle> {
        match (&self.owner, self.initialized) {
            (Some(owner), true) => Ok(owner),
            _ => Err(KernelError::not_initialized("feature manager")),
        }
    }

    /// Select the handler for `kind`, by name when one is given.
    pub fn get_handler(&self, kind: ContentKind, name: Option<&str>) -> Option<&dyn Handler> {
        let index = match name {
            None => self.by_content.get(&kind).copied(),
            Some(name) => {
                let index = self.by_name.get(name).copied();
                let declares = |i: &usize| {
                    self.handlers
                        .get(*i)
                        .and_then(|f| f.as_handler())
                        .is_some_and(|h| h.content_handled().contains(&kind))
                };
                if index.is_some() && !index.as_ref().is_some_and(declares) {
                    log::debug!("handler {name} does not support {kind}");
                }
                index.filter(declares)
            }
        };
        let handler = index
            .and_then(|i| self.handlers.get(i))
            .and_then(|f| f.as_handler());
        log::debug!(
            "selected {} to handle {kind}",
            handler.map_or("nothing", |h| h.name())
        );
        handler
    }

    /// Dispatch one message. Handler errors are returned to the caller.
    pub fn process(&self, message: &Message, now: SimTime) -> Result<ProcessingResult> {
        let owner = self.check_init()?;

        let Some(content) = message.content() else {
            log::error!("in {}, message content was absent", owner.path());
            return Ok(self.error_response(owner, message, "message content was absent"));
        };

        let kind = content.kind();
        match self.get_handler(kind, message.destination().handler()) {
            Some(handler) => {
                log::trace!("dispatching {} to {}", message.sequence(), handler.name());
                handler.process(&Delivery::new(message, content, now))
            }
            None if message.is_error() || content.is::<ErrorReport>() => {
                let description = content
                    .downcast_ref::<ErrorReport>()
                    .map_or("(no description)", |r| r.description.as_str());
                log::error!(
                    "in {}, received error from {}: {description}",
                    owner.path(),
                    message.source()
                );
                Ok(ProcessingResult::empty())
            }
            None => {
                let description = format!("no handler for message of type {}", kind.name());
                log::error!(
                    "in {}, {description}, received from {}; types handled are {:?}",
                    owner.path(),
                    message.source(),
                    self.by_content.keys().map(ContentKind::short_name).collect::<Vec<_>>()
                );
                Ok(self.error_response(owner, message, &description))
            }
        }
    }

    fn error_response(
        &self,
        owner: &EntityHandle,
        message: &Message,
        description: &str,
    ) -> ProcessingResult {
        ProcessingResult::single(Message::error(
            owner.next_sequence(),
            message.sequence(),
            ErrorReport::new(description),
            Address::new(owner, FEATURE_MANAGER_HANDLER),
            message.respond_to().clone(),
        ))
    }

    /// Tick every agent, merging results in agent order. A failing agent is
    /// logged and contributes nothing.
    pub fn run_all_agents(&self, now: SimTime) -> Result<ProcessingResult> {
        let owner = self.check_init()?;
        log::trace!("{} running {} agents at {now}", owner.name(), self.agents.len());
        let results = self
            .agents
            .iter()
            .filter_map(|f| f.as_agent())
            .filter_map(|agent| match agent.tick(now) {
                Ok(result) => Some(result),
                Err(e) => {
                    log::error!("{} agent {} failed: {e}", owner.path(), agent.name());
                    None
                }
            })
            .collect::<Vec<_>>();
        Ok(ProcessingResult::merge(results))
    }

    pub fn can_handle(&self, kind: ContentKind) -> bool {
        self.by_content.contains_key(&kind)
    }

    pub fn specification_for_handler(&self, kind: ContentKind) -> Option<FeatureSpecification> {
        self.by_content
            .get(&kind)
            .and_then(|&i| self.handlers.get(i))
            .map(|f| f.specification())
    }

    /// `'name' M.m.p [Kinds ]; ` per feature.
    pub fn configuration_report(&self) -> String {
        let mut out = String::new();
        for feature in self.cache.features() {
            let _ = write!(out, "'{}' {} ", feature.name(), feature.version());
            if let Some(handler) = feature.as_handler() {
                out.push('[');
                for kind in handler.content_handled() {
                    let _ = write!(out, "{} ", kind.short_name());
                }
                out.push(']');
            }
            out.push_str("; ");
        }
        out
    }

    pub fn features(&self) -> impl Iterator<Item = &FeatureRef> {
        self.cache.features()
    }

    pub fn cache(&self) -> &FeatureCache {
        &self.cache
    }

    pub fn owner(&self) -> Option<&EntityHandle> {
        self.owner.as_ref()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }
}
