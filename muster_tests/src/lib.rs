// Shared fixtures for multi-entity integration tests.
//
// Small but real features built on the public kernel API:
// - `Echo`: answers `Ping` with `Pong`, fails on `Fail`. Several versions are
//   packaged as plugin modules so layer selection can be observed.
// - `Requester`: on `Kick`, pings a target and records whatever comes back,
//   including error reports.
// - `Heartbeat`: an agent that schedules `Beat` events to itself with a
//   seeded jitter; requires a `HeartbeatConfiguration`.
// - `Sensor` / `Calibration`: a dependency pair that records the seeds the
//   resolver handed out.
// - `Left` / `Right`: a two-feature requirement cycle.
//
// Plus `init_logging`, the `echo_catalog` of plugin modules, and
// `standard_registry`, which registers every fixture by type.
//
// See also: `tests/` for the scenarios these drive.

use std::sync::{Arc, Mutex};

use muster_kernel::{
    Address, Agent, ContentKind, Delivery, ErrorReport, Feature, FeatureConfiguration,
    FeatureCore, FeatureDescriptor, FeatureFactory, FeatureProvider, FeatureRef,
    FeatureRegistry, FeatureSpecification, Handler, KernelError, ModuleCatalog, PluginModule,
    ProcessingResult, Requirement, Result, SimTime, Version,
};
use muster_prng::SimRng;
use serde::Deserialize;

/// Install an `env_logger` for the test binary. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ping(pub u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pong {
    pub value: u32,
    /// `name version` of the answering implementation.
    pub responder: String,
}

/// Tells a `Requester` to ping `target`.
#[derive(Clone, Debug)]
pub struct Kick {
    pub target: Address,
    pub value: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct Fail;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Beat(pub u32);

// ---------------------------------------------------------------------------
// Echo
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Echo {
    core: FeatureCore,
}

impl Echo {
    pub const NAME: &'static str = "Echo";

    pub fn descriptor_for(version: Version) -> FeatureDescriptor {
        FeatureDescriptor::new::<Echo>(Self::NAME, version)
            .with_description(format!("echo service {version}"))
    }

    /// A factory producing `Echo` at `version`.
    pub fn factory(version: Version) -> FeatureFactory {
        let descriptor = Self::descriptor_for(version);
        FeatureFactory::new(descriptor.clone(), move || -> FeatureRef {
            Arc::new(Echo {
                core: FeatureCore::new(descriptor.clone()),
            })
        })
    }
}

impl FeatureProvider for Echo {
    fn descriptor() -> FeatureDescriptor {
        Self::descriptor_for(Version::new(1, 0, 0))
    }

    fn create() -> Self {
        Self {
            core: FeatureCore::new(<Self as FeatureProvider>::descriptor()),
        }
    }
}

impl Feature for Echo {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn as_handler(&self) -> Option<&dyn Handler> {
        Some(self)
    }
}

impl Handler for Echo {
    fn content_handled(&self) -> Vec<ContentKind> {
        vec![ContentKind::of::<Ping>(), ContentKind::of::<Fail>()]
    }

    fn process(&self, delivery: &Delivery<'_>) -> Result<ProcessingResult> {
        if delivery.content.is::<Fail>() {
            return Err(KernelError::processing(self.name(), "asked to fail"));
        }
        let Ping(value) = *delivery.content_as::<Ping>(self.name())?;
        let pong = Pong {
            value,
            responder: format!("{} {}", self.name(), self.version()),
        };
        Ok(self.core.respond(pong, delivery.id, delivery.respond_to)?.into())
    }
}

/// Plugin modules `echo.v1` (Echo 1.0.0), `echo.v2` (Echo 2.1.0) and
/// `echo.legacy` (Echo 0.9.0).
pub fn echo_catalog() -> ModuleCatalog {
    ModuleCatalog::new()
        .with(
            PluginModule::new("echo.v1")
                .exporting("Echo")
                .providing(Echo::factory(Version::new(1, 0, 0))),
        )
        .with(
            PluginModule::new("echo.v2")
                .exporting("Echo")
                .requiring("echo.v1")
                .providing(Echo::factory(Version::new(2, 1, 0))),
        )
        .with(
            PluginModule::new("echo.legacy")
                .exporting("Echo")
                .providing(Echo::factory(Version::new(0, 9, 0))),
        )
}

// ---------------------------------------------------------------------------
// Requester
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Requester {
    core: FeatureCore,
    pongs: Mutex<Vec<Pong>>,
    errors: Mutex<Vec<String>>,
}

impl Requester {
    pub const NAME: &'static str = "Requester";

    pub fn pongs(&self) -> Vec<Pong> {
        self.pongs.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl FeatureProvider for Requester {
    fn descriptor() -> FeatureDescriptor {
        FeatureDescriptor::new::<Requester>(Self::NAME, Version::new(1, 0, 0))
    }

    fn create() -> Self {
        Self {
            core: FeatureCore::new(Self::descriptor()),
            pongs: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }
}

impl Feature for Requester {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn as_handler(&self) -> Option<&dyn Handler> {
        Some(self)
    }
}

impl Handler for Requester {
    fn content_handled(&self) -> Vec<ContentKind> {
        vec![
            ContentKind::of::<Kick>(),
            ContentKind::of::<Pong>(),
            ContentKind::of::<ErrorReport>(),
        ]
    }

    fn process(&self, delivery: &Delivery<'_>) -> Result<ProcessingResult> {
        let content = delivery.content;
        if let Some(kick) = content.downcast_ref::<Kick>() {
            let me = self.core.address()?;
            let ping = self.core.send(Ping(kick.value), &kick.target, &me)?;
            return Ok(ping.into());
        }
        if let Some(pong) = content.downcast_ref::<Pong>() {
            if let Ok(mut pongs) = self.pongs.lock() {
                pongs.push(pong.clone());
            }
            return Ok(ProcessingResult::empty());
        }
        let report = delivery.content_as::<ErrorReport>(self.name())?;
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(report.description.clone());
        }
        Ok(ProcessingResult::empty())
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub period_ms: u64,
    pub jitter_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            period_ms: 100,
            jitter_ms: 0,
        }
    }
}

#[derive(Debug, Default)]
struct HeartbeatState {
    settings: HeartbeatSettings,
    rng: Option<SimRng>,
    scheduled: u32,
    beats: Vec<(u32, SimTime)>,
}

/// Agent scheduling one `Beat` per tick, due `period_ms` (plus jitter)
/// later, and recording each beat as it arrives.
#[derive(Debug)]
pub struct Heartbeat {
    core: FeatureCore,
    state: Mutex<HeartbeatState>,
}

impl Heartbeat {
    pub const NAME: &'static str = "Heartbeat";
    pub const CONFIGURATION_KIND: &'static str = "HeartbeatConfiguration";

    pub fn configuration(period_ms: u64, jitter_ms: u64) -> FeatureConfiguration {
        FeatureConfiguration::with_params(
            Self::CONFIGURATION_KIND,
            serde_json::json!({ "period_ms": period_ms, "jitter_ms": jitter_ms }),
        )
    }

    /// `(beat number, time it was scheduled for)` in arrival order.
    pub fn beats(&self) -> Vec<(u32, SimTime)> {
        self.state.lock().map(|s| s.beats.clone()).unwrap_or_default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, HeartbeatState>> {
        self.state
            .lock()
            .map_err(|_| KernelError::processing(Self::NAME, "state lock poisoned"))
    }
}

impl FeatureProvider for Heartbeat {
    fn descriptor() -> FeatureDescriptor {
        FeatureDescriptor::new::<Heartbeat>(Self::NAME, Version::new(1, 2, 0))
            .with_configuration_kind(Self::CONFIGURATION_KIND)
            .requiring_configuration()
    }

    fn create() -> Self {
        Self {
            core: FeatureCore::new(Self::descriptor()),
            state: Mutex::new(HeartbeatState::default()),
        }
    }
}

impl Feature for Heartbeat {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn configure(&self, config: &FeatureConfiguration) -> Result<()> {
        let settings: HeartbeatSettings = config.params_as(self.name())?;
        if settings.period_ms == 0 {
            return Err(KernelError::InvalidConfiguration {
                feature: self.name().to_string(),
                reason: "period_ms must be positive".to_string(),
            });
        }
        let mut state = self.state()?;
        state.settings = settings;
        state.rng = Some(SimRng::new(config.seed));
        drop(state);
        self.core.mark_configured();
        Ok(())
    }

    fn as_handler(&self) -> Option<&dyn Handler> {
        Some(self)
    }

    fn as_agent(&self) -> Option<&dyn Agent> {
        Some(self)
    }
}

impl Handler for Heartbeat {
    fn content_handled(&self) -> Vec<ContentKind> {
        vec![ContentKind::of::<Beat>()]
    }

    fn process(&self, delivery: &Delivery<'_>) -> Result<ProcessingResult> {
        let Beat(n) = *delivery.content_as::<Beat>(self.name())?;
        let at = delivery.scheduled.unwrap_or(delivery.now);
        self.state()?.beats.push((n, at));
        Ok(ProcessingResult::empty())
    }
}

impl Agent for Heartbeat {
    fn tick(&self, now: SimTime) -> Result<ProcessingResult> {
        let mut state = self.state()?;
        let jitter = match (state.settings.jitter_ms, state.rng.as_mut()) {
            (0, _) | (_, None) => 0,
            (max, Some(rng)) => rng.range_u64(0, max + 1),
        };
        state.scheduled += 1;
        let beat = Beat(state.scheduled);
        let at = now + state.settings.period_ms + jitter;
        drop(state);

        let me = Address::internal(Self::NAME);
        let event = self.core.schedule(beat, at, &me, &Address::nowhere())?;
        Ok(event.into())
    }
}

// ---------------------------------------------------------------------------
// Sensor / Calibration
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub offset: i64,
}

#[derive(Debug)]
pub struct Calibration {
    core: FeatureCore,
    seed: Mutex<Option<u64>>,
    offset: Mutex<i64>,
}

impl Calibration {
    pub fn seed(&self) -> Option<u64> {
        self.seed.lock().ok().and_then(|s| *s)
    }

    pub fn offset(&self) -> i64 {
        self.offset.lock().map(|o| *o).unwrap_or_default()
    }
}

impl FeatureProvider for Calibration {
    fn descriptor() -> FeatureDescriptor {
        FeatureDescriptor::new::<Calibration>("Calibration", Version::new(3, 0, 1))
    }

    fn create() -> Self {
        Self {
            core: FeatureCore::new(Self::descriptor()),
            seed: Mutex::new(None),
            offset: Mutex::new(0),
        }
    }
}

impl Feature for Calibration {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn configure(&self, config: &FeatureConfiguration) -> Result<()> {
        let settings: CalibrationSettings = config.params_as(self.name())?;
        if let Ok(mut offset) = self.offset.lock() {
            *offset = settings.offset;
        }
        if let Ok(mut seed) = self.seed.lock() {
            *seed = Some(config.seed);
        }
        self.core.mark_configured();
        Ok(())
    }
}

#[derive(Debug)]
pub struct Sensor {
    core: FeatureCore,
    requirements: [Requirement; 1],
    seed: Mutex<Option<u64>>,
}

impl Sensor {
    pub fn seed(&self) -> Option<u64> {
        self.seed.lock().ok().and_then(|s| *s)
    }

    pub fn calibration(&self) -> Option<Arc<Calibration>> {
        self.requirements[0].get_as::<Calibration>()
    }
}

impl FeatureProvider for Sensor {
    fn descriptor() -> FeatureDescriptor {
        FeatureDescriptor::new::<Sensor>("Sensor", Version::new(1, 0, 0))
    }

    fn create() -> Self {
        Self {
            core: FeatureCore::new(Self::descriptor()),
            requirements: [Requirement::new(
                "calibration",
                FeatureSpecification::named("Calibration", 3, 0),
            )],
            seed: Mutex::new(None),
        }
    }
}

impl Feature for Sensor {
    fn core(&self) -> &FeatureCore {
        &self.core
    }

    fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    fn configure(&self, config: &FeatureConfiguration) -> Result<()> {
        if let Ok(mut seed) = self.seed.lock() {
            *seed = Some(config.seed);
        }
        self.core.mark_configured();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Left / Right
// ---------------------------------------------------------------------------

macro_rules! cyclic_feature {
    ($ty:ident, $name:literal, $peer:literal) => {
        #[derive(Debug)]
        pub struct $ty {
            core: FeatureCore,
            requirements: [Requirement; 1],
        }

        impl $ty {
            pub fn peer(&self) -> Option<FeatureRef> {
                self.requirements[0].get()
            }
        }

        impl FeatureProvider for $ty {
            fn descriptor() -> FeatureDescriptor {
                FeatureDescriptor::new::<$ty>($name, Version::new(1, 0, 0))
            }

            fn create() -> Self {
                Self {
                    core: FeatureCore::new(Self::descriptor()),
                    requirements: [Requirement::new(
                        "peer",
                        FeatureSpecification::named($peer, 1, 0),
                    )],
                }
            }
        }

        impl Feature for $ty {
            fn core(&self) -> &FeatureCore {
                &self.core
            }

            fn requirements(&self) -> &[Requirement] {
                &self.requirements
            }
        }
    };
}

cyclic_feature!(Left, "Left", "Right");
cyclic_feature!(Right, "Right", "Left");

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Every fixture registered by type (Echo at 1.0.0).
pub fn standard_registry() -> FeatureRegistry {
    let mut registry = FeatureRegistry::new();
    registry.register_type::<Echo>();
    registry.register_type::<Requester>();
    registry.register_type::<Heartbeat>();
    registry.register_type::<Sensor>();
    registry.register_type::<Calibration>();
    registry.register_type::<Left>();
    registry.register_type::<Right>();
    registry
}
