// Feature specifications and descriptors.
//
// A `FeatureSpecification` is both a request ("give me something named
// `Terrain`, at least version 1.2") and, when built from a descriptor, the
// identity a resolved feature is cached under. `is_satisfied_by` is the one
// matching rule used everywhere: the loader filters candidates with it and
// the resolver cache looks entries up with it.
//
// A `FeatureDescriptor` is the static identity of a registered
// implementation. Loaders match descriptors, so only the winning candidate is
// ever instantiated.
//
// See also: `loader.rs` for version ranking among candidates that all
// satisfy a request, `resolver.rs` for the cache lookup.

use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;

use crate::config::FeatureConfiguration;
use crate::types::Version;

/// Optional concrete implementing type of a request or descriptor.
#[derive(Clone, Copy)]
pub struct ImplementationType {
    id: TypeId,
    name: &'static str,
}

impl ImplementationType {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn short_name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }
}

impl PartialEq for ImplementationType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ImplementationType {}

impl fmt::Debug for ImplementationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImplementationType({})", self.name)
    }
}

// ---------------------------------------------------------------------------
// FeatureSpecification
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpecification {
    #[serde(skip)]
    pub implementation: Option<ImplementationType>,
    /// Feature name. Empty matches any name.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub major: u32,
    #[serde(default)]
    pub minor: u32,
    /// Require this exact major.minor rather than a compatible newer one.
    #[serde(default)]
    pub exact: bool,
}

impl FeatureSpecification {
    /// Name and minimum version.
    pub fn named(name: impl Into<String>, major: u32, minor: u32) -> Self {
        Self {
            implementation: None,
            name: name.into(),
            major,
            minor,
            exact: false,
        }
    }

    /// Name and exact version.
    pub fn exact(name: impl Into<String>, major: u32, minor: u32) -> Self {
        Self {
            exact: true,
            ..Self::named(name, major, minor)
        }
    }

    /// Any version of the concrete type `T`, whatever its name.
    pub fn of_type<T: Any>() -> Self {
        Self {
            implementation: Some(ImplementationType::of::<T>()),
            ..Self::named("", 0, 0)
        }
    }

    /// Narrow this request to implementations of type `T`.
    pub fn with_type<T: Any>(mut self) -> Self {
        self.implementation = Some(ImplementationType::of::<T>());
        self
    }

    /// The identity a loaded feature is cached under.
    pub fn from_descriptor(descriptor: &FeatureDescriptor) -> Self {
        Self {
            implementation: Some(descriptor.implementation),
            name: descriptor.name.clone(),
            major: descriptor.version.major,
            minor: descriptor.version.minor,
            exact: false,
        }
    }

    pub fn is_satisfied_by(&self, candidate: &FeatureSpecification) -> bool {
        if self == candidate {
            return true;
        }
        let types_ok = match (self.implementation, candidate.implementation) {
            (None, _) => true,
            (Some(wanted), Some(have)) => wanted == have,
            (Some(_), None) => false,
        };
        let names_ok = self.name.is_empty() || self.name == candidate.name;
        let version_ok = if self.exact {
            candidate.major == self.major && candidate.minor == self.minor
        } else {
            candidate.major > self.major
                || (candidate.major == self.major && candidate.minor >= self.minor)
        };
        let answer = types_ok && names_ok && version_ok;
        log::trace!(
            "checking {candidate} against {self}: types_ok={types_ok} names_ok={names_ok} version_ok={version_ok} -> {answer}"
        );
        answer
    }

    /// Name, or the implementing type when the name is a wildcard.
    pub fn identifier(&self) -> String {
        match self.implementation {
            Some(t) if self.name.is_empty() => t.name().to_string(),
            _ => self.name.clone(),
        }
    }
}

impl fmt::Display for FeatureSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(t) = self.implementation {
            write!(f, "(type {}) ", t.short_name())?;
        }
        write!(f, "{} {}.{}.", self.name, self.major, self.minor)?;
        if self.exact {
            write!(f, " [EXACT]")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FeatureDescriptor
// ---------------------------------------------------------------------------

/// Static identity of a feature implementation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureDescriptor {
    pub name: String,
    pub version: Version,
    pub description: String,
    pub implementation: ImplementationType,
    /// Configuration kind `configure` accepts.
    pub configuration_kind: String,
    /// Whether `init` fails until the feature has been configured.
    pub requires_configuration: bool,
}

impl FeatureDescriptor {
    pub fn new<T: Any>(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            implementation: ImplementationType::of::<T>(),
            configuration_kind: FeatureConfiguration::BASE_KIND.to_string(),
            requires_configuration: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_configuration_kind(mut self, kind: impl Into<String>) -> Self {
        self.configuration_kind = kind.into();
        self
    }

    pub fn requiring_configuration(mut self) -> Self {
        self.requires_configuration = true;
        self
    }

    pub fn specification(&self) -> FeatureSpecification {
        FeatureSpecification::from_descriptor(self)
    }
}
