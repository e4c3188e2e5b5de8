// Kernel error type.
//
// Four families, matching where each is raised and how it propagates:
// - Resolution (missing implementation, unresolved requirement, unknown
//   module) and configuration (kind mismatch, invalid parameters) errors are
//   construction-time failures. They propagate out of `Entity::new` /
//   `FeatureManager::new` uncaught.
// - State errors (use before `init`, missing owner) are caller bugs and
//   propagate as well.
// - Processing errors are returned by handlers. The entity catches them at
//   its boundary, logs them, and turns them into a routed error response.
//
// Every variant names the feature, requirement field, or specification at
// fault.

use thiserror::Error;

use crate::types::IdBlock;

pub type Result<T, E = KernelError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum KernelError {
    // -- resolution --------------------------------------------------------
    #[error("in {owner}, failed to load an implementation of {specification}")]
    MissingImplementation { owner: String, specification: String },

    #[error(
        "in {owner}, could not load an implementation of {specification} into feature '{feature}', requirement '{requirement}'"
    )]
    UnresolvedRequirement {
        owner: String,
        feature: String,
        requirement: String,
        specification: String,
    },

    #[error("module layer '{layer}' references unknown module '{module}'")]
    UnknownModule { layer: String, module: String },

    // -- configuration -----------------------------------------------------
    #[error("the configuration provided for {feature} was a {provided} rather than the required {required}")]
    ConfigurationMismatch {
        feature: String,
        provided: String,
        required: String,
    },

    #[error("invalid configuration for {feature}: {reason}")]
    InvalidConfiguration { feature: String, reason: String },

    #[error("{owner}:{feature} was not configured")]
    NotConfigured { owner: String, feature: String },

    // -- processing --------------------------------------------------------
    #[error("{feature} failed: {reason}")]
    Processing { feature: String, reason: String },

    #[error("{feature} was handed content it does not accept (expected {expected})")]
    ContentMismatch { feature: String, expected: String },

    // -- state -------------------------------------------------------------
    #[error("{what} has not been initialized")]
    NotInitialized { what: String },

    #[error("mailbox of entity {entity} is closed")]
    MailboxClosed { entity: String },

    #[error("owner handle has not been attached to {feature}")]
    OwnerMissing { feature: String },

    #[error("{block} entity id counter has exceeded the maximum supported entity count")]
    EntityIdsExhausted { block: IdBlock },
}

impl KernelError {
    /// Shorthand for handlers reporting a failure while processing.
    pub fn processing(feature: impl Into<String>, reason: impl Into<String>) -> Self {
        KernelError::Processing {
            feature: feature.into(),
            reason: reason.into(),
        }
    }

    pub fn not_initialized(what: impl Into<String>) -> Self {
        KernelError::NotInitialized { what: what.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_requirement_names_everything() {
        let err = KernelError::UnresolvedRequirement {
            owner: "BLUE:alpha".into(),
            feature: "Navigator".into(),
            requirement: "terrain".into(),
            specification: "Terrain 1.0.".into(),
        };
        let text = err.to_string();
        assert!(text.contains("BLUE:alpha"));
        assert!(text.contains("Navigator"));
        assert!(text.contains("terrain"));
        assert!(text.contains("Terrain 1.0."));
    }
}
