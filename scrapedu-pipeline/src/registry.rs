//! Phase definitions and handler lookup.
//!
//! The registry is built once at startup and is read-only afterwards. Every
//! [`Phase`] resolves to a handler; phases nobody registered resolve to
//! [`Unconfigured`], which skips without touching the network.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use scrapedu_core::{Entity, Phase};

use crate::context::PhaseContext;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of one handler attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed { reason: String, retryable: bool },
    /// Nothing to do; recorded as done with the reason kept.
    Skipped(String),
}

impl Outcome {
    /// Network trouble, timeouts, HTTP 429 and 5xx.
    pub fn transient(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
            retryable: true,
        }
    }

    /// Access denied, not found, unparseable.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
            retryable: false,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped(reason.into())
    }
}

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn execute(&self, entity: &Entity, ctx: &PhaseContext) -> Outcome;

    /// Network-bound handlers get a rate-limiter slot for the entity's host
    /// before every attempt.
    fn network_bound(&self) -> bool {
        true
    }
}

/// Handler used for phases with nothing registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

pub const UNCONFIGURED_REASON: &str = "no handler configured";

#[async_trait]
impl PhaseHandler for Unconfigured {
    async fn execute(&self, _entity: &Entity, _ctx: &PhaseContext) -> Outcome {
        Outcome::skipped(UNCONFIGURED_REASON)
    }

    fn network_bound(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PhaseDefinition {
    pub phase: Phase,
    pub handler: Arc<dyn PhaseHandler>,
}

impl fmt::Debug for PhaseDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseDefinition")
            .field("phase", &self.phase)
            .field("network_bound", &self.handler.network_bound())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PhaseRegistry {
    definitions: Vec<PhaseDefinition>,
}

impl PhaseRegistry {
    pub fn builder() -> PhaseRegistryBuilder {
        PhaseRegistryBuilder::default()
    }

    /// Definitions in execution order, restricted to `scope` when given.
    pub fn ordered<'a>(
        &'a self,
        scope: Option<&'a [Phase]>,
    ) -> impl Iterator<Item = &'a PhaseDefinition> + 'a {
        self.definitions
            .iter()
            .filter(move |d| scope.map_or(true, |s| s.contains(&d.phase)))
    }

    pub fn get(&self, phase: Phase) -> Option<&PhaseDefinition> {
        self.definitions.iter().find(|d| d.phase == phase)
    }
}

#[derive(Default)]
pub struct PhaseRegistryBuilder {
    handlers: BTreeMap<Phase, Arc<dyn PhaseHandler>>,
}

impl PhaseRegistryBuilder {
    /// Register `handler` for `phase`, replacing any earlier registration.
    pub fn register(mut self, phase: Phase, handler: Arc<dyn PhaseHandler>) -> Self {
        self.handlers.insert(phase, handler);
        self
    }

    pub fn build(mut self) -> PhaseRegistry {
        let definitions = Phase::ALL
            .into_iter()
            .map(|phase| {
                let handler = self.handlers.remove(&phase).unwrap_or_else(|| {
                    tracing::debug!(%phase, "no handler registered, phase will be skipped");
                    Arc::new(Unconfigured) as Arc<dyn PhaseHandler>
                });
                PhaseDefinition { phase, handler }
            })
            .collect();
        PhaseRegistry { definitions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysDone;

    #[async_trait]
    impl PhaseHandler for AlwaysDone {
        async fn execute(&self, _entity: &Entity, _ctx: &PhaseContext) -> Outcome {
            Outcome::Done
        }
    }

    #[test]
    fn every_phase_resolves_in_order() {
        let registry = PhaseRegistry::builder()
            .register(Phase::Catalog, Arc::new(AlwaysDone))
            .build();
        let phases: Vec<Phase> = registry.ordered(None).map(|d| d.phase).collect();
        assert_eq!(phases, Phase::ALL.to_vec());
        assert!(registry.get(Phase::Catalog).expect("catalog").handler.network_bound());
        assert!(!registry.get(Phase::Robots).expect("robots").handler.network_bound());
    }

    #[test]
    fn ordered_respects_scope_but_keeps_registry_order() {
        let registry = PhaseRegistry::builder().build();
        let scope = [Phase::Syllabi, Phase::Robots];
        let phases: Vec<Phase> = registry.ordered(Some(&scope)).map(|d| d.phase).collect();
        assert_eq!(phases, vec![Phase::Robots, Phase::Syllabi]);
    }

    #[test]
    fn outcome_helpers() {
        assert_eq!(
            Outcome::transient("HTTP 503"),
            Outcome::Failed {
                reason: "HTTP 503".into(),
                retryable: true
            }
        );
        assert!(matches!(
            Outcome::permanent("HTTP 404"),
            Outcome::Failed { retryable: false, .. }
        ));
    }
}
