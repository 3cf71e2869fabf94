use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::policy::Policy;
use crate::policy::PolicyDefaults;
use crate::traits::Storage;
use crate::types::FieldIdentity;

/// What the registry synthesizes a policy from when all fields are cached.
pub(crate) struct Fallback<C> {
    pub(crate) defaults: PolicyDefaults<C>,
    pub(crate) storage:  Arc<dyn Storage>,
}

/// An immutable generation of the field policies.
pub(crate) struct RegistrySnapshot<C> {
    generation: u64,
    policies:   HashMap<FieldIdentity, Arc<Policy<C>>>,
    fallback:   Option<Arc<Fallback<C>>>,
}

#[cfg(test)]
impl<C> RegistrySnapshot<C> {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn len(&self) -> usize {
        self.policies.len()
    }
}

/// Field identity to policy resolution.
///
/// Readers pin the snapshot current at the time of the call; registration and rebuild swap in a new snapshot as a
/// whole, so a call that has already resolved its policy never observes a half-updated registry.
pub(crate) struct PolicyRegistry<C> {
    current: RwLock<Arc<RegistrySnapshot<C>>>,
}

impl<C> PolicyRegistry<C> {
    pub(crate) fn new(fallback: Option<Fallback<C>>) -> Self {
        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot {
                generation: 0,
                policies:   HashMap::new(),
                fallback:   fallback.map(Arc::new),
            })),
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<RegistrySnapshot<C>> {
        Arc::clone(&self.current.read())
    }

    /// `None` means the field isn't cached and has to be invoked directly.
    pub(crate) fn resolve(&self, identity: &FieldIdentity) -> Option<Arc<Policy<C>>> {
        let snapshot = self.snapshot();
        if let Some(policy) = snapshot.policies.get(identity) {
            return Some(Arc::clone(policy));
        }
        snapshot.fallback.as_ref().map(|fallback| {
            Arc::new(Policy::synthesized(
                identity.clone(),
                &fallback.defaults,
                Arc::clone(&fallback.storage),
            ))
        })
    }

    pub(crate) fn insert(&self, policy: Policy<C>) {
        let mut current = self.current.write();
        let mut policies = current.policies.clone();
        policies.insert(policy.identity().clone(), Arc::new(policy));
        *current = Arc::new(RegistrySnapshot {
            generation: current.generation + 1,
            policies,
            fallback: current.fallback.clone(),
        });
    }

    /// Replace the whole field set at once.
    pub(crate) fn replace(&self, policies: Vec<Policy<C>>) -> u64 {
        let mut current = self.current.write();
        let generation = current.generation + 1;
        *current = Arc::new(RegistrySnapshot {
            generation,
            policies: policies
                .into_iter()
                .map(|p| (p.identity().clone(), Arc::new(p)))
                .collect(),
            fallback: current.fallback.clone(),
        });
        generation
    }
}
