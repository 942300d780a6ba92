use super::entity::{EntityBuilder, EntityUpdate};
use crate::core::{AssemblyError, EntityKind, EpochClock, Result, StableIdentity};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Proof of exclusive ownership of one builder.
///
/// Handed out by [`BuilderCache::checkout`] and consumed when the builder is
/// returned or released.
#[must_use = "a checked-out builder must be returned or released"]
#[derive(Debug, PartialEq, Eq)]
pub struct CheckoutToken {
    identity: StableIdentity,
    token: u64,
}

impl CheckoutToken {
    pub fn identity(&self) -> StableIdentity {
        self.identity
    }
}

/// Whether the caller expects further updates for the builder in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnDisposition {
    AwaitMore,
    Complete,
}

#[derive(Debug)]
pub enum ReturnOutcome {
    /// Re-cached, waiting for later passes.
    Cached,
    /// Complete; the caller hands it to the staging queue.
    Staged(EntityBuilder),
    /// Marked deleted; the caller hands it to the deletion handler.
    Deleted(EntityBuilder),
}

enum Slot {
    Idle(EntityBuilder),
    CheckedOut { token: u64 },
}

/// Per-run checkout/merge/return buffer of entity builders.
pub struct BuilderCache {
    slots: Mutex<HashMap<StableIdentity, Slot>>,
    clock: Arc<EpochClock>,
    next_token: AtomicU64,
}

impl BuilderCache {
    pub fn new(clock: Arc<EpochClock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
            next_token: AtomicU64::new(1),
        }
    }

    /// Takes exclusive ownership of the builder for `identity`, creating an
    /// empty one if none is cached.
    ///
    /// A second checkout before the first is returned is a programming error.
    pub fn checkout(
        &self,
        identity: StableIdentity,
        kind: &EntityKind,
    ) -> Result<(CheckoutToken, EntityBuilder)> {
        let mut slots = self.slots.lock()?;
        let builder = match slots.remove(&identity) {
            Some(Slot::CheckedOut { token }) => {
                slots.insert(identity, Slot::CheckedOut { token });
                return Err(AssemblyError::InvariantViolation(format!(
                    "Builder for {} is already checked out",
                    identity
                )));
            }
            Some(Slot::Idle(builder)) => {
                if builder.kind() != kind {
                    let cached_kind = builder.kind().clone();
                    slots.insert(identity, Slot::Idle(builder));
                    return Err(AssemblyError::Merge(format!(
                        "{} is cached as {} but was checked out as {}",
                        identity, cached_kind, kind
                    )));
                }
                builder
            }
            None => EntityBuilder::new(identity, kind.clone(), self.clock.tick()),
        };

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        slots.insert(identity, Slot::CheckedOut { token });
        Ok((CheckoutToken { identity, token }, builder))
    }

    /// Returns a checked-out builder, merging `update` into it.
    ///
    /// A builder marked deleted bypasses the merge. An invalid update leaves
    /// the builder cached unchanged and yields a merge error.
    pub fn return_builder(
        &self,
        token: CheckoutToken,
        mut builder: EntityBuilder,
        update: EntityUpdate,
        disposition: ReturnDisposition,
    ) -> Result<ReturnOutcome> {
        let mut slots = self.slots.lock()?;
        self.verify_token(&slots, &token, &builder)?;

        if builder.is_deleted() {
            slots.remove(&token.identity);
            return Ok(ReturnOutcome::Deleted(builder));
        }

        if let Err(err) = builder.validate(&update) {
            slots.insert(token.identity, Slot::Idle(builder));
            return Err(err);
        }

        builder.apply(update);
        match disposition {
            ReturnDisposition::AwaitMore => {
                slots.insert(token.identity, Slot::Idle(builder));
                Ok(ReturnOutcome::Cached)
            }
            ReturnDisposition::Complete => {
                slots.remove(&token.identity);
                Ok(ReturnOutcome::Staged(builder))
            }
        }
    }

    /// Gives a builder back without merging anything.
    pub fn release(&self, token: CheckoutToken, builder: EntityBuilder) -> Result<()> {
        let mut slots = self.slots.lock()?;
        self.verify_token(&slots, &token, &builder)?;
        slots.insert(token.identity, Slot::Idle(builder));
        Ok(())
    }

    fn verify_token(
        &self,
        slots: &HashMap<StableIdentity, Slot>,
        token: &CheckoutToken,
        builder: &EntityBuilder,
    ) -> Result<()> {
        if builder.identity() != token.identity {
            return Err(AssemblyError::InvariantViolation(format!(
                "Builder {} returned with token for {}",
                builder.identity(),
                token.identity
            )));
        }
        match slots.get(&token.identity) {
            Some(Slot::CheckedOut { token: held }) if *held == token.token => Ok(()),
            _ => Err(AssemblyError::InvariantViolation(format!(
                "Builder for {} returned without a matching checkout",
                token.identity
            ))),
        }
    }

    /// Removes an idle builder so it can be deleted.
    pub fn take_idle(&self, identity: StableIdentity) -> Result<Option<EntityBuilder>> {
        let mut slots = self.slots.lock()?;
        match slots.remove(&identity) {
            Some(Slot::Idle(builder)) => Ok(Some(builder)),
            Some(Slot::CheckedOut { token }) => {
                slots.insert(identity, Slot::CheckedOut { token });
                Err(AssemblyError::InvariantViolation(format!(
                    "Cannot delete {} while its builder is checked out",
                    identity
                )))
            }
            None => Ok(None),
        }
    }

    /// Removes every idle builder with pending changes, in identity order.
    pub fn drain_ready(&self) -> Result<Vec<EntityBuilder>> {
        let mut slots = self.slots.lock()?;
        let ready = slots
            .iter()
            .filter_map(|(identity, slot)| match slot {
                Slot::Idle(builder) if builder.is_dirty() => Some(*identity),
                _ => None,
            })
            .collect::<Vec<_>>();

        let mut builders = ready
            .into_iter()
            .filter_map(|identity| match slots.remove(&identity) {
                Some(Slot::Idle(builder)) => Some(builder),
                _ => None,
            })
            .collect::<Vec<_>>();
        builders.sort_by_key(|builder| builder.identity());
        Ok(builders)
    }

    /// Copies of the idle builders of the given kinds whose subject is
    /// `subject`.
    pub fn idle_dependents(
        &self,
        subject: StableIdentity,
        kinds: &[EntityKind],
    ) -> Result<Vec<EntityBuilder>> {
        let slots = self.slots.lock()?;
        let mut builders = slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Idle(builder)
                    if builder.subject() == Some(subject) && kinds.contains(builder.kind()) =>
                {
                    Some(builder.clone())
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        builders.sort_by_key(|builder| builder.identity());
        Ok(builders)
    }

    /// Re-points the listed idle builders from `old` to `new`. Builders that
    /// are checked out, gone, or no longer point at `old` are left alone.
    pub fn repoint_subject(
        &self,
        old: StableIdentity,
        new: StableIdentity,
        identities: &[StableIdentity],
    ) -> Result<usize> {
        let mut slots = self.slots.lock()?;
        let moved = identities
            .iter()
            .filter_map(|identity| match slots.get_mut(identity) {
                Some(Slot::Idle(builder)) => Some(builder.repoint_subject(old, new)),
                _ => None,
            })
            .filter(|moved| *moved)
            .count();
        Ok(moved)
    }

    pub fn is_cached(&self, identity: StableIdentity) -> bool {
        self.slots
            .lock()
            .map(|slots| slots.contains_key(&identity))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn checked_out(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| {
                slots
                    .values()
                    .filter(|slot| matches!(slot, Slot::CheckedOut { .. }))
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> BuilderCache {
        BuilderCache::new(Arc::new(EpochClock::new()))
    }

    #[test]
    fn test_second_checkout_is_an_invariant_violation() {
        let cache = cache();
        let identity = StableIdentity::new();
        let (token, builder) = cache.checkout(identity, &EntityKind::Encounter).unwrap();

        let err = cache.checkout(identity, &EntityKind::Encounter).unwrap_err();
        assert!(matches!(err, AssemblyError::InvariantViolation(_)));
        assert!(err.is_fatal());

        cache.release(token, builder).unwrap();
        assert!(cache.checkout(identity, &EntityKind::Encounter).is_ok());
    }

    #[test]
    fn test_return_recaches_until_drained() {
        let cache = cache();
        let identity = StableIdentity::new();

        let (token, builder) = cache.checkout(identity, &EntityKind::Encounter).unwrap();
        let outcome = cache
            .return_builder(
                token,
                builder,
                EntityUpdate::new().set("class", json!("INPATIENT")),
                ReturnDisposition::AwaitMore,
            )
            .unwrap();
        assert!(matches!(outcome, ReturnOutcome::Cached));

        let (token, builder) = cache.checkout(identity, &EntityKind::Encounter).unwrap();
        assert_eq!(builder.field("class"), Some(&json!("INPATIENT")));
        cache
            .return_builder(
                token,
                builder,
                EntityUpdate::new().set("status", json!("FINISHED")),
                ReturnDisposition::AwaitMore,
            )
            .unwrap();

        let ready = cache.drain_ready().unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].field("class"), Some(&json!("INPATIENT")));
        assert_eq!(ready[0].field("status"), Some(&json!("FINISHED")));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_complete_disposition_stages_builder() {
        let cache = cache();
        let identity = StableIdentity::new();
        let (token, builder) = cache.checkout(identity, &EntityKind::Problem).unwrap();
        let outcome = cache
            .return_builder(
                token,
                builder,
                EntityUpdate::new().set("code", json!("38341003")),
                ReturnDisposition::Complete,
            )
            .unwrap();

        assert!(matches!(outcome, ReturnOutcome::Staged(ref b) if b.identity() == identity));
        assert!(!cache.is_cached(identity));
    }

    #[test]
    fn test_deleted_builder_bypasses_merge() {
        let cache = cache();
        let identity = StableIdentity::new();
        let (token, mut builder) = cache.checkout(identity, &EntityKind::Encounter).unwrap();
        builder.mark_deleted();

        let outcome = cache
            .return_builder(
                token,
                builder,
                EntityUpdate::new().set("status", json!("FINISHED")),
                ReturnDisposition::AwaitMore,
            )
            .unwrap();
        match outcome {
            ReturnOutcome::Deleted(builder) => assert!(builder.fields().is_empty()),
            other => panic!("expected deleted outcome, got {:?}", other),
        }
        assert!(!cache.is_cached(identity));
    }

    #[test]
    fn test_merge_error_keeps_builder_unchanged() {
        let cache = cache();
        let identity = StableIdentity::new();
        let (token, builder) = cache.checkout(identity, &EntityKind::Encounter).unwrap();
        cache
            .return_builder(
                token,
                builder,
                EntityUpdate::new().set("class", json!("AMB")),
                ReturnDisposition::AwaitMore,
            )
            .unwrap();

        let (token, builder) = cache.checkout(identity, &EntityKind::Encounter).unwrap();
        let err = cache
            .return_builder(
                token,
                builder,
                EntityUpdate::new().set("class", json!("INPATIENT")).with_parent(identity),
                ReturnDisposition::AwaitMore,
            )
            .unwrap_err();
        assert!(matches!(err, AssemblyError::Merge(_)));
        assert_eq!(cache.checked_out(), 0);

        let (_token, builder) = cache.checkout(identity, &EntityKind::Encounter).unwrap();
        assert_eq!(builder.field("class"), Some(&json!("AMB")));
    }

    #[test]
    fn test_deleted_identity_rebuilds_from_scratch() {
        let cache = cache();
        let identity = StableIdentity::new();
        let (token, builder) = cache.checkout(identity, &EntityKind::Encounter).unwrap();
        let first_epoch = builder.born_epoch();
        cache
            .return_builder(
                token,
                builder,
                EntityUpdate::new().set("class", json!("AMB")),
                ReturnDisposition::AwaitMore,
            )
            .unwrap();

        assert!(cache.take_idle(identity).unwrap().is_some());

        let (_token, rebuilt) = cache.checkout(identity, &EntityKind::Encounter).unwrap();
        assert!(rebuilt.fields().is_empty());
        assert!(rebuilt.born_epoch() > first_epoch);
    }

    #[test]
    fn test_take_idle_refuses_checked_out_builder() {
        let cache = cache();
        let identity = StableIdentity::new();
        let (_token, _builder) = cache.checkout(identity, &EntityKind::Encounter).unwrap();
        assert!(matches!(
            cache.take_idle(identity),
            Err(AssemblyError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_kind_mismatch_is_a_merge_error() {
        let cache = cache();
        let identity = StableIdentity::new();
        let (token, builder) = cache.checkout(identity, &EntityKind::Encounter).unwrap();
        cache.release(token, builder).unwrap();
        assert!(matches!(
            cache.checkout(identity, &EntityKind::Problem),
            Err(AssemblyError::Merge(_))
        ));
    }

    #[test]
    fn test_repoint_subject_only_touches_listed_builders() {
        let cache = cache();
        let old = StableIdentity::new();
        let new = StableIdentity::new();
        let mut identities = vec![];
        for kind in [EntityKind::Problem, EntityKind::Episode, EntityKind::Encounter] {
            let identity = StableIdentity::new();
            let (token, builder) = cache.checkout(identity, &kind).unwrap();
            cache
                .return_builder(
                    token,
                    builder,
                    EntityUpdate::new().with_subject(old),
                    ReturnDisposition::AwaitMore,
                )
                .unwrap();
            identities.push(identity);
        }

        let portable = cache
            .idle_dependents(old, &[EntityKind::Problem, EntityKind::Episode])
            .unwrap();
        assert_eq!(portable.len(), 2);
        assert!(portable.iter().all(|builder| builder.kind() != &EntityKind::Encounter));

        assert_eq!(cache.repoint_subject(old, new, &identities[..1]).unwrap(), 1);
        assert_eq!(cache.repoint_subject(old, new, &identities[..1]).unwrap(), 0);
        assert_eq!(cache.idle_dependents(old, &[EntityKind::Problem]).unwrap().len(), 0);
        assert_eq!(cache.idle_dependents(old, &[EntityKind::Episode]).unwrap().len(), 1);
    }
}
