//! Compile-time check that the indexes can be shared across worker threads

use crate::arena::GrowableArena;
use crate::config::StorageConfig;
use crate::hash_index::test_policy::IdentityPolicy;
use crate::hash_index::{ParallelHashIndex, SequentialHashIndex};
use crate::memory_budget::MemoryBudget;
use crate::one_key_index::OneKeyIndex;
use crate::test_utils::MemoryTripleList;
use crate::three_keys::ThreeKeysIndex;
use crate::two_keys::{TwoKeysGroupIndex, TwoKeysGroupProxy, TwoKeysPairIndex};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use triplex_types::ResourceComponent;

fn assert_send_sync<T: Send + Sync>(_t: &T) {}

fn _test_send_sync_bounds() {
    let budget = Arc::new(MemoryBudget::unlimited());
    let config = StorageConfig::default();
    let store = Arc::new(MemoryTripleList::new(budget.clone(), 1).unwrap());

    assert_send_sync(&GrowableArena::<AtomicU64>::new(budget.clone(), 0));
    assert_send_sync(&OneKeyIndex::new(budget.clone()));
    assert_send_sync(&SequentialHashIndex::new(IdentityPolicy, budget.clone(), 0.7));
    assert_send_sync(&ParallelHashIndex::new(IdentityPolicy, budget.clone(), 0.7, 4));
    assert_send_sync(&ThreeKeysIndex::new(store.clone(), budget.clone(), &config));
    assert_send_sync(&TwoKeysGroupIndex::new(
        store.clone(),
        ResourceComponent::S,
        ResourceComponent::P,
        budget.clone(),
    ));
    assert_send_sync(&TwoKeysPairIndex::new(
        store.clone(),
        ResourceComponent::P,
        ResourceComponent::O,
        budget.clone(),
        &config,
    ));
    assert_send_sync(&TwoKeysGroupProxy::new(
        store,
        ResourceComponent::O,
        ResourceComponent::S,
        budget,
        &config,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components_are_send_sync() {
        _test_send_sync_bounds();
    }
}
