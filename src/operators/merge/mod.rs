//! Merge Many Operator
//!
//! Fans a dynamic set of parents into one keyed collection. Every parent
//! contributes the items of its own child stream; when several parents
//! contribute the same child key, exactly one of them is visible downstream
//! and the others wait, hidden, until they win the ranking.

mod operator;
mod options;
mod registry;

use std::sync::Arc;

use crate::change::{Key, Value};
use crate::stream::ChangeStream;

use operator::{ChildFactory, MergeShared};

pub use options::{Comparer, MergeOptions};

/// Operator name reported in callback errors.
pub(crate) const OPERATOR: &str = "merge_many_change_sets";

// == Merge Many Change Sets ==
/// Merges the child streams of every parent in `parents`.
///
/// `child_factory` is called once per parent Add (and again per Update) with
/// the parent value and key. An `Err` from it terminates the output.
///
/// The output completes once `parents` and every child stream still
/// subscribed have completed. Any error from a live parent or child
/// terminates the output; children of removed parents are never heard from.
pub fn merge_many_change_sets<PK, P, CK, C, F>(
    parents: &ChangeStream<PK, P>,
    child_factory: F,
    options: MergeOptions<P, C>,
) -> ChangeStream<CK, C>
where
    PK: Key,
    P: Value,
    CK: Key,
    C: Value,
    F: Fn(&P, &PK) -> anyhow::Result<ChangeStream<CK, C>> + Send + Sync + 'static,
{
    let parents = parents.clone();
    let factory: ChildFactory<P, PK, CK, C> = Arc::new(child_factory);

    ChangeStream::new(move |observer| {
        MergeShared::start(&parents, Arc::clone(&factory), options.clone(), observer)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceCache;
    use crate::change::ChangeReason;
    use crate::testing::ChangeSetAggregator;

    #[derive(Debug, Clone, PartialEq)]
    struct Owner {
        id: u32,
        rating: u32,
    }

    type Pets = Arc<SourceCache<&'static str, (&'static str, u32)>>;

    fn pets() -> Pets {
        Arc::new(SourceCache::new(|p: &(&'static str, u32)| p.0))
    }

    #[test]
    fn test_merges_children_of_every_parent() {
        let owners = SourceCache::new(|o: &Owner| o.id);
        let (a, b) = (pets(), pets());
        a.add_or_update(("rex", 1)).unwrap();
        b.add_or_update(("tom", 2)).unwrap();

        let children = [(1, a.clone()), (2, b.clone())];
        let merged = merge_many_change_sets(
            &owners.connect(),
            move |_: &Owner, id: &u32| {
                let (_, cache) = children
                    .iter()
                    .find(|(key, _)| key == id)
                    .ok_or_else(|| anyhow::anyhow!("no pets for {id}"))?;
                Ok(cache.connect())
            },
            MergeOptions::new(),
        );
        let results = ChangeSetAggregator::new(&merged);

        owners
            .add_or_update_many([Owner { id: 1, rating: 0 }, Owner { id: 2, rating: 0 }])
            .unwrap();

        // Both child snapshots land in the parent's batch
        assert_eq!(results.messages().len(), 1);
        assert_eq!(results.data().len(), 2);
    }

    #[test]
    fn test_hidden_update_is_silent() {
        let owners = SourceCache::new(|o: &Owner| o.id);
        let (a, b) = (pets(), pets());
        a.add_or_update(("rex", 1)).unwrap();
        b.add_or_update(("rex", 2)).unwrap();

        let (ca, cb) = (a.clone(), b.clone());
        let merged = merge_many_change_sets(
            &owners.connect(),
            move |owner: &Owner, _: &u32| Ok(if owner.id == 1 { ca.connect() } else { cb.connect() }),
            MergeOptions::new(),
        );
        let results = ChangeSetAggregator::new(&merged);
        owners.add_or_update(Owner { id: 1, rating: 0 }).unwrap();
        owners.add_or_update(Owner { id: 2, rating: 0 }).unwrap();

        b.add_or_update(("rex", 3)).unwrap();

        assert_eq!(results.messages().len(), 1);
        assert_eq!(results.data().get("rex"), Some(&("rex", 1)));
    }

    #[test]
    fn test_factory_error_terminates() {
        let owners = SourceCache::new(|o: &Owner| o.id);
        let merged = merge_many_change_sets(
            &owners.connect(),
            |_: &Owner, _: &u32| -> anyhow::Result<ChangeStream<&'static str, (&'static str, u32)>> {
                Err(anyhow::anyhow!("factory down"))
            },
            MergeOptions::new(),
        );
        let results = ChangeSetAggregator::new(&merged);

        owners.add_or_update(Owner { id: 1, rating: 0 }).unwrap();

        assert!(results.error().is_some());
        assert!(!results.is_completed());
    }

    #[test]
    fn test_child_refresh_of_visible_is_forwarded() {
        let owners = SourceCache::new(|o: &Owner| o.id);
        let a = pets();
        a.add_or_update(("rex", 1)).unwrap();

        let ca = a.clone();
        let merged = merge_many_change_sets(
            &owners.connect(),
            move |_: &Owner, _: &u32| Ok(ca.connect()),
            MergeOptions::new(),
        );
        let results = ChangeSetAggregator::new(&merged);
        owners.add_or_update(Owner { id: 1, rating: 0 }).unwrap();

        a.refresh(&"rex").unwrap();

        let last = results.messages().last().cloned().unwrap();
        assert_eq!(last.iter().next().map(|c| c.reason()), Some(ChangeReason::Refresh));
    }
}
