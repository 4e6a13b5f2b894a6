//! Property tests for create/delete behaviour.

use proptest::collection::btree_set;
use proptest::prelude::*;
use record_facade::{PersistenceFacade, Query, StoreConfig, Timestamp};

fn facade() -> PersistenceFacade {
    PersistenceFacade::open(StoreConfig::in_memory()).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Creating an absent timestamp makes exactly one matching record appear.
    #[test]
    fn prop_create_then_fetch(existing in btree_set(any::<i64>(), 0..20), new in any::<i64>()) {
        prop_assume!(!existing.contains(&new));

        let facade = facade();
        for ts in &existing {
            facade.create(Timestamp(*ts)).unwrap();
        }
        facade.create(Timestamp(new)).unwrap();

        let items = facade.items(Query::All).unwrap();
        prop_assert_eq!(items.iter().filter(|r| r.timestamp == Timestamp(new)).count(), 1);
        prop_assert_eq!(items.len(), existing.len() + 1);
        prop_assert!(items.windows(2).all(|w| w[0].timestamp > w[1].timestamp));
    }

    /// Deleting twice never errors, whether or not the record existed.
    #[test]
    fn prop_delete_is_idempotent(existing in btree_set(0i64..50, 0..20), target in 0i64..50) {
        let facade = facade();
        for ts in &existing {
            facade.create(Timestamp(*ts)).unwrap();
        }

        facade.delete(Timestamp(target)).unwrap();
        facade.delete(Timestamp(target)).unwrap();

        let items = facade.items(Query::All).unwrap();
        let expected = existing.len() - usize::from(existing.contains(&target));
        prop_assert_eq!(items.len(), expected);
        prop_assert!(items.iter().all(|r| r.timestamp != Timestamp(target)));
    }

    /// The last snapshot a watch sees always equals a fresh fetch.
    #[test]
    fn prop_watch_tracks_store(ops in proptest::collection::vec((any::<bool>(), 0i64..10), 1..40)) {
        let facade = facade();
        let mut watch = facade.watch(Query::All).unwrap();

        for (create, ts) in ops {
            if create {
                // Collisions are expected here and rejected by the store
                let _ = facade.create(Timestamp(ts));
            } else {
                facade.delete(Timestamp(ts)).unwrap();
            }
        }

        let last = std::iter::from_fn(|| watch.try_next()).last().unwrap();
        prop_assert_eq!(last, facade.items(Query::All).unwrap());
    }
}
