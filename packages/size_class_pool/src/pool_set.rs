use std::iter;

use tracing::debug;

use crate::{BOUNDED_CLASS_COUNT, Pool, SizeClass, SizeClassifier};

/// The pools of a registry, organized according to the registry's classifier.
///
/// Pools are created lazily, the first time a block of their size is requested, and are only
/// dropped together with the whole set.
#[derive(Debug)]
pub(crate) enum PoolSet {
    /// One slot per class of [`SizeClassifier::BoundedTable`], indexed directly by class index.
    Table(Box<[Option<Pool>]>),

    /// Pools in creation order, searched by exact block size.
    List(Vec<Pool>),
}

impl PoolSet {
    /// Creates an empty set suitable for the classes produced by `classifier`.
    #[must_use]
    pub(crate) fn for_classifier(classifier: SizeClassifier) -> Self {
        match classifier {
            SizeClassifier::BoundedTable => Self::Table(
                iter::repeat_with(|| None)
                    .take(BOUNDED_CLASS_COUNT)
                    .collect(),
            ),
            SizeClassifier::DynamicList { .. } => Self::List(Vec::new()),
        }
    }

    /// Adds a newly created pool serving `class` to the set and returns it.
    ///
    /// # Panics
    ///
    /// Panics if a pool for `class` already exists, or if a table-organized set receives a class
    /// index beyond the table, which means the class did not come from the bounded classifier.
    pub(crate) fn insert(&mut self, class: SizeClass, pool: Pool) -> &mut Pool {
        assert_eq!(
            pool.block_size(),
            class.block_size(),
            "pool block size must match the block size of its class"
        );

        debug!(
            block_size = class.block_size().get(),
            class_index = class.index(),
            "pool created"
        );

        match self {
            Self::Table(slots) => {
                let slot = slots.get_mut(class.index()).unwrap_or_else(|| {
                    panic!(
                        "class index {} is outside the table of {BOUNDED_CLASS_COUNT} classes",
                        class.index()
                    )
                });

                assert!(
                    slot.is_none(),
                    "pool for {} byte blocks already exists",
                    class.block_size()
                );

                slot.insert(pool)
            }
            Self::List(pools) => {
                assert!(
                    pools
                        .iter()
                        .all(|existing| existing.block_size() != class.block_size()),
                    "pool for {} byte blocks already exists",
                    class.block_size()
                );

                pools.push(pool);

                pools
                    .last_mut()
                    .expect("we just pushed a pool so the list cannot be empty")
            }
        }
    }

    /// Returns the pool serving `class` if it has been created.
    #[must_use]
    pub(crate) fn get_mut(&mut self, class: SizeClass) -> Option<&mut Pool> {
        match self {
            Self::Table(slots) => slots.get_mut(class.index())?.as_mut(),
            Self::List(pools) => pools
                .iter_mut()
                .find(|pool| pool.block_size() == class.block_size()),
        }
    }

    /// Number of pools created so far.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.iter().count()
    }

    pub(crate) fn iter(&self) -> Box<dyn Iterator<Item = &Pool> + '_> {
        match self {
            Self::Table(slots) => Box::new(slots.iter().flatten()),
            Self::List(pools) => Box::new(pools.iter()),
        }
    }

    pub(crate) fn iter_mut(&mut self) -> Box<dyn Iterator<Item = &mut Pool> + '_> {
        match self {
            Self::Table(slots) => Box::new(slots.iter_mut().flatten()),
            Self::List(pools) => Box::new(pools.iter_mut()),
        }
    }
}

#[cfg(test)]
mod tests {
    use new_zealand::nz;

    use super::*;

    #[test]
    fn table_starts_with_empty_slots() {
        let set = PoolSet::for_classifier(SizeClassifier::BoundedTable);

        match &set {
            PoolSet::Table(slots) => assert_eq!(slots.len(), BOUNDED_CLASS_COUNT),
            PoolSet::List(_) => panic!("bounded classifier must use a table"),
        }

        assert_eq!(set.len(), 0);
    }

    fn insert_fresh(set: &mut PoolSet, class: SizeClass) -> usize {
        set.insert(class, Pool::new(class.block_size()))
            .block_size()
            .get()
    }

    #[test]
    fn table_holds_pool_per_class() {
        let classifier = SizeClassifier::BoundedTable;
        let mut set = PoolSet::for_classifier(classifier);

        let class = classifier.bytes_to_class(100).unwrap();
        assert!(set.get_mut(class).is_none());

        assert_eq!(insert_fresh(&mut set, class), 104);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get_mut(class).unwrap().block_size().get(), 104);

        // Any request in the same class finds the same pool.
        let same_class = classifier.bytes_to_class(97).unwrap();
        assert!(set.get_mut(same_class).is_some());

        let other = classifier.bytes_to_class(4000).unwrap();
        assert_eq!(insert_fresh(&mut set, other), 4032);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn list_searches_by_block_size() {
        let classifier = SizeClassifier::dynamic_list(nz!(16));
        let mut set = PoolSet::for_classifier(classifier);

        assert!(matches!(set, PoolSet::List(_)));

        let small = classifier.bytes_to_class(10).unwrap();
        let large = classifier.bytes_to_class(1_000_000).unwrap();

        assert_eq!(insert_fresh(&mut set, small), 16);
        assert_eq!(insert_fresh(&mut set, large), 1_000_000);
        assert_eq!(set.len(), 2);

        assert_eq!(set.get_mut(small).unwrap().block_size().get(), 16);
        assert_eq!(set.get_mut(large).unwrap().block_size().get(), 1_000_000);

        let unseen = classifier.bytes_to_class(33).unwrap();
        assert!(set.get_mut(unseen).is_none());
    }

    #[test]
    #[should_panic]
    fn table_rejects_duplicate_pool() {
        let classifier = SizeClassifier::BoundedTable;
        let mut set = PoolSet::for_classifier(classifier);
        let class = classifier.bytes_to_class(64).unwrap();

        insert_fresh(&mut set, class);
        insert_fresh(&mut set, class);
    }

    #[test]
    #[should_panic]
    fn list_rejects_duplicate_pool() {
        let classifier = SizeClassifier::dynamic_list(nz!(8));
        let mut set = PoolSet::for_classifier(classifier);
        let class = classifier.bytes_to_class(64).unwrap();

        insert_fresh(&mut set, class);
        insert_fresh(&mut set, class);
    }

    #[test]
    #[should_panic]
    fn pool_must_match_class() {
        let classifier = SizeClassifier::BoundedTable;
        let mut set = PoolSet::for_classifier(classifier);
        let class = classifier.bytes_to_class(64).unwrap();

        set.insert(class, Pool::new(nz!(128)));
    }

    #[test]
    fn iteration_visits_created_pools() {
        let classifier = SizeClassifier::BoundedTable;
        let mut set = PoolSet::for_classifier(classifier);

        for bytes in [8, 16, 700] {
            insert_fresh(&mut set, classifier.bytes_to_class(bytes).unwrap());
        }

        let mut block_sizes: Vec<_> = set.iter().map(|pool| pool.block_size().get()).collect();
        block_sizes.sort_unstable();
        assert_eq!(block_sizes, [8, 16, 704]);

        assert_eq!(set.iter_mut().count(), 3);
    }
}
