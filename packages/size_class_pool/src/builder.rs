use std::alloc::GlobalAlloc;
use std::cell::Cell;
use std::marker::PhantomData;

use crate::{DefaultUpstream, DropPolicy, PoolRegistry, SizeClassifier};

/// Builder for creating an instance of [`PoolRegistry`].
///
/// All settings are optional. By default, the registry uses [`SizeClassifier::BoundedTable`],
/// [`DropPolicy::MayDropBlocks`] and obtains chunks from [`DefaultUpstream`].
///
/// # Examples
///
/// ```
/// use std::alloc::System;
/// use std::num::NonZero;
///
/// use size_class_pool::{DropPolicy, PoolRegistry, SizeClassifier};
///
/// // Default registry.
/// let registry = PoolRegistry::builder().build();
///
/// // Unbounded sizes in 16-byte steps, chunks from the system allocator.
/// let registry = PoolRegistry::builder()
///     .classifier(SizeClassifier::dynamic_list(NonZero::new(16).unwrap()))
///     .drop_policy(DropPolicy::MustNotDropBlocks)
///     .upstream(System)
///     .build();
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) if the upstream provider is, so configuration can
/// happen on a different thread than the one that uses the registry. It is not thread-safe
/// ([`Sync`]) as it contains mutable configuration state.
#[derive(Debug)]
#[must_use]
pub struct PoolRegistryBuilder<B = DefaultUpstream> {
    classifier: SizeClassifier,
    drop_policy: DropPolicy,
    upstream: B,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl PoolRegistryBuilder {
    pub(crate) fn new() -> Self {
        Self {
            classifier: SizeClassifier::default(),
            drop_policy: DropPolicy::default(),
            upstream: DefaultUpstream,
            _not_sync: PhantomData,
        }
    }
}

impl<B: GlobalAlloc> PoolRegistryBuilder<B> {
    /// Sets the [size classifier][SizeClassifier], which decides both how requests are rounded
    /// to block sizes and how the registry organizes its pools.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::num::NonZero;
    ///
    /// use size_class_pool::{PoolRegistry, SizeClassifier};
    ///
    /// let registry = PoolRegistry::builder()
    ///     .classifier(SizeClassifier::dynamic_list(NonZero::new(64).unwrap()))
    ///     .build();
    ///
    /// assert!(registry.max_block_size() > 8192);
    /// ```
    pub fn classifier(mut self, classifier: SizeClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the registry. This governs how to treat blocks
    /// that are still handed out when the registry is torn down.
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Sets the upstream provider that chunks are obtained from and eventually returned to.
    ///
    /// The registry never requests or releases less than one full chunk at a time.
    pub fn upstream<U: GlobalAlloc>(self, upstream: U) -> PoolRegistryBuilder<U> {
        PoolRegistryBuilder {
            classifier: self.classifier,
            drop_policy: self.drop_policy,
            upstream,
            _not_sync: PhantomData,
        }
    }

    /// Builds the registry with the specified configuration.
    ///
    /// No memory is obtained from the upstream provider until the first allocation.
    #[must_use]
    pub fn build(self) -> PoolRegistry<B> {
        PoolRegistry::new_inner(self.classifier, self.drop_policy, self.upstream)
    }
}

#[cfg(test)]
mod tests {
    use std::alloc::System;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::MockUpstream;

    assert_impl_all!(PoolRegistryBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(PoolRegistryBuilder: Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = PoolRegistryBuilder::new();

        assert_eq!(builder.classifier, SizeClassifier::BoundedTable);
        assert_eq!(builder.drop_policy, DropPolicy::MayDropBlocks);
    }

    #[test]
    fn classifier_sets_classifier() {
        let classifier = SizeClassifier::dynamic_list(nz!(32));
        let builder = PoolRegistryBuilder::new().classifier(classifier);

        assert_eq!(builder.classifier, classifier);
    }

    #[test]
    fn drop_policy_can_be_overridden() {
        let builder = PoolRegistryBuilder::new()
            .drop_policy(DropPolicy::MustNotDropBlocks)
            .drop_policy(DropPolicy::MayDropBlocks);

        assert_eq!(builder.drop_policy, DropPolicy::MayDropBlocks);
    }

    #[test]
    fn upstream_keeps_other_settings() {
        let classifier = SizeClassifier::dynamic_list(nz!(8));
        let builder = PoolRegistryBuilder::new()
            .classifier(classifier)
            .drop_policy(DropPolicy::MustNotDropBlocks)
            .upstream(System);

        assert_eq!(builder.classifier, classifier);
        assert_eq!(builder.drop_policy, DropPolicy::MustNotDropBlocks);
    }

    #[test]
    fn build_obtains_no_memory() {
        let mut upstream = MockUpstream::new();
        upstream.expect_alloc().never();
        upstream.expect_dealloc().never();

        let registry = PoolRegistryBuilder::new().upstream(upstream).build();

        assert_eq!(registry.pool_count(), 0);
        assert_eq!(registry.chunk_count(), 0);
    }

    #[test]
    fn builder_send_trait() {
        let builder = PoolRegistryBuilder::new().classifier(SizeClassifier::dynamic_list(nz!(16)));
        let handle = std::thread::spawn(move || builder.classifier);

        assert_eq!(
            handle.join().expect("thread completed successfully"),
            SizeClassifier::dynamic_list(nz!(16))
        );
    }
}
