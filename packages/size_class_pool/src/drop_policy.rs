/// Determines how a registry treats blocks that are still handed out when it is torn down.
///
/// Teardown always returns every chunk to the upstream provider. Blocks still handed out at that
/// point become dangling, which is a bug in the calling code if anything still uses them.
///
/// # Examples
///
/// ```
/// use size_class_pool::{DropPolicy, PoolRegistry};
///
/// let registry = PoolRegistry::builder()
///     .drop_policy(DropPolicy::MustNotDropBlocks)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The registry may be torn down while blocks are still handed out. This is the default.
    #[default]
    MayDropBlocks,

    /// The registry will panic if it is torn down while blocks are still handed out.
    ///
    /// The chunks are returned to the upstream provider before the panic. This is useful to
    /// catch leaks in code that is expected to return every block before the last handle to
    /// the registry is dropped.
    MustNotDropBlocks,
}
