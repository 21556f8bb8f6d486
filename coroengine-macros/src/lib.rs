#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Entry point macros for coroengine.

mod entry;
mod parse;

/// Runs an async `main` on a freshly built task processor.
///
/// The body is spawned as a critical task and the thread blocks until it
/// finished; the processor is shut down before `main` returns. Other tasks
/// are expected to be spawned from the body.
///
/// # Knobs
///
/// - `worker_threads`: number of worker threads, defaults to the number of
///   CPUs.
/// - `timer_threads`: number of reactor threads serving timers, defaults
///   to 1.
///
/// # Function arguments
///
/// Function arguments are NOT allowed.
///
/// # Usage
///
/// ```no_run
/// #[coroengine::main(worker_threads = 4)]
/// async fn main() {
///     let task = coroengine::spawn(async { 1 + 1 });
///     assert_eq!(task.get().await.unwrap(), 2);
/// }
/// ```
///
/// Equivalent code not using `#[coroengine::main]`
///
/// ```no_run
/// fn main() {
///     coroengine::TaskProcessor::builder()
///         .worker_threads(4)
///         .try_build()
///         .unwrap()
///         .block_on(async {
///             let task = coroengine::spawn(async { 1 + 1 });
///             assert_eq!(task.get().await.unwrap(), 2);
///         })
/// }
/// ```
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Runs an async test on its own task processor.
///
/// Each test builds a processor with a single worker thread unless
/// `worker_threads` says otherwise, the same knobs as [`macro@main`] apply.
/// The body must be `Send + 'static`.
///
/// ```no_run
/// #[coroengine::test(worker_threads = 2)]
/// async fn my_test() -> anyhow::Result<()> {
///     coroengine::time::sleep_for(std::time::Duration::from_millis(1)).await?;
///     Ok(())
/// }
/// ```
///
/// Equivalent code not using `#[coroengine::test]`
///
/// ```no_run
/// #[test]
/// fn my_test() -> anyhow::Result<()> {
///     coroengine::TaskProcessor::builder()
///         .worker_threads(2)
///         .try_build()
///         .unwrap()
///         .block_on(async {
///             coroengine::time::sleep_for(std::time::Duration::from_millis(1)).await?;
///             Ok(())
///         })
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
