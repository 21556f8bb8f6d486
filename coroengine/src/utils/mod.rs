pub(crate) mod scope_guard;
pub(crate) mod thread;

#[cfg(test)]
pub(crate) mod tracker;
