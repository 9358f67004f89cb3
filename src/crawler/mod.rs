pub mod context;
pub mod coordinator;
pub mod fetcher;
pub mod links;
pub mod search;
pub mod task;
pub mod trace;

#[cfg(test)]
pub(crate) mod testing;
