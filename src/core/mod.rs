pub mod backend;
pub mod events;
pub mod filename;
pub mod health;
pub mod http_backend;
pub mod http_client;
pub mod manager;
pub mod progress;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod sse;

#[cfg(test)]
pub(crate) mod test_support;
