pub mod events;
pub mod stats;
