pub mod settings;
pub mod task;
