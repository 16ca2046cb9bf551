pub mod engine_backend;
pub mod registry;
pub mod spec;
