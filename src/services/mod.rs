// Services module - business logic layer

pub mod classifier;
pub mod http;
pub mod identifier;
pub mod image_ops;
pub mod persistence;

// Metadata sources
pub mod metadata;
pub mod sites;
