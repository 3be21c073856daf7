pub mod classify;
pub mod domain;
pub mod janitor;
pub mod patches;
pub mod publisher;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod traits;
pub mod workspace;
