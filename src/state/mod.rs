//! Durable state: the task store and its atomic write primitive.

pub mod atomic;
mod store;

pub use store::TaskStore;
