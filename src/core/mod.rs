// Core modules: record schema, change vocabulary, and error modeling.
pub mod book;
pub mod error;
pub mod event;
