//! Data model for items flowing between nodes

pub mod item;

pub use item::{BinaryRef, ErrorRecord, Item, NodeOutput, PairedItem};
