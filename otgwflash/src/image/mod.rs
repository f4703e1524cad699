//! Firmware image formats.

pub mod hex;

pub use hex::{FileStore, HexRecord, ImageStore, LoadError, MemoryImage};
