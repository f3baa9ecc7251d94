//! Host implementations that live inside this process

pub mod memory;

pub use memory::{Fault, FaultEffect, InMemoryHost, StoredCase};
