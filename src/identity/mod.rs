// src/identity/mod.rs

pub mod remap;

pub use remap::IdentityRemapTable;
