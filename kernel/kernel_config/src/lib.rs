//! Compile-time configuration shared by all nexke kernel crates.

#![no_std]

pub mod memory;
pub mod time;
