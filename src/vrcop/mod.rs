// MIT License - Copyright (c) 2026 Peter Wright

//! Leviton VRCOP Z-Wave bridge driver (ASCII lines over serial).

pub mod codec;
pub mod dispatch;
pub mod driver;
pub mod engine;
pub mod protocol;
pub mod scan;

pub use driver::VrcopDriver;
