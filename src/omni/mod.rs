// MIT License - Copyright (c) 2026 Peter Wright

//! HAI Omni security panel driver (encrypted Omni-Link style TCP).

pub mod codec;
pub mod dispatch;
pub mod driver;
pub mod engine;
pub mod protocol;
pub mod session;

pub use driver::OmniDriver;
