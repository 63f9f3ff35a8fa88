//! Thin, stateful Vulkan abstraction: opaque generation-tagged handles,
//! a single global bindless descriptor table, and a fixed-depth frame
//! pipeline driven by one timeline semaphore.

pub mod gpu;
