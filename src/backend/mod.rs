// Backend module - Vulkan bootstrap and one-shot GPU work
//
// Design: Thin wrapper around ash, one owner per Vulkan object

pub mod buffer;
pub mod commands;
pub mod debug_report;
pub mod device;
pub mod instance;

pub use buffer::{HostBuffer, LinearImage};
pub use commands::CommandContext;
pub use device::ComputeDevice;
