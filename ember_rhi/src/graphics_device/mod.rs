/// Graphics device module - the backend-agnostic RHI contract

pub mod graphics_device;
pub mod config;
pub mod buffer;
pub mod texture;
pub mod sampler;
pub mod shader;
pub mod pipeline;
pub mod descriptor;
pub mod command_list;
pub mod window;

pub use graphics_device::*;
pub use config::*;
pub use buffer::*;
pub use texture::*;
pub use sampler::*;
pub use shader::*;
pub use pipeline::*;
pub use descriptor::*;
pub use command_list::*;
pub use window::*;

// Mock graphics device for tests (no GPU required)
#[cfg(test)]
pub mod mock_graphics_device;
