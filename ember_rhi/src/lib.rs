/*!
# Ember RHI

Backend-agnostic Render Hardware Interface for the Ember renderer.

This crate defines the contract a GPU backend implements (see `ember_rhi_vulkan`)
using trait objects, plus the pieces shared by every backend: error type,
logging, configuration, the engine singleton and the render system.

## Architecture

- **GraphicsDevice**: resource factory and frame lifecycle
- **Buffer / Texture / Sampler / Shader / Pipeline**: resource traits
- **DescriptorSetLayout / DescriptorSet**: resource binding
- **CommandList**: command recording with dynamic rendering
- **RenderSystem**: runs one frame per tick through a render callback
- **DefaultResources**: fallback textures and sampler
*/

// Internal modules
mod error;
mod engine;
mod default_resources;
mod render_system;
pub mod log;
pub mod graphics_device;

// Main ember namespace module
pub mod ember {
    // Error types
    pub use crate::error::{Error, Result};

    // Engine singleton
    pub use crate::engine::Engine;

    // Device trait and frame-level helpers
    pub use crate::graphics_device::{GraphicsDevice, GraphicsDeviceConfig, FrameBegin};
    pub use crate::default_resources::DefaultResources;
    pub use crate::render_system::{RenderSystem, FrameContext, RenderCallback};

    // Logging sub-module (types; the engine_* macros live at the crate root)
    pub mod log {
        pub use crate::log::{Logger, LogEntry, LogSeverity, DefaultLogger, format_entry};
    }

    // Render sub-module with all RHI types
    pub mod render {
        pub use crate::graphics_device::*;
    }
}
