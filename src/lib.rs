// =============================================================================
// FURNACE - Explicit GPU abstraction over Vulkan
// =============================================================================
//
// A thin, explicit layer: versioned handles into object registries, one
// bindless descriptor heap with free-list/linear/ring regions, per-frame
// upload memory, three command queues with timeline fences, and a command
// context that batches barriers and replays cached state on draw.
//
// FRAME FLOW:
// 1. Device::begin_frame waits for the recycled frame slot's fence,
//    reclaims its upload pages and descriptors, acquires a backbuffer
// 2. Record through the `cmd` functions into the frame's CommandContext
// 3. Device::end_frame submits, signals the frame fence, presents
//
// There is no background thread and no global state; the Device value owns
// everything and recording is single-threaded by construction.

pub mod cmd;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod handle;
pub mod pipeline;
pub mod queue;
pub mod resource;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod types;
pub mod upload;

pub use config::{GpuConfig, PresentModePreference};
pub use context::CommandContext;
pub use device::Device;
pub use handle::{BufferHandle, PsoHandle, ResourceHandle, ShaderHandle, TextureHandle};
pub use queue::{FenceValue, QueueType};
pub use types::{
    BlendDesc, BufferDesc, BufferFlags, ClearValue, ComputePsoDesc, DepthStencilDesc, Format,
    GraphicsPsoDesc, IndexedDrawArguments, RasterizerDesc, ResourceState, ShaderType, TextureDesc,
    TextureUsageFlags, VertexDeclEntry, VertexLayout, VertexSemantic,
};
