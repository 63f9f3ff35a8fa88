// GPU abstraction layer
//
// One device, one queue, one bindless descriptor set. Callers hold opaque
// generation-tagged handles into per-kind resource pools and record into
// an implicit current frame; native Vulkan objects stay inside this
// module tree (formats and present modes are the deliberate exceptions).

pub mod barrier;
pub mod buffer;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod handle;
pub mod image;
pub mod immediate;
pub mod pipeline;
pub mod shader;
pub mod swapchain;

pub use barrier::ResourceAccess;
pub use buffer::{Buffer, BufferDesc, BufferUsage, MemoryUsage};
pub use context::{Gpu, GpuConfig, IndexKind, PassDesc};
pub use error::{GpuError, Result, SwapchainStatus};
pub use frame::{Frame, FrameStatus, FRAMES_IN_FLIGHT};
pub use handle::Handle;
pub use image::{Image, ImageDesc, ImageUsage};
pub use pipeline::{Pipeline, PipelineDesc};
pub use shader::Shader;
