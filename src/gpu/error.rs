// Error taxonomy
//
// Capability absence and native call failures are fatal and surfaced to the
// caller; neither is retried internally. The transient "recreate the
// swapchain" signal is a separate status value, never an error. Contract
// violations (stale handles, mismatched push ranges) panic.

use ash::vk;
use thiserror::Error;

pub type Result<T, E = GpuError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum GpuError {
    /// The device, surface, or memory layout cannot satisfy a requirement.
    #[error("missing capability: {0}")]
    MissingCapability(String),

    /// A native API call failed; carries the originating call name.
    #[error("{call} failed: {result:?}")]
    Native {
        call: &'static str,
        result: vk::Result,
    },

    #[error("failed to load Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("shader reflection failed: {0}")]
    Reflection(String),
}

/// Wrap a native result with the name of the call that produced it.
pub(crate) trait VkCall<T> {
    fn vk_call(self, call: &'static str) -> Result<T>;
}

impl<T> VkCall<T> for std::result::Result<T, vk::Result> {
    fn vk_call(self, call: &'static str) -> Result<T> {
        self.map_err(|result| GpuError::Native { call, result })
    }
}

/// Non-fatal presentation status returned by begin/end frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStatus {
    Ok,
    /// The swapchain is stale (resize, out-of-date). The caller must skip
    /// drawing for this iteration and call `recreate_swapchain` before retrying.
    NeedsRecreate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_error_names_the_call() {
        let err: Result<()> = Err(vk::Result::ERROR_DEVICE_LOST).vk_call("vkQueueSubmit");
        let msg = err.unwrap_err().to_string();
        assert!(msg.contains("vkQueueSubmit"));
        assert!(msg.contains("ERROR_DEVICE_LOST"));
    }

    #[test]
    fn capability_error_is_distinct_from_native() {
        let err = GpuError::MissingCapability("no device-local memory type".into());
        assert!(matches!(err, GpuError::MissingCapability(_)));
    }
}
