use ash::vk;
use thiserror::Error;

/// Fatal bring-up failures. The caller receives one of these and all
/// partially constructed handles have already been released in reverse
/// creation order.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("required instance layer not available: {0}")]
    MissingLayer(String),
    #[error("required instance extension not available: {0}")]
    MissingExtension(String),
    #[error("no suitable physical device (swapchain-capable with graphics + present queues)")]
    NoSuitableDevice,
}

/// Error kinds surfaced by the core. Swapchain out-of-date/suboptimal
/// conditions are recovered internally by the context state machine and
/// never appear here.
#[derive(Debug, Error)]
pub enum GfxError {
    #[error(transparent)]
    Init(#[from] InitError),
    /// All staging slots busy after the bounded acquire spin; transient,
    /// retry next tick.
    #[error("staging ring exhausted")]
    TransferExhausted,
    #[error("asset not found: {0}")]
    AssetNotFound(String),
    #[error("asset codec failure: {0}")]
    AssetCodec(String),
    #[error("shader compilation failed: {0}")]
    ShaderCompile(String),
    /// Fatal; the core drains what it can and refuses further submissions.
    #[error("device lost")]
    DeviceLost,
    #[error("vulkan error: {0}")]
    Vk(#[from] vk::Result),
}
