/*! Vulkan frame-lifecycle core: device bring-up, VRAM suballocation with a
 * staged transfer ring, swapchain lifecycle against a resizing surface,
 * virtual-frame scheduling, and a hot-reloading resource store.
 *
 * Windowing, input, and asset decoding are external collaborators; they are
 * consumed only through the narrow interfaces in [`window`] and the codec
 * callbacks on store factories.
 */

pub mod config;
pub mod deferred;
pub mod error;
pub mod renderer;
pub mod store;
pub mod vulkan;
pub mod window;

/// External dependencies exposed outside of current crate.
pub use ash::{self, vk};
pub use gpu_allocator;
pub use raw_window_handle;

pub use error::{GfxError, InitError};

/// Identifies one OS window across renderers and deferred-release tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u32);

impl std::fmt::Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "window:{}", self.0)
    }
}
