use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

/// Narrow interface onto the windowing collaborator. The core never calls
/// back into the window system except through these queries; surfaces are
/// (re)created from the raw handles on demand.
pub trait WindowSource: Send + Sync {
    fn raw_display_handle(&self) -> RawDisplayHandle;
    fn raw_window_handle(&self) -> RawWindowHandle;

    /// Framebuffer size in pixels. Either dimension may be zero while the
    /// surface is minimised.
    fn framebuffer_size(&self) -> [u32; 2];

    /// Logical window size, used to clamp the swap extent when the surface
    /// reports the sentinel current extent.
    fn window_size(&self) -> [u32; 2];
}
