use std::sync::Arc;

use anyhow::Result;
use ash::{khr, vk};

use crate::{
    error::GfxError,
    vulkan::{
        vram::{Image, ImageInfo, Vram},
        Device, QueueFlags,
    },
    window::WindowSource,
    WindowId,
};

/// Ranking preferences for the surface-bound outputs. Empty lists fall back
/// to the defaults.
#[derive(Default)]
pub struct ContextOptions {
    pub colour_formats: Vec<vk::Format>,
    pub colour_spaces: Vec<vk::ColorSpaceKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

const DEFAULT_COLOUR_FORMATS: &[vk::Format] = &[vk::Format::B8G8R8A8_SRGB];
const DEFAULT_COLOUR_SPACES: &[vk::ColorSpaceKHR] = &[vk::ColorSpaceKHR::SRGB_NONLINEAR];
const DEFAULT_PRESENT_MODES: &[vk::PresentModeKHR] =
    &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];

/// Rank-sum over the desired format and colour-space lists; the available
/// pair with the lowest combined rank wins.
fn rank_colour_format(
    available: &[vk::SurfaceFormatKHR],
    formats: &[vk::Format],
    spaces: &[vk::ColorSpaceKHR],
) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .copied()
        .min_by_key(|candidate| {
            let format_rank = formats
                .iter()
                .position(|&format| format == candidate.format)
                .unwrap_or(formats.len());
            let space_rank = spaces
                .iter()
                .position(|&space| space == candidate.color_space)
                .unwrap_or(spaces.len());
            format_rank + space_rank
        })
}

fn rank_present_mode(
    available: &[vk::PresentModeKHR],
    desired: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    available
        .iter()
        .copied()
        .min_by_key(|candidate| {
            desired
                .iter()
                .position(|mode| mode == candidate)
                .unwrap_or(desired.len())
        })
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Surface `current_extent` unless it is the sentinel, else the window size
/// clamped into the surface limits.
fn clamp_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_size: [u32; 2],
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: window_size[0].clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window_size[1].clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

fn swap_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = capabilities.min_image_count + 1;
    if capabilities.max_image_count != 0 {
        count = count.min(capabilities.max_image_count);
    }
    count
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Running,
    SwapchainDestroyed,
    SwapchainRecreated,
    Destroyed,
}

/// One swapchain image slot, keyed by the index returned at acquisition.
struct Frame {
    _image: vk::Image,
    colour: vk::ImageView,
    depth: vk::ImageView,
    drawing: vk::Fence,
    nascent: bool,
}

struct SwapchainData {
    fns: khr::swapchain::Device,
    raw: vk::SwapchainKHR,
    frames: Vec<Frame>,
    _depth_image: Image,
    extent: vk::Extent2D,
    image_index: u32,
}

/// Colour/depth views plus the swap extent, produced by acquisition and
/// consumed by recording.
#[derive(Debug, Clone, Copy)]
pub struct RenderTarget {
    pub render_pass: vk::RenderPass,
    pub extent: vk::Extent2D,
    pub colour: vk::ImageView,
    pub depth: vk::ImageView,
}

pub enum Acquired {
    Target(RenderTarget),
    /// Zero-area surface; the scheduler must not record.
    Paused,
    /// The swapchain was rebuilt during this call; skip this frame and
    /// rebuild extent-dependent state.
    Recreated,
}

/// Owns the surface-bound swapchain, its images, the shared depth
/// attachment, the render pass, and recreation on resize/out-of-date.
pub struct RenderContext {
    device: Arc<Device>,
    vram: Arc<Vram>,
    window: Arc<dyn WindowSource>,
    window_id: WindowId,
    surface: vk::SurfaceKHR,
    render_pass: vk::RenderPass,
    colour_format: vk::SurfaceFormatKHR,
    depth_format: vk::Format,
    present_mode: vk::PresentModeKHR,
    swapchain: Option<SwapchainData>,
    state: ContextState,
    render_paused: bool,
}

impl RenderContext {
    pub fn new(
        device: Arc<Device>,
        vram: Arc<Vram>,
        window: Arc<dyn WindowSource>,
        window_id: WindowId,
        options: ContextOptions,
    ) -> Result<Self> {
        let surface = unsafe {
            ash_window::create_surface(
                device.entry(),
                device.instance_raw(),
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )?
        };

        let built = (|| {
            let formats = unsafe {
                device
                    .surface_fns
                    .get_physical_device_surface_formats(device.physical_device, surface)?
            };
            let modes = unsafe {
                device
                    .surface_fns
                    .get_physical_device_surface_present_modes(device.physical_device, surface)?
            };
            let desired_formats = if options.colour_formats.is_empty() {
                DEFAULT_COLOUR_FORMATS
            } else {
                options.colour_formats.as_slice()
            };
            let desired_spaces = if options.colour_spaces.is_empty() {
                DEFAULT_COLOUR_SPACES
            } else {
                options.colour_spaces.as_slice()
            };
            let desired_modes = if options.present_modes.is_empty() {
                DEFAULT_PRESENT_MODES
            } else {
                options.present_modes.as_slice()
            };
            let colour_format = rank_colour_format(&formats, desired_formats, desired_spaces)
                .ok_or(GfxError::Init(crate::error::InitError::NoSuitableDevice))?;
            let present_mode = rank_present_mode(&modes, desired_modes);
            let depth_format = device.caps().depth_format;
            let render_pass = create_render_pass(&device, colour_format.format, depth_format)?;
            anyhow::Ok((colour_format, present_mode, depth_format, render_pass))
        })();
        let (colour_format, present_mode, depth_format, render_pass) = match built {
            Ok(parts) => parts,
            Err(err) => {
                unsafe { device.surface_fns.destroy_surface(surface, None) };
                return Err(err);
            }
        };

        let mut context = Self {
            device,
            vram,
            window,
            window_id,
            surface,
            render_pass,
            colour_format,
            depth_format,
            present_mode,
            swapchain: None,
            state: ContextState::Running,
            render_paused: false,
        };
        if let Err(err) = context.create_swapchain() {
            // Drop impl unwinds the surface and render pass.
            return Err(err);
        }
        log::info!("[{}] render context constructed", context.window_id);
        Ok(context)
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn colour_format(&self) -> vk::Format {
        self.colour_format.format
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.render_paused
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .as_ref()
            .map(|data| data.extent)
            .unwrap_or_default()
    }

    pub fn image_count(&self) -> usize {
        self.swapchain
            .as_ref()
            .map(|data| data.frames.len())
            .unwrap_or(0)
    }

    /// Driven by the windowing collaborator reporting a new framebuffer
    /// size.
    pub fn on_framebuffer_resize(&mut self) -> Result<()> {
        let size = self.window.framebuffer_size();
        if self.render_paused {
            if size[0] > 0 && size[1] > 0 && self.recreate_swapchain()? {
                log::info!(
                    "[{}] non-zero framebuffer [{}x{}]; resuming rendering",
                    self.window_id,
                    size[0],
                    size[1]
                );
                self.render_paused = false;
            }
        } else if size[0] == 0 || size[1] == 0 {
            log::info!(
                "[{}] zero framebuffer (minimised surface?); pausing rendering",
                self.window_id
            );
            self.render_paused = true;
        } else {
            let extent = self.extent();
            if extent.width != size[0] || extent.height != size[1] {
                if self.recreate_swapchain()? {
                    log::info!(
                        "[{}] framebuffer now [{}x{}]; swapchain recreated",
                        self.window_id,
                        size[0],
                        size[1]
                    );
                }
            }
        }
        Ok(())
    }

    /// Acquires the next swapchain image, signalling `render_ready` and
    /// arming `in_flight` as this image's drawing fence. Waits out the
    /// fence of the previous frame on the same image unless nascent.
    pub fn acquire(
        &mut self,
        render_ready: vk::Semaphore,
        in_flight: vk::Fence,
    ) -> Result<Acquired> {
        if self.render_paused {
            return Ok(Acquired::Paused);
        }
        let Some(data) = self.swapchain.as_mut() else {
            return Ok(Acquired::Paused);
        };
        let acquired = unsafe {
            data.fns
                .acquire_next_image(data.raw, u64::MAX, render_ready, vk::Fence::null())
        };
        let index = match acquired {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("[{}] acquired suboptimal image", self.window_id);
                }
                index
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                self.device.note_result(vk::Result::ERROR_DEVICE_LOST);
                return Err(GfxError::DeviceLost.into());
            }
            Err(result) => {
                // Out-of-date and anything else both route through
                // recreation.
                log::debug!("[{}] acquire failed [{result:?}]", self.window_id);
                self.recreate_swapchain()?;
                return Ok(Acquired::Recreated);
            }
        };
        let data = self.swapchain.as_mut().expect("swapchain live");
        data.image_index = index;
        let extent = data.extent;
        let frame = &mut data.frames[index as usize];
        if !frame.nascent {
            self.device.wait_for_fence(frame.drawing, u64::MAX)?;
        }
        frame.nascent = false;
        frame.drawing = in_flight;
        self.state = ContextState::Running;
        Ok(Acquired::Target(RenderTarget {
            render_pass: self.render_pass,
            extent,
            colour: frame.colour,
            depth: frame.depth,
        }))
    }

    /// Presents the most recently acquired image, waiting on `wait`.
    /// Returns false when the frame produced no output.
    pub fn present(&mut self, wait: vk::Semaphore) -> Result<bool> {
        if self.render_paused {
            return Ok(false);
        }
        let Some(data) = self.swapchain.as_ref() else {
            return Ok(false);
        };
        let swapchains = [data.raw];
        let indices = [data.image_index];
        let wait_semaphores = [wait];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        let result = unsafe {
            data.fns
                .queue_present(self.device.present_queue(), &present_info)
        };
        match result {
            Ok(_suboptimal) => {
                self.state = ContextState::Running;
                Ok(true)
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                self.device.note_result(vk::Result::ERROR_DEVICE_LOST);
                Err(GfxError::DeviceLost.into())
            }
            Err(result) => {
                log::debug!("[{}] present failed [{result:?}]", self.window_id);
                self.recreate_swapchain()?;
                Ok(false)
            }
        }
    }

    fn create_swapchain(&mut self) -> Result<bool> {
        let framebuffer = self.window.framebuffer_size();
        if framebuffer[0] == 0 || framebuffer[1] == 0 {
            log::info!(
                "[{}] zero framebuffer (minimised surface?); pausing rendering",
                self.window_id
            );
            self.render_paused = true;
            return Ok(false);
        }
        let capabilities = unsafe {
            self.device
                .surface_fns
                .get_physical_device_surface_capabilities(self.device.physical_device, self.surface)?
        };
        let extent = clamp_extent(&capabilities, self.window.window_size());
        let indices = self
            .device
            .unique_queue_indices(QueueFlags::GRAPHICS | QueueFlags::PRESENT);
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(swap_image_count(&capabilities))
            .image_format(self.colour_format.format)
            .image_color_space(self.colour_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(
                self.device
                    .sharing_mode(QueueFlags::GRAPHICS | QueueFlags::PRESENT),
            )
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true);
        if indices.len() > 1 {
            create_info = create_info.queue_family_indices(&indices);
        }

        let fns = khr::swapchain::Device::new(self.device.instance_raw(), &self.device.raw);
        let raw = unsafe { fns.create_swapchain(&create_info, None)? };

        let built = (|| {
            let images = unsafe { fns.get_swapchain_images(raw)? };
            anyhow::ensure!(!images.is_empty(), "swapchain reported no images");
            let depth_image = self.vram.create_image(ImageInfo::depth_attachment(
                extent.width,
                extent.height,
                self.depth_format,
            ))?;
            let mut frames = Vec::with_capacity(images.len());
            for image in &images {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(*image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(self.colour_format.format)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1),
                    );
                let colour = unsafe { self.device.raw.create_image_view(&view_info, None)? };
                frames.push(Frame {
                    _image: *image,
                    colour,
                    depth: depth_image.view(),
                    drawing: vk::Fence::null(),
                    nascent: true,
                });
            }
            anyhow::Ok((frames, depth_image))
        })();
        let (frames, depth_image) = match built {
            Ok(parts) => parts,
            Err(err) => {
                unsafe { fns.destroy_swapchain(raw, None) };
                return Err(err);
            }
        };

        log::debug!(
            "[{}] swapchain created [{}x{}], {} images",
            self.window_id,
            extent.width,
            extent.height,
            frames.len()
        );
        self.swapchain = Some(SwapchainData {
            fns,
            raw,
            frames,
            _depth_image: depth_image,
            extent,
            image_index: 0,
        });
        Ok(true)
    }

    fn destroy_swapchain(&mut self) -> Result<()> {
        if let Some(data) = self.swapchain.take() {
            self.device.wait_idle()?;
            unsafe {
                for frame in &data.frames {
                    self.device.raw.destroy_image_view(frame.colour, None);
                }
                data.fns.destroy_swapchain(data.raw, None);
            }
            // The shared depth image drops here and rides the deferred
            // queue.
            log::debug!("[{}] swapchain destroyed", self.window_id);
        }
        self.state = ContextState::SwapchainDestroyed;
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> Result<bool> {
        log::debug!("[{}] recreating swapchain...", self.window_id);
        self.destroy_swapchain()?;
        if self.create_swapchain()? {
            self.state = ContextState::SwapchainRecreated;
            log::debug!("[{}] ...swapchain recreated", self.window_id);
            return Ok(true);
        }
        if !self.render_paused {
            log::error!("[{}] failed to recreate swapchain", self.window_id);
        }
        Ok(false)
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        self.destroy_swapchain().ok();
        unsafe {
            self.device.raw.destroy_render_pass(self.render_pass, None);
            self.device.surface_fns.destroy_surface(self.surface, None);
        }
        self.state = ContextState::Destroyed;
        log::info!("[{}] render context destroyed", self.window_id);
    }
}

/// Colour clear/store into present, depth clear/discard, one subpass, one
/// external dependency on colour-attachment-output.
fn create_render_pass(
    device: &Device,
    colour_format: vk::Format,
    depth_format: vk::Format,
) -> Result<vk::RenderPass> {
    let attachments = [
        vk::AttachmentDescription::default()
            .format(colour_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
        vk::AttachmentDescription::default()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
    ];
    let colour_refs = [vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
    let depth_ref = vk::AttachmentReference::default()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&colour_refs)
        .depth_stencil_attachment(&depth_ref)];
    let dependencies = [vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )];
    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    let render_pass = unsafe { device.raw.create_render_pass(&info, None)? };
    Ok(render_pass)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colour_ranking_prefers_first_desired_pair() {
        let available = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let best =
            rank_colour_format(&available, DEFAULT_COLOUR_FORMATS, DEFAULT_COLOUR_SPACES).unwrap();
        assert_eq!(best.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn colour_ranking_degrades_to_best_available() {
        let available = [vk::SurfaceFormatKHR {
            format: vk::Format::R5G6B5_UNORM_PACK16,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        let best =
            rank_colour_format(&available, DEFAULT_COLOUR_FORMATS, DEFAULT_COLOUR_SPACES).unwrap();
        assert_eq!(best.format, vk::Format::R5G6B5_UNORM_PACK16);
    }

    #[test]
    fn present_mode_prefers_mailbox_then_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            rank_present_mode(&available, DEFAULT_PRESENT_MODES),
            vk::PresentModeKHR::MAILBOX
        );
        let fifo_only = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            rank_present_mode(&fifo_only, DEFAULT_PRESENT_MODES),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_uses_current_unless_sentinel() {
        let mut capabilities = vk::SurfaceCapabilitiesKHR::default();
        capabilities.current_extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let extent = clamp_extent(&capabilities, [640, 480]);
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn extent_clamps_window_size_on_sentinel() {
        let mut capabilities = vk::SurfaceCapabilitiesKHR::default();
        capabilities.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        capabilities.min_image_extent = vk::Extent2D {
            width: 64,
            height: 64,
        };
        capabilities.max_image_extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        let extent = clamp_extent(&capabilities, [1280, 720]);
        assert_eq!((extent.width, extent.height), (1280, 720));
        let clamped = clamp_extent(&capabilities, [4096, 16]);
        assert_eq!((clamped.width, clamped.height), (1920, 64));
    }

    #[test]
    fn image_count_is_min_plus_one_capped() {
        let mut capabilities = vk::SurfaceCapabilitiesKHR::default();
        capabilities.min_image_count = 2;
        capabilities.max_image_count = 0;
        assert_eq!(swap_image_count(&capabilities), 3);
        capabilities.max_image_count = 2;
        assert_eq!(swap_image_count(&capabilities), 2);
    }
}
