use std::{
    env,
    ffi::{c_void, CStr, CString},
    mem::ManuallyDrop,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Result;
use ash::{ext::debug_utils, khr, vk};
use gpu_allocator::{
    vulkan::{Allocator, AllocatorCreateDesc},
    AllocationSizes, AllocatorDebugSettings,
};
use parking_lot::Mutex;

use crate::{error::InitError, window::WindowSource};

pub mod command;
pub mod shader;
pub mod swapchain;
pub mod vram;

/// Environment variable pinning physical-device selection by device-name
/// substring.
pub const GPU_OVERRIDE_ENV: &str = "HELIO_GPU";

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

bitflags::bitflags! {
    /// Queue roles a resource needs to be visible to. Sharing mode is
    /// derived from the set of unique families these roles resolve to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueFlags: u8 {
        const GRAPHICS = 1 << 0;
        const PRESENT = 1 << 1;
        const TRANSFER = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
    pub transfer: u32,
}

/// Immutable after init.
pub struct DeviceCaps {
    pub queue_families: QueueFamilyIndices,
    pub line_width_min: f32,
    pub line_width_max: f32,
    pub depth_format: vk::Format,
    pub limits: vk::PhysicalDeviceLimits,
}

impl DeviceCaps {
    pub fn clamp_line_width(&self, desired: f32) -> f32 {
        desired.clamp(self.line_width_min, self.line_width_max)
    }
}

struct Instance {
    entry: ash::Entry,
    raw: ash::Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    fn new(window: &dyn WindowSource, validation: bool) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let mut extension_names =
            ash_window::enumerate_required_extensions(window.raw_display_handle())?.to_vec();
        let mut layer_ptrs = Vec::new();
        let validation_layer = CString::new(VALIDATION_LAYER).unwrap();
        if validation {
            extension_names.push(debug_utils::NAME.as_ptr());
            let available = unsafe { entry.enumerate_instance_layer_properties()? };
            let found = available.iter().any(|layer| {
                let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                name.to_str().map(|s| s == VALIDATION_LAYER).unwrap_or(false)
            });
            if !found {
                return Err(InitError::MissingLayer(VALIDATION_LAYER.to_owned()).into());
            }
            layer_ptrs.push(validation_layer.as_ptr());
        }

        let app_name = CString::new("helio").unwrap();
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name.as_c_str())
            .api_version(vk::API_VERSION_1_2);
        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_ptrs);

        let raw = unsafe { entry.create_instance(&instance_info, None)? };

        let debug = if validation {
            let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(validation_callback));
            let loader = debug_utils::Instance::new(&entry, &raw);
            let messenger = match unsafe { loader.create_debug_utils_messenger(&debug_info, None) }
            {
                Ok(messenger) => messenger,
                Err(err) => {
                    unsafe { raw.destroy_instance(None) };
                    return Err(err.into());
                }
            };
            Some((loader, messenger))
        } else {
            None
        };

        Ok(Self { entry, raw, debug })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::trace!("instance dropped");
        unsafe {
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.raw.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn validation_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if p_callback_data.is_null() {
        std::borrow::Cow::Borrowed("unknown")
    } else {
        CStr::from_ptr((*p_callback_data).p_message).to_string_lossy()
    };
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("[vk] {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[vk] {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("[vk] {message}"),
        _ => log::debug!("[vk] {message}"),
    }
    vk::FALSE
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueFamilyProps {
    pub(crate) index: u32,
    pub(crate) flags: vk::QueueFlags,
    pub(crate) queue_count: u32,
    pub(crate) present_support: bool,
}

/// Candidate summary handed to a pluggable selection predicate.
pub struct PhysicalDeviceInfo {
    pub raw: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub limits: vk::PhysicalDeviceLimits,
    pub supports_swapchain: bool,
    pub(crate) queue_families: Vec<QueueFamilyProps>,
}

/// Overrides the default discrete > integrated > anything preference.
pub type DevicePicker<'a> = &'a dyn Fn(&[PhysicalDeviceInfo]) -> Option<usize>;

fn gather_physical_devices(
    instance: &ash::Instance,
    surface_fns: &khr::surface::Instance,
    probe: vk::SurfaceKHR,
) -> Result<Vec<PhysicalDeviceInfo>> {
    let raw_devices = unsafe { instance.enumerate_physical_devices()? };
    raw_devices
        .into_iter()
        .map(|raw| {
            let properties = unsafe { instance.get_physical_device_properties(raw) };
            let name = unsafe {
                CStr::from_ptr(properties.device_name.as_ptr())
                    .to_string_lossy()
                    .into_owned()
            };
            let extensions = unsafe { instance.enumerate_device_extension_properties(raw)? };
            let supports_swapchain = extensions.iter().any(|ext| {
                let ext_name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
                ext_name == khr::swapchain::NAME
            });
            let family_props =
                unsafe { instance.get_physical_device_queue_family_properties(raw) };
            let queue_families = family_props
                .into_iter()
                .enumerate()
                .map(|(index, props)| {
                    let present_support = unsafe {
                        surface_fns
                            .get_physical_device_surface_support(raw, index as u32, probe)?
                    };
                    Ok(QueueFamilyProps {
                        index: index as u32,
                        flags: props.queue_flags,
                        queue_count: props.queue_count,
                        present_support,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(PhysicalDeviceInfo {
                raw,
                name,
                device_type: properties.device_type,
                limits: properties.limits,
                supports_swapchain,
                queue_families,
            })
        })
        .collect()
}

/// Rejects candidates missing the swapchain extension, then prefers the
/// override name, a pluggable picker, discrete, integrated, anything, in
/// that order.
fn select_physical_device(
    devices: &[PhysicalDeviceInfo],
    name_override: Option<&str>,
    picker: Option<DevicePicker>,
) -> Result<usize, InitError> {
    let eligible = |idx: &usize| devices[*idx].supports_swapchain;
    if let Some(fragment) = name_override {
        if let Some(idx) = (0..devices.len())
            .filter(eligible)
            .find(|&idx| devices[idx].name.contains(fragment))
        {
            return Ok(idx);
        }
        log::warn!("{GPU_OVERRIDE_ENV}={fragment} matched no device; falling back");
    }
    if let Some(pick) = picker {
        if let Some(idx) = pick(devices) {
            if idx < devices.len() && devices[idx].supports_swapchain {
                return Ok(idx);
            }
        }
    }
    for wanted in [
        vk::PhysicalDeviceType::DISCRETE_GPU,
        vk::PhysicalDeviceType::INTEGRATED_GPU,
    ] {
        if let Some(idx) = (0..devices.len())
            .filter(eligible)
            .find(|&idx| devices[idx].device_type == wanted)
        {
            return Ok(idx);
        }
    }
    (0..devices.len())
        .find(eligible)
        .ok_or(InitError::NoSuitableDevice)
}

/// graphics: first family with the graphics bit; transfer: first family
/// other than graphics with a transfer bit, else graphics; present: first
/// family that can present to the probe surface.
fn resolve_queue_families(families: &[QueueFamilyProps]) -> Option<QueueFamilyIndices> {
    let mut graphics = None;
    let mut present = None;
    let mut transfer = None;
    for family in families.iter().filter(|family| family.queue_count > 0) {
        if graphics.is_none() && family.flags.contains(vk::QueueFlags::GRAPHICS) {
            graphics = Some(family.index);
        }
        if present.is_none() && family.present_support {
            present = Some(family.index);
        }
    }
    let graphics = graphics?;
    for family in families.iter().filter(|family| family.queue_count > 0) {
        if family.index != graphics && family.flags.contains(vk::QueueFlags::TRANSFER) {
            transfer = Some(family.index);
            break;
        }
    }
    Some(QueueFamilyIndices {
        graphics,
        present: present?,
        transfer: transfer.unwrap_or(graphics),
    })
}

fn unique_indices(indices: &QueueFamilyIndices, flags: QueueFlags) -> Vec<u32> {
    let mut out = Vec::with_capacity(3);
    let mut push = |index: u32| {
        if !out.contains(&index) {
            out.push(index);
        }
    };
    if flags.contains(QueueFlags::GRAPHICS) {
        push(indices.graphics);
    }
    if flags.contains(QueueFlags::PRESENT) {
        push(indices.present);
    }
    if flags.contains(QueueFlags::TRANSFER) {
        push(indices.transfer);
    }
    out
}

struct Queues {
    graphics: vk::Queue,
    present: vk::Queue,
    transfer: vk::Queue,
}

/// Owns the instance, the selected physical device, the logical device and
/// its queues, and the process-wide capability info. Used as an immutable
/// `Arc` reference; interior mutability where required.
pub struct Device {
    pub(crate) allocator: ManuallyDrop<Mutex<Allocator>>,
    pub(crate) raw: ash::Device,
    pub(crate) surface_fns: khr::surface::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    queues: Queues,
    caps: DeviceCaps,
    device_lost: AtomicBool,
    instance: Instance,
}

impl Device {
    pub fn new(window: &dyn WindowSource, picker: Option<DevicePicker>) -> Result<Arc<Self>> {
        let validation = cfg!(debug_assertions);
        let instance = Instance::new(window, validation)?;
        let surface_fns = khr::surface::Instance::new(&instance.entry, &instance.raw);

        // Throw-away probe surface, used only to resolve present support.
        let probe = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.raw,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )?
        };

        let selection = (|| {
            let devices = gather_physical_devices(&instance.raw, &surface_fns, probe)?;
            for device in devices.iter().filter(|d| !d.supports_swapchain) {
                log::warn!(
                    "rejecting [{}]: missing {:?}",
                    device.name,
                    khr::swapchain::NAME
                );
            }
            let name_override = env::var(GPU_OVERRIDE_ENV).ok();
            let index = select_physical_device(&devices, name_override.as_deref(), picker)?;
            let chosen = &devices[index];
            let families = resolve_queue_families(&chosen.queue_families)
                .ok_or(InitError::NoSuitableDevice)?;
            log::info!("using GPU [{}]", chosen.name);
            anyhow::Ok((chosen.raw, chosen.limits, families))
        })();
        unsafe { surface_fns.destroy_surface(probe, None) };
        let (physical_device, limits, queue_families) = selection?;

        let raw = Self::create_logical_device(&instance.raw, physical_device, &queue_families, &limits)?;

        let depth_format = best_depth_format(&instance.raw, physical_device);
        let caps = DeviceCaps {
            queue_families,
            line_width_min: limits.line_width_range[0],
            line_width_max: limits.line_width_range[1],
            depth_format,
            limits,
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.raw.clone(),
            device: raw.clone(),
            physical_device,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: false,
            allocation_sizes: AllocationSizes::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => Mutex::new(allocator),
            Err(err) => {
                unsafe { raw.destroy_device(None) };
                return Err(err.into());
            }
        };

        let queues = unsafe {
            Queues {
                graphics: raw.get_device_queue(queue_families.graphics, 0),
                present: raw.get_device_queue(queue_families.present, 0),
                transfer: raw.get_device_queue(queue_families.transfer, 0),
            }
        };

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(allocator),
            raw,
            surface_fns,
            physical_device,
            queues,
            caps,
            device_lost: AtomicBool::new(false),
            instance,
        }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilyIndices,
        limits: &vk::PhysicalDeviceLimits,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0f32];
        let queue_create_infos = unique_indices(families, QueueFlags::all())
            .into_iter()
            .map(|index| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(index)
                    .queue_priorities(&queue_priorities)
            })
            .collect::<Vec<_>>();

        let extension_ptrs = [khr::swapchain::NAME.as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default()
            .fill_mode_non_solid(true)
            .wide_lines(limits.line_width_range[1] > 1.0);
        // Partially-bound sampled-image arrays back the texture set.
        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .shader_sampled_image_array_non_uniform_indexing(true);

        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&features)
            .push_next(&mut vulkan12_features);

        let device = unsafe { instance.create_device(physical_device, &device_info, None)? };
        Ok(device)
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub(crate) fn entry(&self) -> &ash::Entry {
        &self.instance.entry
    }

    pub(crate) fn instance_raw(&self) -> &ash::Instance {
        &self.instance.raw
    }

    pub(crate) fn present_queue(&self) -> vk::Queue {
        self.queues.present
    }

    pub(crate) fn transfer_queue(&self) -> vk::Queue {
        self.queues.transfer
    }

    pub fn unique_queue_indices(&self, flags: QueueFlags) -> Vec<u32> {
        unique_indices(&self.caps.queue_families, flags)
    }

    /// Exclusive when every requested role maps to one family, concurrent
    /// otherwise.
    pub fn sharing_mode(&self, flags: QueueFlags) -> vk::SharingMode {
        if self.unique_queue_indices(flags).len() <= 1 {
            vk::SharingMode::EXCLUSIVE
        } else {
            vk::SharingMode::CONCURRENT
        }
    }

    pub fn is_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    pub(crate) fn note_result(&self, result: vk::Result) {
        if result == vk::Result::ERROR_DEVICE_LOST {
            log::error!("device lost; refusing further submissions");
            self.device_lost.store(true, Ordering::Release);
        }
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.raw.device_wait_idle()? };
        Ok(())
    }

    pub(crate) fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> Result<()> {
        unsafe { self.raw.wait_for_fences(&[fence], true, timeout)? };
        Ok(())
    }

    pub(crate) fn fence_signalled(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.raw.get_fence_status(fence)? })
    }

    /// Submits to the graphics queue: waits `render_ready` at
    /// colour-attachment-output, signals `present_ready`, arms `in_flight`.
    pub(crate) fn submit_graphics(
        &self,
        command_buffer: vk::CommandBuffer,
        render_ready: vk::Semaphore,
        present_ready: vk::Semaphore,
        in_flight: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores = [render_ready];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let signal_semaphores = [present_ready];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        let result = unsafe {
            self.raw
                .queue_submit(self.queues.graphics, &[submit_info], in_flight)
        };
        if let Err(err) = result {
            self.note_result(err);
            return Err(err.into());
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.raw.device_wait_idle().ok();
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
        }
        log::trace!("logical device dropped");
    }
}

/// First supported of D32S8, D32, D24S8; D16 otherwise.
fn best_depth_format(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> vk::Format {
    let desired = [
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D32_SFLOAT,
        vk::Format::D24_UNORM_S8_UINT,
    ];
    for format in desired {
        let props =
            unsafe { instance.get_physical_device_format_properties(physical_device, format) };
        if props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            return format;
        }
    }
    vk::Format::D16_UNORM
}

pub struct Semaphore {
    pub(crate) raw: vk::Semaphore,
    device: Arc<Device>,
}

impl Semaphore {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let raw = unsafe {
            device
                .raw
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        };
        Ok(Self { raw, device })
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.device.raw.destroy_semaphore(self.raw, None) };
    }
}

pub struct Fence {
    pub(crate) raw: vk::Fence,
    device: Arc<Device>,
}

impl Fence {
    pub fn new(device: Arc<Device>, signalled: bool) -> Result<Self> {
        let flags = if signalled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        let raw = unsafe { device.raw.create_fence(&info, None)? };
        Ok(Self { raw, device })
    }

    pub fn wait(&self) -> Result<()> {
        self.device.wait_for_fence(self.raw, u64::MAX)
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.raw.reset_fences(&[self.raw])? };
        Ok(())
    }

    pub fn is_signalled(&self) -> Result<bool> {
        self.device.fence_signalled(self.raw)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.device.raw.destroy_fence(self.raw, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, device_type: vk::PhysicalDeviceType, swapchain: bool) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            raw: vk::PhysicalDevice::null(),
            name: name.to_owned(),
            device_type,
            limits: vk::PhysicalDeviceLimits::default(),
            supports_swapchain: swapchain,
            queue_families: Vec::new(),
        }
    }

    #[test]
    fn selection_prefers_discrete_over_integrated() {
        let devices = [
            info("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, true),
            info("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, true),
        ];
        assert_eq!(select_physical_device(&devices, None, None).unwrap(), 1);
    }

    #[test]
    fn selection_falls_back_to_integrated_without_discrete() {
        let devices = [
            info("cpu", vk::PhysicalDeviceType::CPU, true),
            info("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, true),
        ];
        assert_eq!(select_physical_device(&devices, None, None).unwrap(), 1);
    }

    #[test]
    fn selection_rejects_devices_without_swapchain() {
        let devices = [info("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, false)];
        assert!(matches!(
            select_physical_device(&devices, None, None),
            Err(InitError::NoSuitableDevice)
        ));
    }

    #[test]
    fn selection_honours_name_override() {
        let devices = [
            info("dgpu-a", vk::PhysicalDeviceType::DISCRETE_GPU, true),
            info("igpu-b", vk::PhysicalDeviceType::INTEGRATED_GPU, true),
        ];
        assert_eq!(
            select_physical_device(&devices, Some("igpu"), None).unwrap(),
            1
        );
    }

    fn family(index: u32, flags: vk::QueueFlags, present: bool) -> QueueFamilyProps {
        QueueFamilyProps {
            index,
            flags,
            queue_count: 1,
            present_support: present,
        }
    }

    #[test]
    fn queue_resolution_picks_dedicated_transfer() {
        let families = [
            family(0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, true),
            family(1, vk::QueueFlags::TRANSFER, false),
        ];
        let indices = resolve_queue_families(&families).unwrap();
        assert_eq!(indices.graphics, 0);
        assert_eq!(indices.present, 0);
        assert_eq!(indices.transfer, 1);
    }

    #[test]
    fn queue_resolution_falls_back_to_graphics_for_transfer() {
        let families = [family(
            0,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
            true,
        )];
        let indices = resolve_queue_families(&families).unwrap();
        assert_eq!(indices.transfer, 0);
    }

    #[test]
    fn queue_resolution_requires_present_support() {
        let families = [family(0, vk::QueueFlags::GRAPHICS, false)];
        assert!(resolve_queue_families(&families).is_none());
    }

    #[test]
    fn unique_indices_deduplicate_aliased_families() {
        let indices = QueueFamilyIndices {
            graphics: 0,
            present: 0,
            transfer: 1,
        };
        assert_eq!(unique_indices(&indices, QueueFlags::all()), vec![0, 1]);
        assert_eq!(
            unique_indices(&indices, QueueFlags::GRAPHICS | QueueFlags::PRESENT),
            vec![0]
        );
    }
}
