use std::{mem, sync::Arc, thread};

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};
use parking_lot::Mutex;

use crate::{deferred::DeferredQueue, error::GfxError};

use super::{
    command::{CommandBuffer, CommandPool},
    Device, QueueFlags,
};

pub(crate) const STAGE_COUNT: usize = 8;
pub(crate) const STAGE_ACQUIRE_MAX_ITERS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer,
    Image,
}

/// Running byte totals per resource kind. Must equal the sum of live
/// allocations at all times; checked to be zero on shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocationTotals {
    buffers: u64,
    images: u64,
}

impl AllocationTotals {
    fn add(&mut self, kind: ResourceKind, bytes: u64) {
        match kind {
            ResourceKind::Buffer => self.buffers += bytes,
            ResourceKind::Image => self.images += bytes,
        }
    }

    fn sub(&mut self, kind: ResourceKind, bytes: u64) {
        match kind {
            ResourceKind::Buffer => self.buffers -= bytes,
            ResourceKind::Image => self.images -= bytes,
        }
    }

    pub fn bytes(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Buffer => self.buffers,
            ResourceKind::Image => self.images,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.buffers == 0 && self.images == 0
    }
}

fn grown_stage_size(current: vk::DeviceSize, requested: vk::DeviceSize) -> vk::DeviceSize {
    requested.max(current.saturating_mul(2))
}

pub struct BufferInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub queue_flags: QueueFlags,
}

/// Exclusively owns its allocation; dropping enqueues a deferred release
/// gated on every frame currently in flight.
pub struct Buffer {
    pub(crate) raw: vk::Buffer,
    allocation: Option<Allocation>,
    pub(crate) size: vk::DeviceSize,
    pub(crate) queue_flags: QueueFlags,
    vram: Arc<Vram>,
}

impl Buffer {
    /// Writes through the persistent map. Errors if the buffer is not
    /// host-visible.
    pub fn write<T: Copy>(&self, data: &[T]) -> Result<()> {
        let bytes = mem::size_of_val(data) as vk::DeviceSize;
        anyhow::ensure!(bytes <= self.size, "write of {bytes}B exceeds buffer");
        let allocation = self.allocation.as_ref().expect("live buffer");
        let ptr = allocation
            .mapped_ptr()
            .context("buffer is not host-visible")?
            .as_ptr();
        unsafe {
            let mut align = ash::util::Align::new(ptr, mem::align_of::<T>() as u64, bytes);
            align.copy_from_slice(data);
        }
        Ok(())
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let vram = self.vram.clone();
            let raw = self.raw;
            let size = self.size;
            self.vram
                .deferred
                .release(move || vram.destroy_buffer(raw, allocation, size));
        }
    }
}

pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub array_layers: u32,
    pub location: MemoryLocation,
    pub queue_flags: QueueFlags,
}

impl ImageInfo {
    pub fn sampled_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            array_layers: 1,
            location: MemoryLocation::GpuOnly,
            queue_flags: QueueFlags::GRAPHICS | QueueFlags::TRANSFER,
        }
    }

    pub fn cubemap(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            array_layers: 6,
            ..Self::sampled_2d(width, height, format)
        }
    }

    pub fn depth_attachment(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            array_layers: 1,
            location: MemoryLocation::GpuOnly,
            queue_flags: QueueFlags::GRAPHICS,
        }
    }
}

pub struct Image {
    pub(crate) raw: vk::Image,
    pub(crate) view: vk::ImageView,
    allocation: Option<Allocation>,
    allocated_size: vk::DeviceSize,
    pub(crate) extent: vk::Extent3D,
    pub(crate) format: vk::Format,
    pub(crate) array_layers: u32,
    vram: Arc<Vram>,
}

impl Image {
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let vram = self.vram.clone();
            let raw = self.raw;
            let view = self.view;
            let size = self.allocated_size;
            self.vram
                .deferred
                .release(move || vram.destroy_image(raw, view, allocation, size));
        }
    }
}

fn format_has_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D32_SFLOAT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM
            | vk::Format::D16_UNORM_S8_UINT
    )
}

struct StagingBuffer {
    raw: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
}

/// One reusable staging slot: host-visible buffer, transfer command buffer,
/// completion fence.
struct Stage {
    buffer: StagingBuffer,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

/// Suballocates typed GPU memory and runs the staging ring that copies host
/// data to device-local memory, returning the transfer fence as the
/// completion handle.
pub struct Vram {
    pub(crate) device: Arc<Device>,
    pub(crate) deferred: Arc<DeferredQueue>,
    transfer_pool: CommandPool,
    stages: Mutex<Vec<Stage>>,
    totals: Mutex<AllocationTotals>,
}

impl Vram {
    pub fn new(device: Arc<Device>, deferred: Arc<DeferredQueue>) -> Result<Arc<Self>> {
        let transfer_pool = CommandPool::new(
            device.clone(),
            device.caps().queue_families.transfer,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        log::info!("vram initialised");
        Ok(Arc::new(Self {
            device,
            deferred,
            transfer_pool,
            stages: Mutex::new(Vec::with_capacity(STAGE_COUNT)),
            totals: Mutex::new(AllocationTotals::default()),
        }))
    }

    pub fn totals(&self) -> AllocationTotals {
        *self.totals.lock()
    }

    fn allocate_buffer(
        &self,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        queue_flags: QueueFlags,
    ) -> Result<(vk::Buffer, Allocation)> {
        let indices = self.device.unique_queue_indices(queue_flags);
        let mut info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(self.device.sharing_mode(queue_flags));
        if indices.len() > 1 {
            info = info.queue_family_indices(&indices);
        }
        let raw = unsafe { self.device.raw.create_buffer(&info, None)? };
        let requirements = unsafe { self.device.raw.get_buffer_memory_requirements(raw) };
        let allocation = self.device.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        unsafe {
            self.device
                .raw
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())?;
        }
        self.totals.lock().add(ResourceKind::Buffer, size);
        Ok((raw, allocation))
    }

    pub fn create_buffer(self: &Arc<Self>, info: BufferInfo) -> Result<Buffer> {
        let (raw, allocation) = self.allocate_buffer(
            "buffer",
            info.size,
            info.usage,
            info.location,
            info.queue_flags,
        )?;
        Ok(Buffer {
            raw,
            allocation: Some(allocation),
            size: info.size,
            queue_flags: info.queue_flags,
            vram: self.clone(),
        })
    }

    pub(crate) fn destroy_buffer(&self, raw: vk::Buffer, allocation: Allocation, size: u64) {
        unsafe { self.device.raw.destroy_buffer(raw, None) };
        if let Err(err) = self.device.allocator.lock().free(allocation) {
            log::error!("buffer free failed: {err}");
        }
        self.totals.lock().sub(ResourceKind::Buffer, size);
    }

    pub fn create_image(self: &Arc<Self>, info: ImageInfo) -> Result<Image> {
        let extent = vk::Extent3D {
            width: info.width,
            height: info.height,
            depth: 1,
        };
        let mut flags = vk::ImageCreateFlags::empty();
        let view_type = if info.array_layers == 6 {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
            vk::ImageViewType::CUBE
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let indices = self.device.unique_queue_indices(info.queue_flags);
        let mut create_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(info.format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(info.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(self.device.sharing_mode(info.queue_flags))
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if indices.len() > 1 {
            create_info = create_info.queue_family_indices(&indices);
        }
        let raw = unsafe { self.device.raw.create_image(&create_info, None)? };
        let requirements = unsafe { self.device.raw.get_image_memory_requirements(raw) };
        let allocation = self.device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "image",
            requirements,
            location: info.location,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        unsafe {
            self.device
                .raw
                .bind_image_memory(raw, allocation.memory(), allocation.offset())?;
        }

        let aspect = if format_has_depth(info.format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(raw)
            .view_type(view_type)
            .format(info.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(info.array_layers),
            );
        let view = unsafe { self.device.raw.create_image_view(&view_info, None)? };

        self.totals.lock().add(ResourceKind::Image, requirements.size);
        Ok(Image {
            raw,
            view,
            allocation: Some(allocation),
            allocated_size: requirements.size,
            extent,
            format: info.format,
            array_layers: info.array_layers,
            vram: self.clone(),
        })
    }

    pub(crate) fn destroy_image(
        &self,
        raw: vk::Image,
        view: vk::ImageView,
        allocation: Allocation,
        size: u64,
    ) {
        unsafe {
            self.device.raw.destroy_image_view(view, None);
            self.device.raw.destroy_image(raw, None);
        }
        if let Err(err) = self.device.allocator.lock().free(allocation) {
            log::error!("image free failed: {err}");
        }
        self.totals.lock().sub(ResourceKind::Image, size);
    }

    fn create_staging_buffer(&self, size: vk::DeviceSize) -> Result<StagingBuffer> {
        let (raw, allocation) = self.allocate_buffer(
            "staging",
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            QueueFlags::GRAPHICS | QueueFlags::TRANSFER,
        )?;
        Ok(StagingBuffer {
            raw,
            allocation: Some(allocation),
            size,
        })
    }

    fn destroy_staging_buffer(&self, mut buffer: StagingBuffer) {
        if let Some(allocation) = buffer.allocation.take() {
            self.destroy_buffer(buffer.raw, allocation, buffer.size);
        }
    }

    /// Finds a slot whose fence has signalled, lazily creating up to
    /// [`STAGE_COUNT`] slots. Spins with yield for a bounded number of
    /// iterations before surfacing [`GfxError::TransferExhausted`].
    fn acquire_stage(&self, stages: &mut Vec<Stage>, size: vk::DeviceSize) -> Result<usize> {
        if stages.len() < STAGE_COUNT {
            let buffer = self.create_staging_buffer(size)?;
            let command_buffer = self.transfer_pool.allocate_primary(1)?[0];
            let fence_info = vk::FenceCreateInfo::default();
            let fence = unsafe { self.device.raw.create_fence(&fence_info, None)? };
            stages.push(Stage {
                buffer,
                command_buffer,
                fence,
            });
            return Ok(stages.len() - 1);
        }
        for _ in 0..STAGE_ACQUIRE_MAX_ITERS {
            for index in 0..stages.len() {
                if self.device.fence_signalled(stages[index].fence)? {
                    unsafe {
                        self.device.raw.reset_fences(&[stages[index].fence])?;
                        self.device.raw.reset_command_buffer(
                            stages[index].command_buffer,
                            vk::CommandBufferResetFlags::RELEASE_RESOURCES,
                        )?;
                    }
                    if stages[index].buffer.size < size {
                        let grown = grown_stage_size(stages[index].buffer.size, size);
                        let replacement = self.create_staging_buffer(grown)?;
                        let old = mem::replace(&mut stages[index].buffer, replacement);
                        self.destroy_staging_buffer(old);
                    }
                    return Ok(index);
                }
            }
            thread::yield_now();
        }
        Err(GfxError::TransferExhausted.into())
    }

    fn write_stage(stage: &Stage, offset: usize, bytes: &[u8]) -> Result<()> {
        let allocation = stage.buffer.allocation.as_ref().expect("live staging");
        let ptr = allocation
            .mapped_ptr()
            .context("staging buffer is not host-visible")?
            .as_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>().add(offset), bytes.len());
        }
        Ok(())
    }

    fn submit_stage(&self, stage: &Stage) -> Result<()> {
        let command_buffers = [stage.command_buffer];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
        let result = unsafe {
            self.device
                .raw
                .queue_submit(self.device.transfer_queue(), &[submit], stage.fence)
        };
        if let Err(err) = result {
            self.device.note_result(err);
            return Err(err.into());
        }
        Ok(())
    }

    /// Stages `bytes` into a device-local buffer. Returns the transfer
    /// fence; the slot is recycled only after it signals. A recycled slot
    /// re-arms the fence, so a late waiter observes at least the completion
    /// of its own copy.
    pub fn stage_to_buffer(self: &Arc<Self>, dst: &Buffer, bytes: &[u8]) -> Result<vk::Fence> {
        anyhow::ensure!(
            dst.queue_flags.contains(QueueFlags::TRANSFER),
            "destination buffer is not transfer-visible"
        );
        anyhow::ensure!(
            dst.size >= bytes.len() as vk::DeviceSize,
            "staging {}B into {}B buffer",
            bytes.len(),
            dst.size
        );
        let mut stages = self.stages.lock();
        let index = self.acquire_stage(&mut stages, bytes.len() as vk::DeviceSize)?;
        let stage = &stages[index];
        Self::write_stage(stage, 0, bytes)?;

        let recorder = CommandBuffer::new_from_raw(stage.command_buffer, self.device.clone());
        recorder.begin_one_time()?;
        recorder.copy_buffer(stage.buffer.raw, dst.raw, bytes.len() as vk::DeviceSize);
        recorder.end()?;
        self.submit_stage(stage)?;
        Ok(stage.fence)
    }

    /// Stages one byte slice per array layer into a device-local image in a
    /// single submit, transitioning `UNDEFINED -> TRANSFER_DST ->
    /// SHADER_READ_ONLY`.
    pub fn stage_to_image(self: &Arc<Self>, dst: &Image, layers: &[&[u8]]) -> Result<vk::Fence> {
        anyhow::ensure!(
            layers.len() as u32 == dst.array_layers,
            "expected {} layers, got {}",
            dst.array_layers,
            layers.len()
        );
        let total: usize = layers.iter().map(|bytes| bytes.len()).sum();
        let mut stages = self.stages.lock();
        let index = self.acquire_stage(&mut stages, total as vk::DeviceSize)?;
        let stage = &stages[index];

        let mut offset = 0usize;
        let mut regions = Vec::with_capacity(layers.len());
        for (layer, bytes) in layers.iter().enumerate() {
            Self::write_stage(stage, offset, bytes)?;
            regions.push(
                vk::BufferImageCopy::default()
                    .buffer_offset(offset as vk::DeviceSize)
                    .image_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .mip_level(0)
                            .base_array_layer(layer as u32)
                            .layer_count(1),
                    )
                    .image_extent(dst.extent),
            );
            offset += bytes.len();
        }

        let subresource_range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(dst.array_layers);

        let recorder = CommandBuffer::new_from_raw(stage.command_buffer, self.device.clone());
        recorder.begin_one_time()?;
        recorder.image_barrier(
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .image(dst.raw)
                .subresource_range(subresource_range),
        );
        recorder.copy_buffer_to_image(stage.buffer.raw, dst.raw, &regions);
        recorder.image_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .image(dst.raw)
                .subresource_range(subresource_range),
        );
        recorder.end()?;
        self.submit_stage(stage)?;
        Ok(stage.fence)
    }
}

impl Drop for Vram {
    fn drop(&mut self) {
        // All deferred releases hold an Arc to this Vram, so reaching this
        // point means the deferred queue has been drained of ours.
        self.device.wait_idle().ok();
        let stages = mem::take(&mut *self.stages.lock());
        for stage in stages {
            unsafe { self.device.raw.destroy_fence(stage.fence, None) };
            self.destroy_staging_buffer(stage.buffer);
        }
        let totals = *self.totals.lock();
        debug_assert!(totals.is_zero(), "allocations pending release: {totals:?}");
        if !totals.is_zero() {
            log::error!("vram shutdown with allocations pending release: {totals:?}");
        }
        log::info!("vram deinitialised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_track_random_interleavings() {
        let mut totals = AllocationTotals::default();
        let sizes = [1u64, 4, 1024, 1 << 20, 64 << 20];
        let mut live = Vec::new();
        for (index, &size) in sizes.iter().enumerate() {
            let kind = if index % 2 == 0 {
                ResourceKind::Buffer
            } else {
                ResourceKind::Image
            };
            totals.add(kind, size);
            live.push((kind, size));
        }
        // Release out of creation order.
        for index in [3usize, 0, 4, 1, 2] {
            let (kind, size) = live[index];
            totals.sub(kind, size);
        }
        assert!(totals.is_zero());
    }

    #[test]
    fn totals_report_per_kind() {
        let mut totals = AllocationTotals::default();
        totals.add(ResourceKind::Buffer, 128);
        totals.add(ResourceKind::Image, 256);
        assert_eq!(totals.bytes(ResourceKind::Buffer), 128);
        assert_eq!(totals.bytes(ResourceKind::Image), 256);
        assert!(!totals.is_zero());
    }

    #[test]
    fn stage_growth_doubles_but_never_undershoots() {
        assert_eq!(grown_stage_size(16 << 20, 1 << 20), 32 << 20);
        assert_eq!(grown_stage_size(1 << 20, 16 << 20), 16 << 20);
        assert_eq!(grown_stage_size(0, 64), 64);
    }
}
