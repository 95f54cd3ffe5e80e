use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use super::Device;

/// Wraps a raw command pool. Each virtual frame owns one so it can be reset
/// in isolation while other frames remain in flight.
pub(crate) struct CommandPool {
    pub(crate) raw: vk::CommandPool,
    device: Arc<Device>,
}

impl CommandPool {
    pub(crate) fn new(
        device: Arc<Device>,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(flags);
        let raw = unsafe { device.raw.create_command_pool(&info, None)? };
        Ok(Self { raw, device })
    }

    pub(crate) fn allocate_primary(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.raw)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        let raws = unsafe { self.device.raw.allocate_command_buffers(&info)? };
        Ok(raws)
    }

    pub(crate) fn reset(&self, release_resources: bool) -> Result<()> {
        let flags = if release_resources {
            vk::CommandPoolResetFlags::RELEASE_RESOURCES
        } else {
            vk::CommandPoolResetFlags::empty()
        };
        unsafe { self.device.raw.reset_command_pool(self.raw, flags)? };
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.raw.destroy_command_pool(self.raw, None) };
    }
}

/// Thin recording handle. The pool owns the underlying allocation; this
/// struct stays valid only while its pool does.
#[derive(Clone)]
pub struct CommandBuffer {
    pub(crate) raw: vk::CommandBuffer,
    device: Arc<Device>,
}

impl CommandBuffer {
    pub(crate) fn new_from_raw(raw: vk::CommandBuffer, device: Arc<Device>) -> Self {
        Self { raw, device }
    }

    pub fn begin_one_time(&self) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.raw.begin_command_buffer(self.raw, &info)? };
        Ok(())
    }

    pub fn end(&self) -> Result<()> {
        unsafe { self.device.raw.end_command_buffer(self.raw)? };
        Ok(())
    }

    pub fn begin_render_pass(
        &self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);
        unsafe {
            self.device
                .raw
                .cmd_begin_render_pass(self.raw, &info, vk::SubpassContents::INLINE);
        }
    }

    pub fn end_render_pass(&self) {
        unsafe { self.device.raw.cmd_end_render_pass(self.raw) };
    }

    pub fn set_viewport(&self, viewport: vk::Viewport) {
        unsafe { self.device.raw.cmd_set_viewport(self.raw, 0, &[viewport]) };
    }

    pub fn set_scissor(&self, scissor: vk::Rect2D) {
        unsafe { self.device.raw.cmd_set_scissor(self.raw, 0, &[scissor]) };
    }

    pub fn bind_pipeline_graphics(&self, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .raw
                .cmd_bind_pipeline(self.raw, vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
    }

    pub fn bind_descriptor_sets_graphics(
        &self,
        layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device.raw.cmd_bind_descriptor_sets(
                self.raw,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                sets,
                &[],
            );
        }
    }

    pub fn push_constants(
        &self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        bytes: &[u8],
    ) {
        unsafe {
            self.device
                .raw
                .cmd_push_constants(self.raw, layout, stages, 0, bytes);
        }
    }

    pub fn bind_vertex_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device
                .raw
                .cmd_bind_vertex_buffers(self.raw, 0, &[buffer], &[0]);
        }
    }

    pub fn bind_index_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device
                .raw
                .cmd_bind_index_buffer(self.raw, buffer, 0, vk::IndexType::UINT32);
        }
    }

    pub fn draw(&self, vertex_count: u32) {
        unsafe { self.device.raw.cmd_draw(self.raw, vertex_count, 1, 0, 0) };
    }

    pub fn draw_indexed(&self, index_count: u32) {
        unsafe {
            self.device
                .raw
                .cmd_draw_indexed(self.raw, index_count, 1, 0, 0, 0);
        }
    }

    pub(crate) fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        let region = vk::BufferCopy::default().size(size);
        unsafe {
            self.device
                .raw
                .cmd_copy_buffer(self.raw, src, dst, &[region]);
        }
    }

    pub(crate) fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device.raw.cmd_copy_buffer_to_image(
                self.raw,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            );
        }
    }

    pub(crate) fn image_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: vk::ImageMemoryBarrier,
    ) {
        unsafe {
            self.device.raw.cmd_pipeline_barrier(
                self.raw,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}
