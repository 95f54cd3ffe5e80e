use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;

use crate::vulkan::{
    vram::{Buffer, BufferInfo, Vram},
    Device, QueueFlags,
};

/// Upper bound on each sampled-image array; clamped further by the device
/// limit.
pub const MAX_TEXTURE_ARRAY: u32 = 1024;

/// Two bounded arrays plus the cubemap slot have to fit the per-stage
/// sampled image limit.
fn clamped_texture_array_len(limit: u32) -> u32 {
    let per_array = limit.saturating_sub(1) / 2;
    per_array.clamp(1, MAX_TEXTURE_ARRAY)
}

bitflags::bitflags! {
    /// Per-object shading flags mirrored into the flags SSBO.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DrawFlags: u32 {
        const TEXTURED = 1 << 0;
        const LIT = 1 << 1;
        const OPAQUE = 1 << 2;
        const DROP_COLOUR = 1 << 3;
        const UI = 1 << 4;
        const SKYBOX = 1 << 5;
    }
}

/// Indices the shaders use to address the per-frame arrays directly.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct PushConstants {
    pub object_id: u32,
    pub diffuse_id: u32,
    pub specular_id: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ViewUbo {
    pub mat_vp: [[f32; 4]; 4],
    pub mat_v: [[f32; 4]; 4],
    pub mat_p: [[f32; 4]; 4],
    pub mat_ui: [[f32; 4]; 4],
    pub eye: [f32; 3],
    pub time: f32,
    pub dir_light_count: u32,
    pub _pad: [u32; 3],
}

impl Default for ViewUbo {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct GpuMaterial {
    pub ambient: [f32; 4],
    pub diffuse: [f32; 4],
    pub specular: [f32; 4],
    pub drop_colour: [f32; 4],
    pub shininess: f32,
    pub _pad: [f32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct GpuDirLight {
    pub ambient: [f32; 4],
    pub diffuse: [f32; 4],
    pub specular: [f32; 4],
    pub direction: [f32; 4],
}

/// CPU-side staging for the object set, rebuilt from the draw list each
/// frame. Index `i` across all vectors describes object `i`.
#[derive(Debug, Default)]
pub struct SsboArrays {
    pub models: Vec<[[f32; 4]; 4]>,
    pub normals: Vec<[[f32; 4]; 4]>,
    pub materials: Vec<GpuMaterial>,
    pub tints: Vec<[f32; 4]>,
    pub flags: Vec<u32>,
    pub dir_lights: Vec<GpuDirLight>,
}

impl SsboArrays {
    /// A zero-range descriptor write is invalid; keep one zeroed element in
    /// each array on empty frames.
    pub fn ensure_non_empty(&mut self) {
        if self.models.is_empty() {
            self.models.push(Default::default());
            self.normals.push(Default::default());
            self.materials.push(Default::default());
            self.tints.push(Default::default());
            self.flags.push(0);
        }
        if self.dir_lights.is_empty() {
            self.dir_lights.push(Default::default());
        }
    }
}

const OBJECT_BINDINGS: u32 = 6;

/// The three set layouts of the core (view / object / textures) plus the
/// shared pipeline layout carrying the push-constant range.
pub struct DescriptorLayouts {
    pub(crate) view: vk::DescriptorSetLayout,
    pub(crate) object: vk::DescriptorSetLayout,
    pub(crate) textures: vk::DescriptorSetLayout,
    pub(crate) pipeline_layout: vk::PipelineLayout,
    pub(crate) texture_array_len: u32,
    device: Arc<Device>,
}

impl DescriptorLayouts {
    pub fn new(device: Arc<Device>) -> Result<Arc<Self>> {
        let texture_array_len = clamped_texture_array_len(
            device.caps().limits.max_per_stage_descriptor_sampled_images,
        );

        let view_bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)];
        let view_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&view_bindings);
        let view = unsafe { device.raw.create_descriptor_set_layout(&view_info, None)? };

        let object_bindings = (0..OBJECT_BINDINGS)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            })
            .collect::<Vec<_>>();
        let object_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&object_bindings);
        let object = unsafe { device.raw.create_descriptor_set_layout(&object_info, None)? };

        let texture_bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(texture_array_len)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(texture_array_len)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            vk::DescriptorSetLayoutBinding::default()
                .binding(2)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
        ];
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND; 3];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
            .binding_flags(&binding_flags);
        let textures_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&texture_bindings)
            .push_next(&mut flags_info);
        let textures = unsafe { device.raw.create_descriptor_set_layout(&textures_info, None)? };

        let set_layouts = [view, object, textures];
        let push_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(std::mem::size_of::<PushConstants>() as u32)];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        let pipeline_layout = unsafe { device.raw.create_pipeline_layout(&layout_info, None)? };

        Ok(Arc::new(Self {
            view,
            object,
            textures,
            pipeline_layout,
            texture_array_len,
            device,
        }))
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn texture_array_len(&self) -> u32 {
        self.texture_array_len
    }
}

impl Drop for DescriptorLayouts {
    fn drop(&mut self) {
        unsafe {
            self.device
                .raw
                .destroy_pipeline_layout(self.pipeline_layout, None);
            self.device.raw.destroy_descriptor_set_layout(self.view, None);
            self.device
                .raw
                .destroy_descriptor_set_layout(self.object, None);
            self.device
                .raw
                .destroy_descriptor_set_layout(self.textures, None);
        }
    }
}

/// Growable host-coherent, persistently mapped per-slot buffer. Growth
/// retires the previous buffer through the deferred queue.
pub(crate) struct GpuBuffer {
    buffer: Option<Buffer>,
    usage: vk::BufferUsageFlags,
}

impl GpuBuffer {
    pub(crate) fn new(usage: vk::BufferUsageFlags) -> Self {
        Self {
            buffer: None,
            usage,
        }
    }

    fn ensure(&mut self, vram: &Arc<Vram>, size: vk::DeviceSize) -> Result<&Buffer> {
        let too_small = self
            .buffer
            .as_ref()
            .map(|buffer| buffer.size() < size)
            .unwrap_or(true);
        if too_small {
            self.buffer = Some(vram.create_buffer(BufferInfo {
                size,
                usage: self.usage,
                location: MemoryLocation::CpuToGpu,
                queue_flags: QueueFlags::GRAPHICS,
            })?);
        }
        Ok(self.buffer.as_ref().expect("just ensured"))
    }

    pub(crate) fn write_slice<T: Pod>(
        &mut self,
        vram: &Arc<Vram>,
        data: &[T],
    ) -> Result<(vk::Buffer, vk::DeviceSize)> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let buffer = self.ensure(vram, size.max(1))?;
        buffer.write(data)?;
        Ok((buffer.raw, size.max(1)))
    }
}

/// One virtual frame's descriptor sets and backing buffers. Writes are
/// unconditional each frame: the slot's buffers are only coherent for a
/// frame once rewritten after the slot's fence wait.
pub(crate) struct FrameSets {
    pub(crate) view_set: vk::DescriptorSet,
    pub(crate) object_set: vk::DescriptorSet,
    pub(crate) texture_set: vk::DescriptorSet,
    view_ubo: GpuBuffer,
    objects: [GpuBuffer; OBJECT_BINDINGS as usize],
}

impl FrameSets {
    pub(crate) fn new(
        view_set: vk::DescriptorSet,
        object_set: vk::DescriptorSet,
        texture_set: vk::DescriptorSet,
    ) -> Self {
        Self {
            view_set,
            object_set,
            texture_set,
            view_ubo: GpuBuffer::new(vk::BufferUsageFlags::UNIFORM_BUFFER),
            objects: std::array::from_fn(|_| GpuBuffer::new(vk::BufferUsageFlags::STORAGE_BUFFER)),
        }
    }

    fn write_buffer_descriptor(
        device: &Device,
        set: vk::DescriptorSet,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    ) {
        let buffer_info = [vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(0)
            .range(range)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(descriptor_type)
            .buffer_info(&buffer_info);
        unsafe { device.raw.update_descriptor_sets(&[write], &[]) };
    }

    pub(crate) fn write_view(&mut self, device: &Device, vram: &Arc<Vram>, view: &ViewUbo) -> Result<()> {
        let (buffer, range) = self.view_ubo.write_slice(vram, std::slice::from_ref(view))?;
        Self::write_buffer_descriptor(
            device,
            self.view_set,
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            buffer,
            range,
        );
        Ok(())
    }

    pub(crate) fn write_ssbos(
        &mut self,
        device: &Device,
        vram: &Arc<Vram>,
        arrays: &SsboArrays,
    ) -> Result<()> {
        let set = self.object_set;
        let writes: [(&[u8], u32); OBJECT_BINDINGS as usize] = [
            (bytemuck::cast_slice(&arrays.models), 0),
            (bytemuck::cast_slice(&arrays.normals), 1),
            (bytemuck::cast_slice(&arrays.materials), 2),
            (bytemuck::cast_slice(&arrays.tints), 3),
            (bytemuck::cast_slice(&arrays.flags), 4),
            (bytemuck::cast_slice(&arrays.dir_lights), 5),
        ];
        for (bytes, binding) in writes {
            let (buffer, range) = self.objects[binding as usize].write_slice(vram, bytes)?;
            Self::write_buffer_descriptor(
                device,
                set,
                binding,
                vk::DescriptorType::STORAGE_BUFFER,
                buffer,
                range,
            );
        }
        Ok(())
    }

    pub(crate) fn write_combined_image(
        &self,
        device: &Device,
        binding: u32,
        element: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) {
        let image_info = [vk::DescriptorImageInfo::default()
            .image_view(view)
            .sampler(sampler)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.texture_set)
            .dst_binding(binding)
            .dst_array_element(element)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info);
        unsafe { device.raw.update_descriptor_sets(&[write], &[]) };
    }
}

pub(crate) const DIFFUSE_BINDING: u32 = 0;
pub(crate) const SPECULAR_BINDING: u32 = 1;
pub(crate) const CUBEMAP_BINDING: u32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constants_are_three_words() {
        assert_eq!(std::mem::size_of::<PushConstants>(), 12);
    }

    #[test]
    fn gpu_layouts_align_to_sixteen() {
        assert_eq!(std::mem::size_of::<ViewUbo>() % 16, 0);
        assert_eq!(std::mem::size_of::<GpuMaterial>() % 16, 0);
        assert_eq!(std::mem::size_of::<GpuDirLight>(), 64);
    }

    #[test]
    fn texture_array_len_honours_device_limit() {
        assert_eq!(clamped_texture_array_len(4096), MAX_TEXTURE_ARRAY);
        assert_eq!(clamped_texture_array_len(65), 32);
        assert_eq!(clamped_texture_array_len(2), 1);
    }

    #[test]
    fn empty_ssbo_arrays_gain_one_zero_element() {
        let mut arrays = SsboArrays::default();
        arrays.ensure_non_empty();
        assert_eq!(arrays.models.len(), 1);
        assert_eq!(arrays.flags.len(), 1);
        assert_eq!(arrays.dir_lights.len(), 1);
    }

    #[test]
    fn draw_flags_pack_into_low_bits() {
        let flags = DrawFlags::TEXTURED | DrawFlags::LIT;
        assert_eq!(flags.bits(), 0b11);
    }
}
