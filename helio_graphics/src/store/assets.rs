use std::{ffi::CString, path::PathBuf, sync::Arc};

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::{
    deferred::DeferredQueue,
    error::GfxError,
    renderer::descriptor::{DescriptorLayouts, DrawFlags, GpuMaterial},
    vulkan::{
        shader::{ShaderModule, ShaderStage},
        vram::{Buffer, Image},
        Device,
    },
};

use super::monitor::FileMonitor;

/// Decoded RGBA8 pixels. Image decoding itself is an external collaborator;
/// the store only re-runs the supplied codec on reload.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub size: [u32; 2],
    pub bytes: Vec<u8>,
}

impl RawImage {
    pub fn solid(rgba: [u8; 4]) -> Self {
        Self {
            size: [1, 1],
            bytes: rgba.to_vec(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let expected = (self.size[0] as usize) * (self.size[1] as usize) * 4;
        if self.bytes.len() != expected {
            return Err(GfxError::AssetCodec(format!(
                "raw image is {} bytes, expected {expected}",
                self.bytes.len()
            ))
            .into());
        }
        Ok(())
    }
}

pub type Codec = Arc<dyn Fn(&[u8]) -> Result<RawImage> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct SamplerInfo {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
}

impl Default for SamplerInfo {
    fn default() -> Self {
        Self {
            min_filter: vk::Filter::LINEAR,
            mag_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
        }
    }
}

pub struct SamplerAsset {
    pub(crate) raw: vk::Sampler,
    device: Arc<Device>,
    deferred: Arc<DeferredQueue>,
}

impl SamplerAsset {
    pub(crate) fn new(
        device: Arc<Device>,
        deferred: Arc<DeferredQueue>,
        info: SamplerInfo,
    ) -> Result<Self> {
        let create_info = vk::SamplerCreateInfo::default()
            .min_filter(info.min_filter)
            .mag_filter(info.mag_filter)
            .mipmap_mode(info.mipmap_mode)
            .address_mode_u(info.address_mode)
            .address_mode_v(info.address_mode)
            .address_mode_w(info.address_mode)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .compare_op(vk::CompareOp::ALWAYS)
            .min_lod(0.0)
            .max_lod(0.0);
        let raw = unsafe { device.raw.create_sampler(&create_info, None)? };
        Ok(Self {
            raw,
            device,
            deferred,
        })
    }
}

impl Drop for SamplerAsset {
    fn drop(&mut self) {
        let device = self.device.clone();
        let raw = self.raw;
        self.deferred
            .release(move || unsafe { device.raw.destroy_sampler(raw, None) });
    }
}

/// How a texture obtains its pixels.
pub enum TextureSource {
    Raw(RawImage),
    Encoded(Vec<u8>),
    /// Watched on disk; reloads re-run the codec on the new bytes.
    File(PathBuf),
}

pub struct TextureInfo {
    pub source: TextureSource,
    pub codec: Option<Codec>,
    pub sampler: String,
}

impl TextureInfo {
    pub fn from_raw(raw: RawImage) -> Self {
        Self {
            source: TextureSource::Raw(raw),
            codec: None,
            sampler: super::DEFAULT_SAMPLER_ID.to_owned(),
        }
    }
}

pub struct TextureAsset {
    pub(crate) active: Image,
    pub(crate) standby: Option<Image>,
    pub(crate) loaded: Option<vk::Fence>,
    pub(crate) reloading: bool,
    pub(crate) codec: Option<Codec>,
    pub(crate) monitor: Option<FileMonitor>,
    pub(crate) sampler: String,
}

impl TextureAsset {
    pub fn extent(&self) -> vk::Extent3D {
        self.active.extent()
    }

    pub(crate) fn view(&self) -> vk::ImageView {
        self.active.view()
    }
}

pub struct CubemapInfo {
    /// Right, left, up, down, front, back.
    pub sources: CubemapSource,
    pub codec: Option<Codec>,
    pub sampler: String,
}

pub enum CubemapSource {
    Raw([RawImage; 6]),
    Files([PathBuf; 6]),
}

pub struct CubemapAsset {
    pub(crate) active: Image,
    pub(crate) standby: Option<Image>,
    pub(crate) loaded: Option<vk::Fence>,
    pub(crate) reloading: bool,
    pub(crate) codec: Option<Codec>,
    pub(crate) monitors: Vec<FileMonitor>,
    pub(crate) sampler: String,
}

impl CubemapAsset {
    pub(crate) fn view(&self) -> vk::ImageView {
        self.active.view()
    }
}

pub enum ShaderSource {
    SpirvBytes(Vec<u8>, ShaderStage),
    /// `.vert`/`.frag` source compiled through the external compiler and
    /// watched for changes.
    GlslFile(PathBuf),
}

pub struct ShaderInfo {
    pub source: ShaderSource,
}

pub struct ShaderAsset {
    pub(crate) module: ShaderModule,
    pub(crate) standby: Option<ShaderModule>,
    pub(crate) stage: ShaderStage,
    pub(crate) monitor: Option<FileMonitor>,
    pub(crate) source: Option<PathBuf>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub colour: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub(crate) fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    pub(crate) fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 4] {
        [
            vk::VertexInputAttributeDescription::default()
                .location(0)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(0),
            vk::VertexInputAttributeDescription::default()
                .location(1)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(12),
            vk::VertexInputAttributeDescription::default()
                .location(2)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(24),
            vk::VertexInputAttributeDescription::default()
                .location(3)
                .binding(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(36),
        ]
    }
}

pub struct MeshInfo {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

pub struct MeshAsset {
    pub(crate) vbo: Buffer,
    pub(crate) ibo: Option<Buffer>,
    pub(crate) vertex_count: u32,
    pub(crate) index_count: u32,
    pub(crate) loaded: Vec<vk::Fence>,
}

#[derive(Debug, Clone)]
pub struct MaterialInfo {
    pub ambient: [f32; 4],
    pub diffuse: [f32; 4],
    pub specular: [f32; 4],
    pub drop_colour: [f32; 4],
    pub tint: [f32; 4],
    pub shininess: f32,
    pub flags: DrawFlags,
}

impl Default for MaterialInfo {
    fn default() -> Self {
        Self {
            ambient: [1.0; 4],
            diffuse: [1.0; 4],
            specular: [1.0; 4],
            drop_colour: [0.0, 0.0, 0.0, 1.0],
            tint: [1.0; 4],
            shininess: 32.0,
            flags: DrawFlags::OPAQUE,
        }
    }
}

pub struct MaterialAsset {
    pub data: MaterialInfo,
}

impl MaterialAsset {
    pub(crate) fn to_gpu(&self) -> GpuMaterial {
        GpuMaterial {
            ambient: self.data.ambient,
            diffuse: self.data.diffuse,
            specular: self.data.specular,
            drop_colour: self.data.drop_colour,
            shininess: self.data.shininess,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineState {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub line_width: f32,
    pub depth_test: bool,
    pub depth_write: bool,
    pub alpha_blend: bool,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            line_width: 1.0,
            depth_test: true,
            depth_write: true,
            alpha_blend: false,
        }
    }
}

pub struct PipelineInfo {
    pub vertex_shader: String,
    pub fragment_shader: String,
    pub render_pass: vk::RenderPass,
    pub state: PipelineState,
}

pub struct PipelineAsset {
    pub(crate) raw: vk::Pipeline,
    pub(crate) vertex_shader: String,
    pub(crate) fragment_shader: String,
    pub(crate) shader_generations: (u64, u64),
    pub(crate) render_pass: vk::RenderPass,
    pub(crate) state: PipelineState,
    pub(crate) device: Arc<Device>,
    pub(crate) deferred: Arc<DeferredQueue>,
}

impl PipelineAsset {
    pub(crate) fn replace_raw(&mut self, raw: vk::Pipeline) {
        let device = self.device.clone();
        let old = std::mem::replace(&mut self.raw, raw);
        self.deferred
            .release(move || unsafe { device.raw.destroy_pipeline(old, None) });
    }
}

impl Drop for PipelineAsset {
    fn drop(&mut self) {
        let device = self.device.clone();
        let raw = self.raw;
        self.deferred
            .release(move || unsafe { device.raw.destroy_pipeline(raw, None) });
    }
}

/// Ordering bucket for higher-level passes; pipelines reference these by
/// name and consumers iterate them by `order`.
#[derive(Debug, Clone)]
pub struct RenderLayerInfo {
    pub order: i32,
    pub pipeline: String,
}

pub struct RenderLayerAsset {
    pub data: RenderLayerInfo,
}

/// Viewport and scissor stay dynamic so swapchain recreation never touches
/// pipelines.
pub(crate) fn build_graphics_pipeline(
    device: &Device,
    layouts: &DescriptorLayouts,
    vertex: &ShaderModule,
    fragment: &ShaderModule,
    render_pass: vk::RenderPass,
    state: PipelineState,
) -> Result<vk::Pipeline> {
    let entry_point = CString::new("main").unwrap();
    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vertex.stage.to_vulkan_flags())
            .module(vertex.raw)
            .name(&entry_point),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(fragment.stage.to_vulkan_flags())
            .module(fragment.raw)
            .name(&entry_point),
    ];

    let vertex_bindings = [Vertex::binding_description()];
    let vertex_attributes = Vertex::attribute_descriptions();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&vertex_bindings)
        .vertex_attribute_descriptions(&vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(state.topology)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(state.polygon_mode)
        .cull_mode(state.cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(device.caps().clamp_line_width(state.line_width));

    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(state.depth_test)
        .depth_write_enable(state.depth_write)
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
        .min_depth_bounds(0.0)
        .max_depth_bounds(1.0);

    let blend_attachment = if state.alpha_blend {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    } else {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    };
    let blend_attachments = [blend_attachment];
    let colour_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let create_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&colour_blend)
        .dynamic_state(&dynamic_state)
        .layout(layouts.pipeline_layout)
        .render_pass(render_pass)
        .subpass(0);

    let raw = unsafe {
        device
            .raw
            .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
            .map_err(|(_, err)| err)?[0]
    };
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 44);
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[3].offset, 36);
    }

    #[test]
    fn raw_image_validation_checks_byte_count() {
        assert!(RawImage::solid([255; 4]).validate().is_ok());
        let bad = RawImage {
            size: [2, 2],
            bytes: vec![0; 3],
        };
        assert!(bad.validate().is_err());
    }
}
