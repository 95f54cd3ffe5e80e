/*! The frame scheduler: drives the virtual-frame ring through
 * acquire -> record -> submit -> present with per-frame fences, semaphores,
 * command pools, and descriptor sets.
 */

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;

use crate::{
    deferred::{DeferredQueue, FrameClock},
    error::GfxError,
    store::{Asset, AssetStatus, Store, BLACK_TEXTURE_ID, BLANK_CUBEMAP_ID, WHITE_TEXTURE_ID},
    vulkan::{
        command::{CommandBuffer, CommandPool},
        swapchain::{Acquired, ContextOptions, ContextState, RenderContext, RenderTarget},
        vram::Vram,
        Device, Fence, Semaphore,
    },
    window::WindowSource,
    WindowId,
};

pub mod descriptor;
pub mod draw_list;

use descriptor::{
    DescriptorLayouts, DrawFlags, FrameSets, GpuDirLight, PushConstants, SsboArrays, ViewUbo,
    CUBEMAP_BINDING, DIFFUSE_BINDING, SPECULAR_BINDING,
};
use draw_list::{transform_scissor, transform_viewport, Scene, ScreenRect};

pub const DEFAULT_VIRTUAL_FRAMES: u8 = 2;

const MAGENTA: [f32; 4] = [1.0, 0.0, 1.0, 1.0];

/// One ring slot. The command pool is per-slot so it can be reset in
/// isolation while other slots remain in flight.
struct FrameSync {
    command_pool: CommandPool,
    command_buffer: CommandBuffer,
    render_ready: Semaphore,
    present_ready: Semaphore,
    in_flight: Fence,
    framebuffer: vk::Framebuffer,
    sets: FrameSets,
    nascent: bool,
}

/// A drawable resolved against the store into raw handles for recording.
struct ResolvedDraw {
    pipeline: vk::Pipeline,
    vbo: vk::Buffer,
    ibo: Option<vk::Buffer>,
    vertex_count: u32,
    index_count: u32,
    pc: PushConstants,
}

struct PreparedBatch {
    viewport: ScreenRect,
    scissor: ScreenRect,
    draws: Vec<ResolvedDraw>,
}

/// Which draws need a pipeline (and descriptor-set) rebind. Single source
/// of truth for the memoization rule.
fn bind_plan(draws: &[ResolvedDraw]) -> Vec<bool> {
    let mut plan = Vec::with_capacity(draws.len());
    let mut last = vk::Pipeline::null();
    for draw in draws {
        plan.push(draw.pipeline != last);
        last = draw.pipeline;
    }
    plan
}

pub struct Renderer {
    device: Arc<Device>,
    vram: Arc<Vram>,
    deferred: Arc<DeferredQueue>,
    layouts: Arc<DescriptorLayouts>,
    context: RenderContext,
    descriptor_pool: vk::DescriptorPool,
    frames: Vec<FrameSync>,
    index: usize,
    clock: Arc<FrameClock>,
    window_id: WindowId,
    virtual_frames: u8,
}

impl Renderer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<Device>,
        vram: Arc<Vram>,
        deferred: Arc<DeferredQueue>,
        layouts: Arc<DescriptorLayouts>,
        window: Arc<dyn WindowSource>,
        window_id: WindowId,
        virtual_frames: u8,
        options: ContextOptions,
    ) -> Result<Self> {
        anyhow::ensure!(virtual_frames > 0, "virtual frame count must be non-zero");
        let context = RenderContext::new(
            device.clone(),
            vram.clone(),
            window,
            window_id,
            options,
        )?;
        let clock = deferred.register_clock(window_id, virtual_frames);
        let mut renderer = Self {
            device,
            vram,
            deferred,
            layouts,
            context,
            descriptor_pool: vk::DescriptorPool::null(),
            frames: Vec::new(),
            index: 0,
            clock,
            window_id,
            virtual_frames,
        };
        renderer.create_slots()?;
        Ok(renderer)
    }

    pub fn window_id(&self) -> WindowId {
        self.window_id
    }

    pub fn virtual_frames(&self) -> u8 {
        self.virtual_frames
    }

    pub fn frames_drawn(&self) -> u64 {
        self.clock.frames_drawn()
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.context.render_pass()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.context.extent()
    }

    pub fn on_framebuffer_resize(&mut self) -> Result<()> {
        self.context.on_framebuffer_resize()
    }

    fn create_slots(&mut self) -> Result<()> {
        if !self.frames.is_empty() {
            return Ok(());
        }
        let count = self.virtual_frames as u32;
        let texture_descriptors = (2 * self.layouts.texture_array_len + 1) * count;
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(count),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(6 * count),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(texture_descriptors),
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(3 * count)
            .pool_sizes(&pool_sizes);
        self.descriptor_pool = unsafe {
            self.device
                .raw
                .create_descriptor_pool(&pool_info, None)?
        };

        let set_layouts = [self.layouts.view, self.layouts.object, self.layouts.textures];
        for _ in 0..count {
            let allocate_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(self.descriptor_pool)
                .set_layouts(&set_layouts);
            let sets = unsafe { self.device.raw.allocate_descriptor_sets(&allocate_info)? };

            let command_pool = CommandPool::new(
                self.device.clone(),
                self.device.caps().queue_families.graphics,
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?;
            let command_buffer = CommandBuffer::new_from_raw(
                command_pool.allocate_primary(1)?[0],
                self.device.clone(),
            );
            self.frames.push(FrameSync {
                command_pool,
                command_buffer,
                render_ready: Semaphore::new(self.device.clone())?,
                present_ready: Semaphore::new(self.device.clone())?,
                in_flight: Fence::new(self.device.clone(), false)?,
                framebuffer: vk::Framebuffer::null(),
                sets: FrameSets::new(sets[0], sets[1], sets[2]),
                nascent: true,
            });
        }
        log::debug!("[{}] renderer slots created", self.window_id);
        Ok(())
    }

    fn destroy_slots(&mut self) {
        if self.frames.is_empty() {
            return;
        }
        for frame in self.frames.drain(..) {
            if frame.framebuffer != vk::Framebuffer::null() {
                unsafe { self.device.raw.destroy_framebuffer(frame.framebuffer, None) };
            }
        }
        if self.descriptor_pool != vk::DescriptorPool::null() {
            unsafe {
                self.device
                    .raw
                    .destroy_descriptor_pool(self.descriptor_pool, None)
            };
            self.descriptor_pool = vk::DescriptorPool::null();
        }
        self.index = 0;
        log::debug!("[{}] renderer slots destroyed", self.window_id);
    }

    /// Consumes the context state: swapchain recreation rebuilds every slot,
    /// waits the device idle once, and marks all slots nascent.
    pub fn update(&mut self) -> Result<()> {
        match self.context.state() {
            ContextState::Destroyed | ContextState::SwapchainDestroyed => {
                self.destroy_slots();
            }
            ContextState::SwapchainRecreated => {
                self.destroy_slots();
                self.create_slots()?;
                self.device.wait_idle()?;
                self.clock.reset();
                log::debug!("[{}] renderer reset", self.window_id);
            }
            ContextState::Running => {}
        }
        Ok(())
    }

    /// Runs one virtual frame. Returns false when nothing was presented (a
    /// paused or just-recreated swapchain); a failed frame renders nothing.
    pub fn render(&mut self, scene: &Scene, store: &Store) -> Result<bool> {
        if self.device.is_lost() {
            return Err(GfxError::DeviceLost.into());
        }
        self.update()?;
        if self.context.is_paused() {
            return Ok(false);
        }
        if self.frames.is_empty() {
            self.create_slots()?;
        }

        let index = self.index;
        let frame = &mut self.frames[index];
        if !frame.nascent {
            frame.in_flight.wait()?;
        }

        let prepared = prepare_draws(
            &self.device,
            &self.vram,
            self.layouts.texture_array_len,
            &mut frame.sets,
            scene,
            store,
        )?;

        let target = match self
            .context
            .acquire(frame.render_ready.raw, frame.in_flight.raw)?
        {
            Acquired::Paused => return Ok(false),
            Acquired::Recreated => {
                self.update()?;
                return Ok(false);
            }
            Acquired::Target(target) => target,
        };

        let frame = &mut self.frames[index];
        Self::recreate_framebuffer(&self.device, frame, &target)?;

        frame.command_pool.reset(true)?;
        record_frame(
            &frame.command_buffer,
            frame.framebuffer,
            &frame.sets,
            self.layouts.pipeline_layout,
            &target,
            scene,
            &prepared,
        )?;

        frame.in_flight.reset()?;
        self.device.submit_graphics(
            frame.command_buffer.raw,
            frame.render_ready.raw,
            frame.present_ready.raw,
            frame.in_flight.raw,
        )?;
        frame.nascent = false;

        let presented = self.context.present(frame.present_ready.raw)?;
        if presented {
            self.next();
        }
        self.deferred.update();
        Ok(presented)
    }

    fn next(&mut self) {
        self.index = (self.index + 1) % self.frames.len();
        self.clock.advance();
    }

    fn recreate_framebuffer(
        device: &Device,
        frame: &mut FrameSync,
        target: &RenderTarget,
    ) -> Result<()> {
        if frame.framebuffer != vk::Framebuffer::null() {
            unsafe { device.raw.destroy_framebuffer(frame.framebuffer, None) };
        }
        let attachments = [target.colour, target.depth];
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(target.render_pass)
            .attachments(&attachments)
            .width(target.extent.width)
            .height(target.extent.height)
            .layers(1);
        frame.framebuffer = unsafe { device.raw.create_framebuffer(&info, None)? };
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.device.wait_idle().ok();
        self.destroy_slots();
        self.deferred.unregister_clock(self.window_id);
    }
}

fn texture_view_sampler(store: &Store, id: &str) -> Option<(vk::ImageView, vk::Sampler)> {
    let (view, sampler_id) = store.with_entry(id, |entry| {
        let servable = matches!(entry.status, AssetStatus::Ready | AssetStatus::Reloaded)
            || matches!((&entry.status, &entry.asset), (AssetStatus::Loading, Asset::Texture(t)) if t.reloading);
        match &entry.asset {
            Asset::Texture(texture) if servable => {
                Some((texture.view(), texture.sampler.clone()))
            }
            _ => None,
        }
    })??;
    let sampler = store.with_entry(&sampler_id, |entry| match &entry.asset {
        Asset::Sampler(sampler) => Some(sampler.raw),
        _ => None,
    })??;
    Some((view, sampler))
}

fn cubemap_view_sampler(store: &Store, id: &str) -> Option<(vk::ImageView, vk::Sampler)> {
    let (view, sampler_id) = store.with_entry(id, |entry| {
        let servable = matches!(entry.status, AssetStatus::Ready | AssetStatus::Reloaded)
            || matches!((&entry.status, &entry.asset), (AssetStatus::Loading, Asset::Cubemap(c)) if c.reloading);
        match &entry.asset {
            Asset::Cubemap(cubemap) if servable => {
                Some((cubemap.view(), cubemap.sampler.clone()))
            }
            _ => None,
        }
    })??;
    let sampler = store.with_entry(&sampler_id, |entry| match &entry.asset {
        Asset::Sampler(sampler) => Some(sampler.raw),
        _ => None,
    })??;
    Some((view, sampler))
}

/// Fills the slot's descriptors from the draw list and resolves every
/// drawable to raw handles. Runs before acquisition, after the slot's fence
/// wait.
fn prepare_draws(
    device: &Device,
    vram: &Arc<Vram>,
    texture_array_len: u32,
    sets: &mut FrameSets,
    scene: &Scene,
    store: &Store,
) -> Result<Vec<PreparedBatch>> {
    let mut ssbos = SsboArrays::default();
    let mut object_id: u32 = 0;
    let mut diffuse_id: u32 = 0;
    let mut specular_id: u32 = 0;

    let (white_view, white_sampler) = texture_view_sampler(store, WHITE_TEXTURE_ID)
        .context("white fallback texture missing")?;
    let (black_view, black_sampler) = texture_view_sampler(store, BLACK_TEXTURE_ID)
        .context("black fallback texture missing")?;
    sets.write_combined_image(device, DIFFUSE_BINDING, diffuse_id, white_view, white_sampler);
    diffuse_id += 1;
    sets.write_combined_image(
        device,
        SPECULAR_BINDING,
        specular_id,
        black_view,
        black_sampler,
    );
    specular_id += 1;

    let cubemap = scene
        .cubemap
        .as_deref()
        .and_then(|id| cubemap_view_sampler(store, id))
        .or_else(|| cubemap_view_sampler(store, BLANK_CUBEMAP_ID))
        .context("blank fallback cubemap missing")?;
    sets.write_combined_image(device, CUBEMAP_BINDING, 0, cubemap.0, cubemap.1);

    let mut prepared = Vec::with_capacity(scene.draw_list.batches.len());
    for batch in &scene.draw_list.batches {
        let mut ordered: Vec<_> = batch.drawables.iter().collect();
        ordered.sort_by(|a, b| a.pipeline.cmp(&b.pipeline));

        let mut draws = Vec::with_capacity(ordered.len());
        for drawable in ordered {
            let Some(mesh) = store.with_entry(&drawable.mesh, |entry| match &entry.asset {
                Asset::Mesh(mesh) if entry.status == AssetStatus::Ready => Some((
                    mesh.vbo.raw,
                    mesh.ibo.as_ref().map(|ibo| ibo.raw),
                    mesh.vertex_count,
                    mesh.index_count,
                )),
                _ => None,
            }).flatten() else {
                log::trace!("skipping drawable: mesh [{}] not ready", drawable.mesh);
                continue;
            };
            let Some(pipeline) = store
                .with_entry(&drawable.pipeline, |entry| match &entry.asset {
                    Asset::Pipeline(pipeline) => Some(pipeline.raw),
                    _ => None,
                })
                .flatten()
            else {
                log::trace!("skipping drawable: pipeline [{}] not ready", drawable.pipeline);
                continue;
            };

            let material = drawable.material.material.as_deref().and_then(|id| {
                store
                    .with_entry(id, |entry| match &entry.asset {
                        Asset::Material(material) => {
                            Some((material.to_gpu(), material.data.tint, material.data.flags))
                        }
                        _ => None,
                    })
                    .flatten()
            });
            // Missing material shows up magenta.
            let (gpu_material, mut tint, flags) = material.unwrap_or((
                Default::default(),
                MAGENTA,
                DrawFlags::OPAQUE,
            ));

            let mut pc = PushConstants {
                object_id,
                ..Default::default()
            };
            if flags.contains(DrawFlags::TEXTURED) {
                let diffuse = drawable
                    .material
                    .diffuse
                    .as_deref()
                    .and_then(|id| texture_view_sampler(store, id));
                match diffuse {
                    Some((view, sampler)) if diffuse_id < texture_array_len => {
                        sets.write_combined_image(device, DIFFUSE_BINDING, diffuse_id, view, sampler);
                        pc.diffuse_id = diffuse_id;
                        diffuse_id += 1;
                    }
                    _ => {
                        tint = MAGENTA;
                        pc.diffuse_id = 0;
                    }
                }
                let specular = drawable
                    .material
                    .specular
                    .as_deref()
                    .and_then(|id| texture_view_sampler(store, id));
                if let Some((view, sampler)) = specular {
                    if specular_id < texture_array_len {
                        sets.write_combined_image(
                            device,
                            SPECULAR_BINDING,
                            specular_id,
                            view,
                            sampler,
                        );
                        pc.specular_id = specular_id;
                        specular_id += 1;
                    }
                }
            }

            let normal = drawable
                .transform
                .try_inverse()
                .map(|inverse| inverse.transpose())
                .unwrap_or_else(nalgebra::Matrix4::identity);
            ssbos.models.push(drawable.transform.into());
            ssbos.normals.push(normal.into());
            ssbos.materials.push(gpu_material);
            ssbos.tints.push(tint);
            ssbos.flags.push(flags.bits());
            draws.push(ResolvedDraw {
                pipeline,
                vbo: mesh.0,
                ibo: mesh.1,
                vertex_count: mesh.2,
                index_count: mesh.3,
                pc,
            });
            object_id += 1;
        }
        prepared.push(PreparedBatch {
            viewport: batch.viewport,
            scissor: batch.scissor,
            draws,
        });
    }

    ssbos.dir_lights = scene
        .dir_lights
        .iter()
        .map(|light| GpuDirLight {
            ambient: [light.ambient.x, light.ambient.y, light.ambient.z, 0.0],
            diffuse: [light.diffuse.x, light.diffuse.y, light.diffuse.z, 0.0],
            specular: [light.specular.x, light.specular.y, light.specular.z, 0.0],
            direction: [light.direction.x, light.direction.y, light.direction.z, 0.0],
        })
        .collect();
    ssbos.ensure_non_empty();
    sets.write_ssbos(device, vram, &ssbos)?;

    let view = &scene.view;
    let view_ubo = ViewUbo {
        mat_vp: (view.mat_p * view.mat_v).into(),
        mat_v: view.mat_v.into(),
        mat_p: view.mat_p.into(),
        mat_ui: view.mat_ui.into(),
        eye: [view.eye.x, view.eye.y, view.eye.z],
        time: view.time,
        dir_light_count: scene.dir_lights.len() as u32,
        ..Default::default()
    };
    sets.write_view(device, vram, &view_ubo)?;

    Ok(prepared)
}

/// Records the whole frame into the slot's primary command buffer.
fn record_frame(
    command_buffer: &CommandBuffer,
    framebuffer: vk::Framebuffer,
    sets: &FrameSets,
    pipeline_layout: vk::PipelineLayout,
    target: &RenderTarget,
    scene: &Scene,
    prepared: &[PreparedBatch],
) -> Result<()> {
    command_buffer.begin_one_time()?;
    let clear_values = [
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: scene.clear_colour,
            },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: scene.clear_depth,
                stencil: scene.clear_stencil,
            },
        },
    ];
    command_buffer.begin_render_pass(
        target.render_pass,
        framebuffer,
        target.extent,
        &clear_values,
    );

    let descriptor_sets = [sets.view_set, sets.object_set, sets.texture_set];
    for batch in prepared {
        command_buffer.set_viewport(transform_viewport(batch.viewport, target.extent, [0.0, 1.0]));
        command_buffer.set_scissor(transform_scissor(batch.scissor, target.extent));
        let plan = bind_plan(&batch.draws);
        for (draw, rebind) in batch.draws.iter().zip(plan) {
            if rebind {
                command_buffer.bind_pipeline_graphics(draw.pipeline);
                command_buffer.bind_descriptor_sets_graphics(pipeline_layout, &descriptor_sets);
            }
            command_buffer.push_constants(
                pipeline_layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                bytemuck::bytes_of(&draw.pc),
            );
            command_buffer.bind_vertex_buffer(draw.vbo);
            match draw.ibo {
                Some(ibo) => {
                    command_buffer.bind_index_buffer(ibo);
                    command_buffer.draw_indexed(draw.index_count);
                }
                None => command_buffer.draw(draw.vertex_count),
            }
        }
    }

    command_buffer.end_render_pass();
    command_buffer.end()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn draw(pipeline: u64) -> ResolvedDraw {
        ResolvedDraw {
            pipeline: vk::Pipeline::from_raw(pipeline),
            vbo: vk::Buffer::null(),
            ibo: None,
            vertex_count: 3,
            index_count: 0,
            pc: PushConstants::default(),
        }
    }

    #[test]
    fn thousand_drawables_one_pipeline_bind_once() {
        let draws: Vec<_> = (0..1000).map(|_| draw(1)).collect();
        let plan = bind_plan(&draws);
        assert_eq!(plan.len(), 1000);
        assert_eq!(plan.iter().filter(|&&rebind| rebind).count(), 1);
        // Push constants and draws still happen per drawable.
        assert_eq!(draws.len(), 1000);
    }

    #[test]
    fn pipeline_change_forces_rebind() {
        let draws = vec![draw(1), draw(1), draw(2), draw(1)];
        let plan = bind_plan(&draws);
        assert_eq!(plan, vec![true, false, true, true]);
    }
}
