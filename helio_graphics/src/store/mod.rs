/*! Maps stable string identifiers to typed GPU assets, watches their source
 * files, and stages replacements without tearing a frame in flight.
 */

use std::{
    collections::HashMap,
    fs, mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;

use crate::{
    deferred::DeferredQueue,
    error::GfxError,
    renderer::descriptor::DescriptorLayouts,
    vulkan::{
        shader::{compile_glsl, ShaderModule, ShaderStage},
        vram::{BufferInfo, Image, ImageInfo, Vram},
        Device, QueueFlags,
    },
};

pub mod assets;
pub mod monitor;

use assets::{
    build_graphics_pipeline, CubemapAsset, CubemapInfo, CubemapSource, MaterialAsset,
    MaterialInfo, MeshAsset, MeshInfo, PipelineAsset, PipelineInfo, RawImage, RenderLayerAsset,
    RenderLayerInfo, SamplerAsset, SamplerInfo, ShaderAsset, ShaderInfo, ShaderSource,
    TextureAsset, TextureInfo, TextureSource,
};
use monitor::{FileMonitor, MonitorStatus};

pub const DEFAULT_SAMPLER_ID: &str = "samplers/default";
pub const WHITE_TEXTURE_ID: &str = "textures/white";
pub const BLACK_TEXTURE_ID: &str = "textures/black";
pub const BLANK_CUBEMAP_ID: &str = "cubemaps/blank";

const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Monotonically increasing store-wide identifier; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetStatus {
    Loading,
    Ready,
    Reloaded,
    Error,
}

/// Closed tagged sum over the recognised asset kinds.
pub enum Asset {
    Sampler(SamplerAsset),
    Texture(TextureAsset),
    Cubemap(CubemapAsset),
    Shader(ShaderAsset),
    Mesh(MeshAsset),
    Material(MaterialAsset),
    Pipeline(PipelineAsset),
    RenderLayer(RenderLayerAsset),
}

impl Asset {
    pub fn kind(&self) -> &'static str {
        match self {
            Asset::Sampler(_) => "sampler",
            Asset::Texture(_) => "texture",
            Asset::Cubemap(_) => "cubemap",
            Asset::Shader(_) => "shader",
            Asset::Mesh(_) => "mesh",
            Asset::Material(_) => "material",
            Asset::Pipeline(_) => "pipeline",
            Asset::RenderLayer(_) => "render-layer",
        }
    }
}

pub struct AssetEntry {
    pub id: String,
    pub guid: Guid,
    pub status: AssetStatus,
    /// Bumped on every active-payload swap; pipelines use it to notice
    /// shader reloads.
    pub generation: u64,
    pub asset: Asset,
}

pub enum AssetInfo {
    Sampler(SamplerInfo),
    Texture(TextureInfo),
    Cubemap(CubemapInfo),
    Shader(ShaderInfo),
    Mesh(MeshInfo),
    Material(MaterialInfo),
    Pipeline(PipelineInfo),
    RenderLayer(RenderLayerInfo),
}

/// Named collection resolved against the store. Parameter decoding stays
/// with the caller; only the identifier-to-kind mapping is fixed here.
#[derive(Debug, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct Manifest {
    pub assets: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let manifest = serde_json::from_slice(bytes).context("failed to parse asset manifest")?;
        Ok(manifest)
    }
}

/// A stable new version shows as modified-then-up-to-date across two polls.
fn reload_edge(last: MonitorStatus, current: MonitorStatus) -> bool {
    last == MonitorStatus::Modified && current == MonitorStatus::UpToDate
}

/// Owns every asset payload. Consumers hold borrow-only access keyed by
/// identifier; the map is reader-biased, each entry carries its own lock.
pub struct Store {
    device: Arc<Device>,
    vram: Arc<Vram>,
    deferred: Arc<DeferredQueue>,
    layouts: Arc<DescriptorLayouts>,
    map: RwLock<HashMap<String, Arc<Mutex<AssetEntry>>>>,
    next_guid: AtomicU64,
}

impl Store {
    pub fn new(
        device: Arc<Device>,
        vram: Arc<Vram>,
        deferred: Arc<DeferredQueue>,
        layouts: Arc<DescriptorLayouts>,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(Self {
            device,
            vram,
            deferred,
            layouts,
            map: RwLock::new(HashMap::new()),
            next_guid: AtomicU64::new(0),
        });
        store.create_builtins()?;
        Ok(store)
    }

    /// Deterministic fallbacks: white diffuse, black specular, blank
    /// cubemap, default sampler.
    fn create_builtins(self: &Arc<Self>) -> Result<()> {
        self.create(DEFAULT_SAMPLER_ID, AssetInfo::Sampler(SamplerInfo::default()))?;
        self.create(
            WHITE_TEXTURE_ID,
            AssetInfo::Texture(TextureInfo::from_raw(RawImage::solid([255; 4]))),
        )?;
        self.create(
            BLACK_TEXTURE_ID,
            AssetInfo::Texture(TextureInfo::from_raw(RawImage::solid([0, 0, 0, 255]))),
        )?;
        self.create(
            BLANK_CUBEMAP_ID,
            AssetInfo::Cubemap(CubemapInfo {
                sources: CubemapSource::Raw(std::array::from_fn(|_| {
                    RawImage::solid([0, 0, 0, 255])
                })),
                codec: None,
                sampler: DEFAULT_SAMPLER_ID.to_owned(),
            }),
        )?;
        Ok(())
    }

    /// Takes ownership of the payload by value, assigns it a GUID, and
    /// starts the entry through the status machine.
    pub fn create(self: &Arc<Self>, id: &str, info: AssetInfo) -> Result<Guid> {
        if self.map.read().contains_key(id) {
            anyhow::bail!("asset id already loaded: {id}");
        }
        let (asset, status) = self
            .build_payload(id, info)
            .with_context(|| format!("failed to create asset [{id}]"))?;
        let guid = Guid(self.next_guid.fetch_add(1, Ordering::Relaxed));
        let entry = AssetEntry {
            id: id.to_owned(),
            guid,
            status,
            generation: 0,
            asset,
        };
        log::debug!("[{id}] created ({})", entry.asset.kind());
        self.map
            .write()
            .insert(id.to_owned(), Arc::new(Mutex::new(entry)));
        Ok(guid)
    }

    fn build_payload(self: &Arc<Self>, id: &str, info: AssetInfo) -> Result<(Asset, AssetStatus)> {
        match info {
            AssetInfo::Sampler(info) => {
                let sampler = SamplerAsset::new(self.device.clone(), self.deferred.clone(), info)?;
                Ok((Asset::Sampler(sampler), AssetStatus::Ready))
            }
            AssetInfo::Texture(info) => {
                let (raw, monitor) = match info.source {
                    TextureSource::Raw(raw) => (raw, None),
                    TextureSource::Encoded(bytes) => {
                        let codec = info
                            .codec
                            .as_ref()
                            .ok_or_else(|| GfxError::AssetCodec("codec required".into()))?;
                        (codec(&bytes)?, None)
                    }
                    TextureSource::File(path) => {
                        let codec = info
                            .codec
                            .as_ref()
                            .ok_or_else(|| GfxError::AssetCodec("codec required".into()))?;
                        let bytes = fs::read(&path)
                            .map_err(|_| GfxError::AssetNotFound(path.display().to_string()))?;
                        (codec(&bytes)?, Some(FileMonitor::new(path)))
                    }
                };
                raw.validate()?;
                let (image, fence) = self.upload_texture_image(&raw)?;
                let texture = TextureAsset {
                    active: image,
                    standby: None,
                    loaded: Some(fence),
                    reloading: false,
                    codec: info.codec,
                    monitor,
                    sampler: info.sampler,
                };
                Ok((Asset::Texture(texture), AssetStatus::Loading))
            }
            AssetInfo::Cubemap(info) => {
                let (faces, monitors) = match info.sources {
                    CubemapSource::Raw(faces) => (faces, Vec::new()),
                    CubemapSource::Files(paths) => {
                        let codec = info
                            .codec
                            .as_ref()
                            .ok_or_else(|| GfxError::AssetCodec("codec required".into()))?;
                        let mut faces = Vec::with_capacity(6);
                        let mut monitors = Vec::with_capacity(6);
                        for path in &paths {
                            let bytes = fs::read(path)
                                .map_err(|_| GfxError::AssetNotFound(path.display().to_string()))?;
                            faces.push(codec(&bytes)?);
                            monitors.push(FileMonitor::new(path.clone()));
                        }
                        let faces: [RawImage; 6] = faces
                            .try_into()
                            .map_err(|_| GfxError::AssetCodec("expected six faces".into()))?;
                        (faces, monitors)
                    }
                };
                let (image, fence) = self.upload_cubemap_image(&faces)?;
                let cubemap = CubemapAsset {
                    active: image,
                    standby: None,
                    loaded: Some(fence),
                    reloading: false,
                    codec: info.codec,
                    monitors,
                    sampler: info.sampler,
                };
                Ok((Asset::Cubemap(cubemap), AssetStatus::Loading))
            }
            AssetInfo::Shader(info) => {
                let (module, stage, monitor, source) = match info.source {
                    ShaderSource::SpirvBytes(bytes, stage) => {
                        let module =
                            ShaderModule::from_spirv_bytes(self.device.clone(), stage, &bytes)?;
                        (module, stage, None, None)
                    }
                    ShaderSource::GlslFile(path) => {
                        let stage = ShaderStage::from_source_path(&path).ok_or_else(|| {
                            GfxError::ShaderCompile(format!(
                                "unrecognised shader extension: {}",
                                path.display()
                            ))
                        })?;
                        let bytes = compile_glsl(&path)?;
                        let module =
                            ShaderModule::from_spirv_bytes(self.device.clone(), stage, &bytes)?;
                        (module, stage, Some(FileMonitor::new(path.clone())), Some(path))
                    }
                };
                let shader = ShaderAsset {
                    module,
                    standby: None,
                    stage,
                    monitor,
                    source,
                };
                Ok((Asset::Shader(shader), AssetStatus::Ready))
            }
            AssetInfo::Mesh(info) => {
                anyhow::ensure!(!info.vertices.is_empty(), "mesh has no vertices");
                let vertex_bytes: &[u8] = bytemuck::cast_slice(&info.vertices);
                let vbo = self.vram.create_buffer(BufferInfo {
                    size: vertex_bytes.len() as vk::DeviceSize,
                    usage: vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                    location: gpu_allocator::MemoryLocation::GpuOnly,
                    queue_flags: QueueFlags::GRAPHICS | QueueFlags::TRANSFER,
                })?;
                let mut loaded = vec![self.vram.stage_to_buffer(&vbo, vertex_bytes)?];
                let ibo = if info.indices.is_empty() {
                    None
                } else {
                    let index_bytes: &[u8] = bytemuck::cast_slice(&info.indices);
                    let ibo = self.vram.create_buffer(BufferInfo {
                        size: index_bytes.len() as vk::DeviceSize,
                        usage: vk::BufferUsageFlags::INDEX_BUFFER
                            | vk::BufferUsageFlags::TRANSFER_DST,
                        location: gpu_allocator::MemoryLocation::GpuOnly,
                        queue_flags: QueueFlags::GRAPHICS | QueueFlags::TRANSFER,
                    })?;
                    loaded.push(self.vram.stage_to_buffer(&ibo, index_bytes)?);
                    Some(ibo)
                };
                let mesh = MeshAsset {
                    vbo,
                    ibo,
                    vertex_count: info.vertices.len() as u32,
                    index_count: info.indices.len() as u32,
                    loaded,
                };
                Ok((Asset::Mesh(mesh), AssetStatus::Loading))
            }
            AssetInfo::Material(info) => {
                Ok((Asset::Material(MaterialAsset { data: info }), AssetStatus::Ready))
            }
            AssetInfo::Pipeline(info) => {
                let generations = (
                    self.shader_generation(&info.vertex_shader)
                        .ok_or_else(|| GfxError::AssetNotFound(info.vertex_shader.clone()))?,
                    self.shader_generation(&info.fragment_shader)
                        .ok_or_else(|| GfxError::AssetNotFound(info.fragment_shader.clone()))?,
                );
                let raw = self.build_pipeline_raw(
                    &info.vertex_shader,
                    &info.fragment_shader,
                    info.render_pass,
                    info.state,
                )?;
                let pipeline = PipelineAsset {
                    raw,
                    vertex_shader: info.vertex_shader,
                    fragment_shader: info.fragment_shader,
                    shader_generations: generations,
                    render_pass: info.render_pass,
                    state: info.state,
                    device: self.device.clone(),
                    deferred: self.deferred.clone(),
                };
                Ok((Asset::Pipeline(pipeline), AssetStatus::Ready))
            }
            AssetInfo::RenderLayer(info) => Ok((
                Asset::RenderLayer(RenderLayerAsset { data: info }),
                AssetStatus::Ready,
            )),
        }
    }

    fn upload_texture_image(&self, raw: &RawImage) -> Result<(Image, vk::Fence)> {
        let vram = &self.vram;
        let image =
            vram.create_image(ImageInfo::sampled_2d(raw.size[0], raw.size[1], TEXTURE_FORMAT))?;
        let fence = vram.stage_to_image(&image, &[&raw.bytes])?;
        Ok((image, fence))
    }

    fn upload_cubemap_image(&self, faces: &[RawImage; 6]) -> Result<(Image, vk::Fence)> {
        let size = faces[0].size;
        for face in faces.iter() {
            face.validate()?;
            if face.size != size {
                return Err(GfxError::AssetCodec("cubemap face sizes differ".into()).into());
            }
        }
        let image = self
            .vram
            .create_image(ImageInfo::cubemap(size[0], size[1], TEXTURE_FORMAT))?;
        let layers: Vec<&[u8]> = faces.iter().map(|face| face.bytes.as_slice()).collect();
        let fence = self.vram.stage_to_image(&image, &layers)?;
        Ok((image, fence))
    }

    fn build_pipeline_raw(
        &self,
        vertex_id: &str,
        fragment_id: &str,
        render_pass: vk::RenderPass,
        state: assets::PipelineState,
    ) -> Result<vk::Pipeline> {
        anyhow::ensure!(
            vertex_id != fragment_id,
            "vertex and fragment stages must be distinct shader assets"
        );
        let vertex_entry = self
            .get(vertex_id)
            .ok_or_else(|| GfxError::AssetNotFound(vertex_id.to_owned()))?;
        let fragment_entry = self
            .get(fragment_id)
            .ok_or_else(|| GfxError::AssetNotFound(fragment_id.to_owned()))?;
        let vertex_guard = vertex_entry.lock();
        let fragment_guard = fragment_entry.lock();
        let (Asset::Shader(vertex), Asset::Shader(fragment)) =
            (&vertex_guard.asset, &fragment_guard.asset)
        else {
            anyhow::bail!("pipeline stages must reference shader assets");
        };
        build_graphics_pipeline(
            &self.device,
            &self.layouts,
            &vertex.module,
            &fragment.module,
            render_pass,
            state,
        )
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<AssetEntry>>> {
        self.map.read().get(id).cloned()
    }

    pub fn with_entry<R>(&self, id: &str, f: impl FnOnce(&mut AssetEntry) -> R) -> Option<R> {
        let entry = self.get(id)?;
        let mut guard = entry.lock();
        Some(f(&mut guard))
    }

    pub fn status(&self, id: &str) -> Option<AssetStatus> {
        self.with_entry(id, |entry| entry.status)
    }

    fn shader_generation(&self, id: &str) -> Option<u64> {
        self.with_entry(id, |entry| match &entry.asset {
            Asset::Shader(_) => Some(entry.generation),
            _ => None,
        })
        .flatten()
    }

    pub fn unload(&self, id: &str) -> bool {
        self.map.write().remove(id).is_some()
    }

    pub fn unload_all(&self) {
        self.map.write().clear();
    }

    /// Periodic update: polls transfer fences, performs active-standby
    /// swaps, probes file monitors, and rebuilds pipelines whose shaders
    /// reloaded.
    pub fn update(self: &Arc<Self>) {
        let entries: Vec<Arc<Mutex<AssetEntry>>> = self.map.read().values().cloned().collect();
        for entry in &entries {
            let mut guard = entry.lock();
            self.update_entry(&mut guard);
        }
        for entry in &entries {
            self.maybe_rebuild_pipeline(entry);
        }
    }

    fn update_entry(&self, entry: &mut AssetEntry) {
        match entry.status {
            AssetStatus::Loading => self.poll_loading(entry),
            AssetStatus::Reloaded => Self::perform_swap(entry),
            AssetStatus::Ready | AssetStatus::Error => self.probe_sources(entry),
        }
    }

    fn poll_loading(&self, entry: &mut AssetEntry) {
        let id = entry.id.clone();
        let done = |fences: &[vk::Fence], device: &Device| -> Result<bool> {
            for &fence in fences {
                if !device.fence_signalled(fence)? {
                    return Ok(false);
                }
            }
            Ok(true)
        };
        let outcome = match &mut entry.asset {
            Asset::Texture(texture) => {
                let fences: Vec<_> = texture.loaded.iter().copied().collect();
                match done(&fences, &self.device) {
                    Ok(true) => {
                        texture.loaded = None;
                        Some(mem::take(&mut texture.reloading))
                    }
                    Ok(false) => None,
                    Err(err) => {
                        log::error!("[{id}] transfer poll failed: {err}");
                        entry.status = AssetStatus::Error;
                        return;
                    }
                }
            }
            Asset::Cubemap(cubemap) => {
                let fences: Vec<_> = cubemap.loaded.iter().copied().collect();
                match done(&fences, &self.device) {
                    Ok(true) => {
                        cubemap.loaded = None;
                        Some(mem::take(&mut cubemap.reloading))
                    }
                    Ok(false) => None,
                    Err(err) => {
                        log::error!("[{id}] transfer poll failed: {err}");
                        entry.status = AssetStatus::Error;
                        return;
                    }
                }
            }
            Asset::Mesh(mesh) => match done(&mesh.loaded, &self.device) {
                Ok(true) => {
                    mesh.loaded.clear();
                    Some(false)
                }
                Ok(false) => None,
                Err(err) => {
                    log::error!("[{id}] transfer poll failed: {err}");
                    entry.status = AssetStatus::Error;
                    return;
                }
            },
            _ => Some(false),
        };
        match outcome {
            Some(was_reloading) => {
                entry.status = if was_reloading {
                    AssetStatus::Reloaded
                } else {
                    AssetStatus::Ready
                };
                log::debug!("[{id}] loaded");
            }
            None => log::trace!("[{id}] loading..."),
        }
    }

    /// Install the standby payload, retire the former active through the
    /// deferred queue, and bump the generation. The post-swap payload is
    /// first visible to the frame after the one that observed `Reloaded`.
    fn perform_swap(entry: &mut AssetEntry) {
        let swapped = match &mut entry.asset {
            Asset::Texture(texture) => match texture.standby.take() {
                Some(standby) => {
                    // Former active drops here and rides the deferred queue.
                    texture.active = standby;
                    true
                }
                None => false,
            },
            Asset::Cubemap(cubemap) => match cubemap.standby.take() {
                Some(standby) => {
                    cubemap.active = standby;
                    true
                }
                None => false,
            },
            Asset::Shader(shader) => match shader.standby.take() {
                Some(standby) => {
                    shader.module = standby;
                    true
                }
                None => false,
            },
            _ => false,
        };
        if swapped {
            entry.generation += 1;
            log::debug!("[{}] active payload swapped", entry.id);
        }
        entry.status = AssetStatus::Ready;
    }

    fn probe_sources(&self, entry: &mut AssetEntry) {
        let id = entry.id.clone();
        match &mut entry.asset {
            Asset::Texture(texture) => {
                let Some(monitor) = texture.monitor.as_mut() else {
                    return;
                };
                let last = monitor.last_status();
                let current = monitor.update();
                if current == MonitorStatus::NotFound {
                    log::warn!("[{id}] watched source not ready / lost");
                    return;
                }
                if !reload_edge(last, current) {
                    return;
                }
                let Some(codec) = texture.codec.clone() else {
                    return;
                };
                let bytes = monitor.bytes().to_vec();
                let reloaded = codec(&bytes).and_then(|raw| {
                    raw.validate()?;
                    self.upload_texture_image(&raw)
                });
                match reloaded {
                    Ok((image, fence)) => {
                        texture.standby = Some(image);
                        texture.loaded = Some(fence);
                        texture.reloading = true;
                        entry.status = AssetStatus::Loading;
                        log::debug!("[{id}] reloading...");
                    }
                    Err(err) => {
                        log::error!("[{id}] reload failed: {err}");
                        entry.status = AssetStatus::Error;
                    }
                }
            }
            Asset::Cubemap(cubemap) => {
                if cubemap.monitors.is_empty() {
                    return;
                }
                let mut edged = false;
                let mut lost = false;
                for monitor in &mut cubemap.monitors {
                    let last = monitor.last_status();
                    let current = monitor.update();
                    edged |= reload_edge(last, current);
                    lost |= current == MonitorStatus::NotFound;
                }
                if lost {
                    log::warn!("[{id}] watched source not ready / lost");
                    return;
                }
                if !edged {
                    return;
                }
                let Some(codec) = cubemap.codec.clone() else {
                    return;
                };
                let faces: Result<Vec<RawImage>> = cubemap
                    .monitors
                    .iter()
                    .map(|monitor| codec(monitor.bytes()))
                    .collect();
                let reloaded = faces.and_then(|faces| {
                    let faces: [RawImage; 6] = faces
                        .try_into()
                        .map_err(|_| GfxError::AssetCodec("expected six faces".into()))?;
                    self.upload_cubemap_image(&faces)
                });
                match reloaded {
                    Ok((image, fence)) => {
                        cubemap.standby = Some(image);
                        cubemap.loaded = Some(fence);
                        cubemap.reloading = true;
                        entry.status = AssetStatus::Loading;
                        log::debug!("[{id}] reloading...");
                    }
                    Err(err) => {
                        log::error!("[{id}] reload failed: {err}");
                        entry.status = AssetStatus::Error;
                    }
                }
            }
            Asset::Shader(shader) => {
                let Some(monitor) = shader.monitor.as_mut() else {
                    return;
                };
                let last = monitor.last_status();
                let current = monitor.update();
                if current == MonitorStatus::NotFound {
                    log::warn!("[{id}] watched source not ready / lost");
                    return;
                }
                if !reload_edge(last, current) {
                    return;
                }
                let Some(source) = shader.source.clone() else {
                    return;
                };
                let recompiled = compile_glsl(&source).and_then(|bytes| {
                    ShaderModule::from_spirv_bytes(self.device.clone(), shader.stage, &bytes)
                });
                match recompiled {
                    Ok(module) => {
                        shader.standby = Some(module);
                        entry.status = AssetStatus::Reloaded;
                        log::debug!("[{id}] shader recompiled");
                    }
                    Err(err) => {
                        // Compile failures keep the prior module intact.
                        log::error!("[{id}] {err}");
                        entry.status = AssetStatus::Error;
                    }
                }
            }
            _ => {}
        }
    }

    /// Rebuilds a pipeline whose shader generations moved. Entry locks are
    /// taken one kind at a time (shaders, then the pipeline) to keep lock
    /// order consistent with `build_pipeline_raw`.
    fn maybe_rebuild_pipeline(&self, entry: &Arc<Mutex<AssetEntry>>) {
        let snapshot = {
            let guard = entry.lock();
            match &guard.asset {
                Asset::Pipeline(pipeline) => Some((
                    guard.id.clone(),
                    pipeline.vertex_shader.clone(),
                    pipeline.fragment_shader.clone(),
                    pipeline.shader_generations,
                    pipeline.render_pass,
                    pipeline.state,
                )),
                _ => None,
            }
        };
        let Some((id, vertex_id, fragment_id, generations, render_pass, state)) = snapshot else {
            return;
        };
        let (Some(vertex_gen), Some(fragment_gen)) = (
            self.shader_generation(&vertex_id),
            self.shader_generation(&fragment_id),
        ) else {
            return;
        };
        if (vertex_gen, fragment_gen) == generations {
            return;
        }
        match self.build_pipeline_raw(&vertex_id, &fragment_id, render_pass, state) {
            Ok(raw) => {
                let mut guard = entry.lock();
                if let Asset::Pipeline(pipeline) = &mut guard.asset {
                    pipeline.replace_raw(raw);
                    pipeline.shader_generations = (vertex_gen, fragment_gen);
                }
                guard.generation += 1;
                log::debug!("[{id}] pipeline rebuilt after shader reload");
            }
            Err(err) => {
                log::error!("[{id}] pipeline rebuild failed: {err}");
                let _ = self.with_entry(&id, |entry| entry.status = AssetStatus::Error);
            }
        }
    }

    /// Resolves a manifest against the store. `resolve` maps each entry's
    /// vendor-defined parameters to a typed payload.
    pub fn load_manifest(
        self: &Arc<Self>,
        manifest: &Manifest,
        mut resolve: impl FnMut(&ManifestEntry) -> Result<AssetInfo>,
    ) -> Result<Vec<Guid>> {
        manifest
            .assets
            .iter()
            .map(|entry| {
                let info = resolve(entry)
                    .with_context(|| format!("failed to resolve manifest entry [{}]", entry.id))?;
                self.create(&entry.id, info)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_edge_requires_settling() {
        assert!(reload_edge(MonitorStatus::Modified, MonitorStatus::UpToDate));
        assert!(!reload_edge(MonitorStatus::UpToDate, MonitorStatus::Modified));
        assert!(!reload_edge(MonitorStatus::Modified, MonitorStatus::Modified));
        assert!(!reload_edge(MonitorStatus::NotFound, MonitorStatus::UpToDate));
    }

    #[test]
    fn manifest_parses_ids_kinds_and_params() {
        let json = br#"{
            "assets": [
                {"id": "textures/crate", "kind": "texture", "params": {"file": "crate.png"}},
                {"id": "materials/default", "kind": "material"}
            ]
        }"#;
        let manifest = Manifest::from_json(json).unwrap();
        assert_eq!(manifest.assets.len(), 2);
        assert_eq!(manifest.assets[0].id, "textures/crate");
        assert_eq!(manifest.assets[0].kind, "texture");
        assert_eq!(manifest.assets[0].params["file"], "crate.png");
        assert!(manifest.assets[1].params.is_null());
    }

    #[test]
    fn guids_are_monotonic() {
        let counter = AtomicU64::new(0);
        let a = Guid(counter.fetch_add(1, Ordering::Relaxed));
        let b = Guid(counter.fetch_add(1, Ordering::Relaxed));
        assert!(b > a);
    }
}
