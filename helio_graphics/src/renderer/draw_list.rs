use ash::vk;
use nalgebra::{Matrix4, Vector3};

/// Normalised screen rectangle; `(0,0)` top-left, `(1,1)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl ScreenRect {
    pub fn full() -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            right: 1.0,
            bottom: 1.0,
        }
    }
}

impl Default for ScreenRect {
    fn default() -> Self {
        Self::full()
    }
}

/// Normalised rect to pixel viewport against the current swap extent. The
/// height is negated (and the origin shifted) so clip space matches the
/// conventional upward y axis.
pub fn transform_viewport(rect: ScreenRect, extent: vk::Extent2D, depth: [f32; 2]) -> vk::Viewport {
    let size = [rect.right - rect.left, rect.bottom - rect.top];
    let width = size[0] * extent.width as f32;
    let height = -(size[1] * extent.height as f32);
    vk::Viewport {
        x: rect.left * extent.width as f32,
        y: rect.top * extent.height as f32 - height,
        width,
        height,
        min_depth: depth[0],
        max_depth: depth[1],
    }
}

pub fn transform_scissor(rect: ScreenRect, extent: vk::Extent2D) -> vk::Rect2D {
    let size = [rect.right - rect.left, rect.bottom - rect.top];
    vk::Rect2D {
        offset: vk::Offset2D {
            x: (rect.left * extent.width as f32) as i32,
            y: (rect.top * extent.height as f32) as i32,
        },
        extent: vk::Extent2D {
            width: (size[0] * extent.width as f32) as u32,
            height: (size[1] * extent.height as f32) as u32,
        },
    }
}

/// References into the resource store plus per-draw state.
#[derive(Debug, Clone)]
pub struct Drawable {
    pub mesh: String,
    pub pipeline: String,
    pub transform: Matrix4<f32>,
    pub material: MaterialBinding,
}

#[derive(Debug, Clone, Default)]
pub struct MaterialBinding {
    pub material: Option<String>,
    pub diffuse: Option<String>,
    pub specular: Option<String>,
}

/// The unit of viewport/scissor change. Drawables are sorted by pipeline to
/// minimise rebinding; batches are iterated in submission order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub viewport: ScreenRect,
    pub scissor: ScreenRect,
    pub drawables: Vec<Drawable>,
}

impl Batch {
    pub fn new(drawables: Vec<Drawable>) -> Self {
        Self {
            viewport: ScreenRect::full(),
            scissor: ScreenRect::full(),
            drawables,
        }
    }

    pub fn sort_by_pipeline(&mut self) {
        self.drawables
            .sort_by(|a, b| a.pipeline.cmp(&b.pipeline));
    }
}

/// Produced by the caller, consumed once per frame.
#[derive(Debug, Clone, Default)]
pub struct DrawList {
    pub batches: Vec<Batch>,
}

impl DrawList {
    pub fn sort(&mut self) {
        for batch in &mut self.batches {
            batch.sort_by_pipeline();
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DirLight {
    pub ambient: Vector3<f32>,
    pub diffuse: Vector3<f32>,
    pub specular: Vector3<f32>,
    pub direction: Vector3<f32>,
}

#[derive(Debug, Clone)]
pub struct SceneView {
    pub mat_v: Matrix4<f32>,
    pub mat_p: Matrix4<f32>,
    pub mat_ui: Matrix4<f32>,
    pub eye: Vector3<f32>,
    pub time: f32,
}

impl Default for SceneView {
    fn default() -> Self {
        Self {
            mat_v: Matrix4::identity(),
            mat_p: Matrix4::identity(),
            mat_ui: Matrix4::identity(),
            eye: Vector3::zeros(),
            time: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scene {
    pub clear_colour: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,
    pub view: SceneView,
    pub dir_lights: Vec<DirLight>,
    /// Skybox slot; the blank builtin when absent.
    pub cubemap: Option<String>,
    pub draw_list: DrawList,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            clear_colour: [0.0, 0.0, 0.0, 1.0],
            clear_depth: 1.0,
            clear_stencil: 0,
            view: SceneView::default(),
            dir_lights: Vec::new(),
            cubemap: None,
            draw_list: DrawList::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drawable(mesh: &str, pipeline: &str) -> Drawable {
        Drawable {
            mesh: mesh.to_owned(),
            pipeline: pipeline.to_owned(),
            transform: Matrix4::identity(),
            material: MaterialBinding::default(),
        }
    }

    fn pipeline_runs(batch: &Batch) -> usize {
        let mut runs = 0;
        let mut last: Option<&str> = None;
        for drawable in &batch.drawables {
            if last != Some(drawable.pipeline.as_str()) {
                runs += 1;
                last = Some(drawable.pipeline.as_str());
            }
        }
        runs
    }

    #[test]
    fn full_rect_maps_to_flipped_viewport() {
        let extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let viewport = transform_viewport(ScreenRect::full(), extent, [0.0, 1.0]);
        assert_eq!(viewport.x, 0.0);
        assert_eq!(viewport.y, 720.0);
        assert_eq!(viewport.width, 1280.0);
        assert_eq!(viewport.height, -720.0);
    }

    #[test]
    fn half_rect_maps_to_pixel_scissor() {
        let extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        let rect = ScreenRect {
            left: 0.5,
            top: 0.25,
            right: 1.0,
            bottom: 0.75,
        };
        let scissor = transform_scissor(rect, extent);
        assert_eq!((scissor.offset.x, scissor.offset.y), (640, 180));
        assert_eq!((scissor.extent.width, scissor.extent.height), (640, 360));
    }

    #[test]
    fn shared_pipeline_batch_is_one_run() {
        let mut batch = Batch::new((0..1000).map(|_| drawable("mesh", "lit")).collect());
        batch.sort_by_pipeline();
        assert_eq!(pipeline_runs(&batch), 1);
    }

    #[test]
    fn sorting_groups_drawables_by_pipeline() {
        let mut batch = Batch::new(vec![
            drawable("a", "wire"),
            drawable("b", "lit"),
            drawable("c", "wire"),
            drawable("d", "lit"),
        ]);
        assert_eq!(pipeline_runs(&batch), 4);
        batch.sort_by_pipeline();
        assert_eq!(pipeline_runs(&batch), 2);
    }
}
