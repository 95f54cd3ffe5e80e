use std::{path::PathBuf, sync::Arc, time::Instant};

use anyhow::Result;
use winit::{
    dpi,
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    raw_window_handle::{HasDisplayHandle, HasWindowHandle},
    window::{Window, WindowBuilder},
};

use helio_graphics::{
    config::WindowConfig,
    deferred::DeferredQueue,
    raw_window_handle::{RawDisplayHandle, RawWindowHandle},
    renderer::{
        descriptor::DescriptorLayouts, draw_list::Scene, Renderer, DEFAULT_VIRTUAL_FRAMES,
    },
    store::Store,
    vulkan::{swapchain::ContextOptions, vram::Vram, Device},
    window::WindowSource,
    WindowId,
};

struct DemoWindow {
    window: Window,
}

impl WindowSource for DemoWindow {
    fn raw_display_handle(&self) -> RawDisplayHandle {
        self.window
            .display_handle()
            .expect("display handle")
            .as_raw()
    }

    fn raw_window_handle(&self) -> RawWindowHandle {
        self.window.window_handle().expect("window handle").as_raw()
    }

    fn framebuffer_size(&self) -> [u32; 2] {
        let size = self.window.inner_size();
        [size.width, size.height]
    }

    fn window_size(&self) -> [u32; 2] {
        self.framebuffer_size()
    }
}

fn main() -> Result<()> {
    let env = env_logger::Env::default()
        .filter_or("HELIO_LOG_LEVEL", "debug")
        .write_style_or("HELIO_LOG_STYLE", "always");
    env_logger::init_from_env(env);

    let config_path = PathBuf::from("helio-window.json");
    let config = WindowConfig::load(&config_path);

    let event_loop = EventLoop::new()?;
    let mut builder = WindowBuilder::new().with_title("helio").with_inner_size(
        dpi::PhysicalSize::new(config.size[0], config.size[1]),
    );
    if config.maximized {
        builder = builder.with_maximized(true);
    }
    let window = Arc::new(DemoWindow {
        window: builder.build(&event_loop)?,
    });

    let device = Device::new(window.as_ref(), None)?;
    let deferred = DeferredQueue::new();
    let vram = Vram::new(device.clone(), deferred.clone())?;
    let layouts = DescriptorLayouts::new(device.clone())?;
    let store = Store::new(
        device.clone(),
        vram.clone(),
        deferred.clone(),
        layouts.clone(),
    )?;
    let mut renderer = Some(Renderer::new(
        device.clone(),
        vram.clone(),
        deferred.clone(),
        layouts,
        window.clone(),
        WindowId(0),
        DEFAULT_VIRTUAL_FRAMES,
        ContextOptions::default(),
    )?);

    let started = Instant::now();
    let mut config = config;

    event_loop.run(move |event, elwt| {
        elwt.set_control_flow(ControlFlow::Poll);
        match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => elwt.exit(),
                WindowEvent::Resized(_) => {
                    if let Some(renderer) = renderer.as_mut() {
                        if let Err(err) = renderer.on_framebuffer_resize() {
                            log::error!("resize handling failed: {err:#}");
                        }
                    }
                }
                WindowEvent::RedrawRequested => {
                    store.update();
                    let mut scene = Scene::default();
                    scene.clear_colour = [0.02, 0.02, 0.03, 1.0];
                    scene.view.time = started.elapsed().as_secs_f32();
                    if let Some(renderer) = renderer.as_mut() {
                        if let Err(err) = renderer.render(&scene, &store) {
                            log::error!("render failed: {err:#}");
                            elwt.exit();
                        }
                    }
                }
                _ => {}
            },
            Event::AboutToWait => window.window.request_redraw(),
            Event::LoopExiting => {
                let size = window.window.inner_size();
                config.size = [size.width, size.height];
                if let Ok(position) = window.window.outer_position() {
                    config.position = [position.x, position.y];
                }
                config.maximized = window.window.is_maximized();
                if let Err(err) = config.save(&config_path) {
                    log::warn!("failed to persist window config: {err:#}");
                }

                // Shutdown: drop the renderer, unload assets, then run the
                // deferred queue to empty behind a device drain.
                drop(renderer.take());
                store.unload_all();
                if let Err(err) = deferred.drain(&device) {
                    log::error!("deferred drain failed: {err:#}");
                }
            }
            _ => {}
        }
    })?;
    Ok(())
}
