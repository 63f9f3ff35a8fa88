// Demo driver
//
// Opens a window, builds the GPU context, and runs a clear loop: every
// redraw acquires a backbuffer, transfer-clears it to the configured
// color, and presents. Resizes and out-of-date surfaces funnel through
// one needs_recreate flag; the swapchain is rebuilt at the top of the
// next frame and that frame is skipped.

mod config;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use winit::window::{Window, WindowAttributes};

use config::Config;
use kindling::gpu::{FrameStatus, Gpu, SwapchainStatus};

fn main() -> Result<()> {
    let config = Config::load();
    init_logging();
    log::info!("Starting kindling demo");
    log::info!(
        "Window: {}x{}, present mode: {}",
        config.window.width,
        config.window.height,
        config.graphics.present_mode
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

struct App {
    config: Config,
    window: Option<Arc<Window>>,
    gpu: Option<Gpu>,

    needs_recreate: bool,
    minimized: bool,

    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            window: None,
            gpu: None,
            needs_recreate: false,
            minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_gpu(&mut self, window: &Window) -> Result<()> {
        let display = window.raw_display_handle();
        let surface = window.raw_window_handle();
        let size = window.inner_size();
        let gpu = Gpu::new(display, surface, size.width, size.height, &self.config.gpu())
            .context("failed to create the GPU context")?;
        self.gpu = Some(gpu);
        Ok(())
    }

    /// Render one frame. Returns false when nothing was presented
    /// (minimized, recreate pending, or surface out of date).
    fn render_frame(&mut self) -> Result<bool> {
        if self.minimized {
            return Ok(false);
        }
        let (Some(gpu), Some(window)) = (self.gpu.as_mut(), self.window.as_ref()) else {
            return Ok(false);
        };

        if self.needs_recreate {
            let size = window.inner_size();
            if size.width == 0 || size.height == 0 {
                return Ok(false);
            }
            gpu.recreate_swapchain(size.width, size.height)?;
            self.needs_recreate = false;
            // Skip a frame; the next redraw renders at the new size.
            return Ok(false);
        }

        match gpu.begin_frame()? {
            FrameStatus::Ready(_) => {}
            FrameStatus::NeedsRecreate => {
                self.needs_recreate = true;
                return Ok(false);
            }
        }

        gpu.cmd_clear_backbuffer(self.config.graphics.clear_color);

        if let SwapchainStatus::NeedsRecreate = gpu.end_frame()? {
            self.needs_recreate = true;
        }
        Ok(true)
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_gpu(&window) {
            log::error!("Failed to initialize the GPU context: {:?}", e);
            event_loop.exit();
            return;
        }
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if size.width == 0 || size.height == 0 {
                    self.minimized = true;
                } else {
                    self.minimized = false;
                    self.needs_recreate = true;
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => log::error!("Render error: {:?}", e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(KeyCode::Escape) = event.physical_key {
                        log::info!("ESC pressed, exiting");
                        event_loop.exit();
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
