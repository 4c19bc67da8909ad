//! City demo: a small procedural district rendered through the full frame pipeline
//!
//! Run with:
//!   cargo run --example city_demo
//!   cargo run --example city_demo -- --grid 24 --no-bloom
//!   cargo run --example city_demo -- --headless --frames 120
//!
//! Controls:
//!   Arrows   - Pan the camera
//!   G        - Toggle the construction ghost
//!   B        - Toggle bloom
//!   Escape   - Exit

use city_renderer::{
    backend::wgpu_backend::WgpuOptions,
    config::BloomConfig,
    FrameCamera, FrameOutcome, GraphicsBackend, GraphicsDevice, GpuMesh, HeadlessBackend, MainRenderPass, MaterialDesc,
    MeshData, ModelAsset, ModelId, PresentMode, PresentationSurface, RenderLayer, RendererConfig, WgpuBackend,
};
use city_renderer::resources::{MaterialHandle, MeshHandle};
use clap::Parser;
use glam::{Mat4, Quat, Vec3, Vec4};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    dpi::PhysicalSize,
    event::{ElementState, Event, KeyEvent, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    keyboard::{KeyCode, PhysicalKey},
    window::WindowBuilder,
};

#[derive(Parser, Debug)]
#[command(about = "Render a procedural city district")]
struct Args {
    /// Tiles per side of the district
    #[arg(long, default_value_t = 16)]
    grid: u32,
    #[arg(long, default_value_t = 1280)]
    width: u32,
    #[arg(long, default_value_t = 720)]
    height: u32,
    #[arg(long)]
    no_bloom: bool,
    #[arg(long)]
    no_shadows: bool,
    /// Render into the headless backend and print statistics
    #[arg(long)]
    headless: bool,
    /// Frames to render in headless mode
    #[arg(long, default_value_t = 60)]
    frames: u32,
}

const TERRAIN: ModelId = ModelId(0);
const BUILDINGS: ModelId = ModelId(1);
const LAMPS: ModelId = ModelId(2);

/// Assets the demo submits every frame
struct District {
    grid: u32,
    cube: MeshHandle,
    ghost_material: MaterialHandle,
    show_ghost: bool,
}

impl District {
    fn setup<B: GraphicsBackend>(
        device: &mut GraphicsDevice<B>,
        renderer: &mut MainRenderPass,
        grid: u32,
    ) -> city_renderer::RenderResult<Self> {
        let extent = grid as f32 * 2.0;
        let plane = GpuMesh::upload(device.backend_mut(), &MeshData::plane(extent, extent, grid), 0)?;
        let cube_mesh = GpuMesh::upload(device.backend_mut(), &MeshData::cube(), 0)?;
        let plane = renderer.register_mesh(plane);
        let cube = renderer.register_mesh(cube_mesh);

        let ground = renderer.register_material(
            device,
            MaterialDesc::default().with_base_color(Vec4::new(0.32, 0.45, 0.28, 1.0)),
        )?;
        let concrete = renderer.register_material(
            device,
            MaterialDesc::default().with_base_color(Vec4::new(0.75, 0.74, 0.7, 1.0)),
        )?;
        let lamp = renderer.register_material(
            device,
            MaterialDesc::default().with_emissive(Vec3::new(1.0, 0.8, 0.4), 4.0),
        )?;
        let ghost_material = renderer.register_material(device, MaterialDesc::default())?;

        let tiles = grid * grid;
        renderer.register_model(device, TERRAIN, ModelAsset::new(plane, ground, RenderLayer::Terrain), 1)?;
        renderer.register_model(
            device,
            BUILDINGS,
            ModelAsset::new(cube, concrete, RenderLayer::Buildings),
            tiles,
        )?;
        renderer.register_model(device, LAMPS, ModelAsset::new(cube, lamp, RenderLayer::Effects), tiles)?;

        Ok(Self {
            grid,
            cube,
            ghost_material,
            show_ghost: true,
        })
    }

    fn tile_center(&self, x: u32, z: u32) -> Vec3 {
        let half = self.grid as f32;
        Vec3::new(x as f32 * 2.0 - half + 1.0, 0.0, z as f32 * 2.0 - half + 1.0)
    }

    fn submit(&self, scene: &mut city_renderer::SceneSubmission<'_>, time: f32) {
        scene.add_instance(TERRAIN, Mat4::IDENTITY, Vec4::ONE, Vec4::ZERO);
        for x in 0..self.grid {
            for z in 0..self.grid {
                let center = self.tile_center(x, z);
                // Cheap deterministic hash for building heights
                let h = ((x * 7919 + z * 104729) % 5) as f32 + 1.0;
                if (x + z) % 3 != 0 {
                    let transform = Mat4::from_scale_rotation_translation(
                        Vec3::new(1.6, h, 1.6),
                        Quat::IDENTITY,
                        center + Vec3::Y * h * 0.5,
                    );
                    scene.add_instance(BUILDINGS, transform, Vec4::ONE, Vec4::ZERO);
                } else {
                    let pulse = 0.5 + 0.5 * (time * 2.0 + x as f32).sin();
                    let transform = Mat4::from_scale_rotation_translation(
                        Vec3::splat(0.2),
                        Quat::IDENTITY,
                        center + Vec3::Y * 1.2,
                    );
                    scene.add_instance(LAMPS, transform, Vec4::ONE, Vec4::new(1.0, 0.8, 0.4, pulse * 4.0));
                }
            }
        }

        if self.show_ghost {
            let center = self.tile_center(self.grid / 2, self.grid / 2);
            let ghost = Mat4::from_scale_rotation_translation(Vec3::new(1.8, 3.0, 1.8), Quat::IDENTITY, center + Vec3::Y * 1.5);
            scene.add_construction_ghost(self.cube, self.ghost_material, ghost);
            scene.add_selection_overlay(
                self.cube,
                self.ghost_material,
                Mat4::from_scale_rotation_translation(Vec3::new(2.0, 0.05, 2.0), Quat::IDENTITY, center),
            );
        }
    }
}

fn renderer_config(args: &Args) -> RendererConfig {
    RendererConfig::default()
        .with_bloom_disabled(args.no_bloom)
        .with_shadows(!args.no_shadows)
        .with_present_mode(PresentMode::Fifo)
}

fn camera(grid: u32, pan: Vec3, width: u32, height: u32) -> FrameCamera {
    let distance = grid as f32 * 1.5;
    let mut camera = city_renderer::Camera::new(Vec3::new(distance, distance, distance) + pan, pan);
    camera.set_aspect(width as f32, height as f32);
    camera.snapshot()
}

fn run_headless(args: &Args) {
    let backend = HeadlessBackend::new(args.width, args.height);
    let mut device = GraphicsDevice::new(backend, false).expect("Failed to create headless device");
    let mut surface = PresentationSurface::new(args.width, args.height, PresentMode::Fifo);
    assert!(surface.claim(&mut device), "Failed to claim headless surface");
    let mut renderer = MainRenderPass::new(&mut device, renderer_config(args)).expect("Failed to create renderer");
    let district = District::setup(&mut device, &mut renderer, args.grid).expect("Failed to build district");

    let camera = camera(args.grid, Vec3::ZERO, args.width, args.height);
    for frame in 0..args.frames {
        let time = frame as f32 / 60.0;
        renderer.render_frame(&mut device, &mut surface, &camera, |scene| district.submit(scene, time));
        device.backend_mut().clear_commands();
    }

    let stats = renderer.stats();
    println!("Frames: {} presented, {} skipped, {} failed", stats.presented_frames, stats.skipped_frames, stats.failed_frames);
    println!("Draw calls last frame: {}", stats.last_frame_draw_calls);
    println!("Chunks last frame: {} visible, {} culled", stats.last_frame_visible_chunks, stats.last_frame_culled_chunks);
    println!("Peak uniform bytes: {}", stats.peak_uniform_bytes);
    println!("Elided binds: {}", stats.elided_binds);
    renderer.release(&mut device);
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if args.headless {
        run_headless(&args);
        return;
    }

    println!("Starting City Demo ({}x{} tiles)", args.grid, args.grid);
    println!("Controls:");
    println!("  Arrows  - Pan camera");
    println!("  G       - Toggle construction ghost");
    println!("  B       - Toggle bloom");
    println!("  Escape  - Exit");

    let event_loop = EventLoop::new().expect("Failed to create event loop");
    let window = Arc::new(
        WindowBuilder::new()
            .with_title("City Renderer Demo")
            .with_inner_size(PhysicalSize::new(args.width, args.height))
            .build(&event_loop)
            .expect("Failed to create window"),
    );

    let options = WgpuOptions {
        present_mode: PresentMode::Fifo,
        ..Default::default()
    };
    let backend = match WgpuBackend::new(Arc::clone(&window), options) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Failed to create wgpu backend: {e}");
            return;
        }
    };
    let config = renderer_config(&args);
    let mut device = GraphicsDevice::new(backend, config.debug_layers).expect("Failed to create device");
    let size = window.inner_size();
    let mut surface = PresentationSurface::new(size.width, size.height, config.present_mode);
    if !surface.claim(&mut device) {
        eprintln!("Failed to claim the window surface");
        return;
    }
    let mut renderer = MainRenderPass::new(&mut device, config).expect("Failed to create renderer");
    let mut district = District::setup(&mut device, &mut renderer, args.grid).expect("Failed to build district");

    let start = Instant::now();
    let mut pan = Vec3::ZERO;
    let mut bloom = BloomConfig::default();
    bloom.force_disable = args.no_bloom;

    event_loop
        .run(move |event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => match event {
                    WindowEvent::CloseRequested => {
                        renderer.release(&mut device);
                        elwt.exit();
                    }
                    WindowEvent::Resized(size) => surface.on_resize(size.width, size.height),
                    WindowEvent::KeyboardInput {
                        event:
                            KeyEvent {
                                physical_key: PhysicalKey::Code(key),
                                state: ElementState::Pressed,
                                ..
                            },
                        ..
                    } => match key {
                        KeyCode::Escape => {
                            renderer.release(&mut device);
                            elwt.exit();
                        }
                        KeyCode::ArrowLeft => pan.x -= 1.0,
                        KeyCode::ArrowRight => pan.x += 1.0,
                        KeyCode::ArrowUp => pan.z -= 1.0,
                        KeyCode::ArrowDown => pan.z += 1.0,
                        KeyCode::KeyG => district.show_ghost = !district.show_ghost,
                        KeyCode::KeyB => {
                            bloom.force_disable = !bloom.force_disable;
                            renderer.set_bloom(&mut device, bloom.clone());
                        }
                        _ => {}
                    },
                    _ => {}
                },
                Event::AboutToWait => {
                    let (width, height) = surface.size();
                    let camera = camera(district.grid, pan, width, height);
                    let time = start.elapsed().as_secs_f32();
                    let outcome =
                        renderer.render_frame(&mut device, &mut surface, &camera, |scene| district.submit(scene, time));
                    if outcome == FrameOutcome::Failed {
                        log::warn!("Frame failed: {}", renderer.last_error().unwrap_or("unknown"));
                    }
                    window.request_redraw();
                }
                _ => {}
            }
        })
        .expect("Event loop failed");
}
