//! Shared setup for the frame pipeline integration tests.
//!
//! Everything runs on the headless backend, which records commands instead of
//! executing them, so pass order and draw counts can be checked directly.

use city_renderer::resources::{MaterialHandle, MeshHandle};
use city_renderer::{
    FrameCamera, GraphicsDevice, GpuMesh, HeadlessBackend, MainRenderPass, MaterialDesc, MeshData, ModelAsset, ModelId,
    PresentMode, PresentationSurface, RenderLayer, RendererConfig,
};
use glam::{Mat4, Vec3};

pub const WIDTH: u32 = 1280;
pub const HEIGHT: u32 = 720;

pub fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .is_test(true)
        .try_init();
}

/// A claimed surface and a renderer on top of a headless device
pub struct TestContext {
    pub device: GraphicsDevice<HeadlessBackend>,
    pub surface: PresentationSurface,
    pub renderer: MainRenderPass,
}

impl TestContext {
    pub fn new(config: RendererConfig) -> Self {
        Self::with_backend(HeadlessBackend::new(WIDTH, HEIGHT), config)
    }

    pub fn with_backend(backend: HeadlessBackend, config: RendererConfig) -> Self {
        init_logging();
        let mut device = GraphicsDevice::new(backend, false).expect("headless device");
        let mut surface = PresentationSurface::new(WIDTH, HEIGHT, PresentMode::Fifo);
        assert!(surface.claim(&mut device));
        let renderer = MainRenderPass::new(&mut device, config).expect("renderer");
        Self {
            device,
            surface,
            renderer,
        }
    }

    /// Register a cube mesh and a plain material
    pub fn cube(&mut self) -> (MeshHandle, MaterialHandle) {
        let mesh = GpuMesh::upload(self.device.backend_mut(), &MeshData::cube(), 0).expect("cube upload");
        let mesh = self.renderer.register_mesh(mesh);
        let material = self
            .renderer
            .register_material(&mut self.device, MaterialDesc::default())
            .expect("material");
        (mesh, material)
    }

    /// Register a cube model on the buildings layer
    pub fn cube_model(&mut self, id: ModelId, capacity: u32) {
        let (mesh, material) = self.cube();
        self.renderer
            .register_model(
                &mut self.device,
                id,
                ModelAsset::new(mesh, material, RenderLayer::Buildings),
                capacity,
            )
            .expect("model");
    }

    /// Render pass labels recorded so far
    pub fn pass_labels(&self) -> Vec<String> {
        self.device.backend().render_pass_labels()
    }
}

/// Camera looking at the origin from above and behind
pub fn overview_camera() -> FrameCamera {
    let view = Mat4::look_at_rh(Vec3::new(0.0, 20.0, 20.0), Vec3::ZERO, Vec3::Y);
    let projection = Mat4::perspective_rh(60f32.to_radians(), WIDTH as f32 / HEIGHT as f32, 0.1, 500.0);
    FrameCamera::new(view, projection, Vec3::new(0.0, 20.0, 20.0))
}

/// Camera positioned at the origin looking down -Z
pub fn origin_camera() -> FrameCamera {
    let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
    let projection = Mat4::perspective_rh(60f32.to_radians(), WIDTH as f32 / HEIGHT as f32, 0.1, 500.0);
    FrameCamera::new(view, projection, Vec3::ZERO)
}
