//! Frame orchestration
//!
//! `MainRenderPass` owns every per-frame resource and sequences one legal frame:
//!
//! ```text
//! begin_frame -> upload -> render_shadows -> begin_render_pass -> render_opaque
//!   -> end_opaque_pass -> execute_edge_detection -> begin_transparent_render_pass
//!   -> render_transparent -> end_transparent_pass -> [render_ui_overlay] -> end_frame
//! ```
//!
//! Each step consumes the previous step's `Frame<S>` token. A step that fails
//! abandons the frame: nothing is submitted, the image is dropped and the failure
//! is counted. The next frame starts from scratch.

mod stages;
mod submission;

pub use stages::*;
pub use submission::SceneSubmission;

use crate::backend::{
    CameraUniform, ColorAttachment, FrameContext, FrameUniforms, GraphicsBackend, LoadOp, RenderPassDescriptor,
    SceneUniform, StoreOp,
};
use crate::config::{BloomConfig, EdgeConfig, RendererConfig};
use crate::device::GraphicsDevice;
use crate::error::{LastError, RenderError, RenderResult};
use crate::pipeline::postprocess::BloomPass;
use crate::pipeline::{AuxiliaryTargets, EdgeDetectPass, OpaquePass, ShadowPass};
use crate::renderer::{InstancedRenderer, ModelAsset, RenderLayer, RenderPassState, TransparentRenderQueue};
use crate::resources::{
    AssetRegistry, FrameResourcePool, GpuMesh, MaterialDesc, MaterialHandle, MeshHandle, ModelId, SamplerCache,
    UniformBufferPool,
};
use crate::scene::FrameCamera;
use crate::stats::FrameStatistics;
use crate::surface::{AcquireStatus, PresentationSurface};

pub const UI_OVERLAY_LABEL: &str = "UI Overlay";

/// How a frame ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// No presentable image this tick; not an error
    Skipped,
    Failed,
}

pub struct MainRenderPass {
    config: RendererConfig,
    frame_pool: FrameResourcePool,
    uniforms: UniformBufferPool,
    samplers: SamplerCache,
    assets: AssetRegistry,
    instanced: InstancedRenderer,
    transparent: TransparentRenderQueue,
    state: RenderPassState,
    targets: AuxiliaryTargets,
    shadow: ShadowPass,
    opaque: OpaquePass,
    edges: EdgeDetectPass,
    bloom: BloomPass,
    stats: FrameStatistics,
    opaque_rendered: bool,
    violations: u64,
    frame_draws: u32,
    last_outcome: Option<FrameOutcome>,
    last_error: LastError,
}

static_assertions::assert_impl_all!(MainRenderPass: Send);
static_assertions::assert_impl_all!(FrameResourcePool: Send);
static_assertions::assert_impl_all!(UniformBufferPool: Send);

impl MainRenderPass {
    /// Build every pool, pipeline and pass. Fails on invalid configuration or when
    /// the backend rejects a pipeline.
    pub fn new<B: GraphicsBackend>(device: &mut GraphicsDevice<B>, config: RendererConfig) -> RenderResult<Self> {
        config.validate()?;
        let alignment = device.capabilities().min_uniform_buffer_offset_alignment;
        let backend: &mut dyn GraphicsBackend = device.backend_mut();

        let mut samplers = SamplerCache::new();
        let frame_pool = FrameResourcePool::new(backend, &config.frame_pool)?;
        let uniforms = UniformBufferPool::new(&config.uniform_pool, alignment);
        let shadow = ShadowPass::new(backend, &mut samplers, &config.shadow)?;
        let opaque = OpaquePass::new(backend, &shadow)?;
        let edges = EdgeDetectPass::new(backend, &config.edge)?;
        let output_format = backend.swapchain_format();
        let bloom = BloomPass::new(backend, &mut samplers, &config.bloom, output_format)?;

        log::info!(
            "Main render pass ready: {} frame slots, bloom {:?}{}, shadows {}",
            config.frame_pool.slot_count,
            config.bloom.quality,
            if config.bloom.force_disable { " (disabled)" } else { "" },
            if config.shadow.enabled { "on" } else { "off" }
        );

        Ok(Self {
            instanced: InstancedRenderer::new(&config.instances),
            transparent: TransparentRenderQueue::new(config.transparent.clone()),
            targets: AuxiliaryTargets::new(config.bloom.quality.mip_levels()),
            state: RenderPassState::new(),
            assets: AssetRegistry::new(),
            stats: FrameStatistics::new(),
            opaque_rendered: false,
            violations: 0,
            frame_draws: 0,
            last_outcome: None,
            last_error: LastError::new(),
            config,
            frame_pool,
            uniforms,
            samplers,
            shadow,
            opaque,
            edges,
            bloom,
        })
    }

    // Assets and models

    /// Register a mesh record supplied by the asset loader
    pub fn register_mesh(&mut self, mesh: GpuMesh) -> MeshHandle {
        self.assets.register_mesh(mesh)
    }

    /// Forget a mesh. Models and objects still referring to it are skipped.
    pub fn remove_mesh(&mut self, handle: MeshHandle) -> Option<GpuMesh> {
        self.assets.remove_mesh(handle)
    }

    pub fn register_material<B: GraphicsBackend>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        desc: MaterialDesc,
    ) -> RenderResult<MaterialHandle> {
        let layout = self.opaque.material_layout();
        self.assets
            .register_material(device.backend_mut(), layout, &mut self.samplers, desc)
    }

    pub fn remove_material<B: GraphicsBackend>(&mut self, device: &mut GraphicsDevice<B>, handle: MaterialHandle) -> bool {
        self.assets.remove_material(device.backend_mut(), handle)
    }

    pub fn register_model<B: GraphicsBackend>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        id: ModelId,
        asset: ModelAsset,
        capacity: u32,
    ) -> RenderResult<()> {
        self.instanced
            .register_model(device.backend_mut(), &self.assets, id, asset, capacity)
    }

    pub fn unregister_model<B: GraphicsBackend>(&mut self, device: &mut GraphicsDevice<B>, id: ModelId) -> bool {
        self.instanced.unregister_model(device.backend_mut(), id)
    }

    // Runtime settings

    pub fn set_bloom<B: GraphicsBackend>(&mut self, device: &mut GraphicsDevice<B>, config: BloomConfig) {
        self.bloom.configure(device.backend_mut(), &config);
        self.config.bloom = config;
    }

    pub fn set_edges<B: GraphicsBackend>(&mut self, device: &mut GraphicsDevice<B>, config: EdgeConfig) {
        self.edges.set_params(device.backend_mut(), &config);
        self.config.edge = config;
    }

    // Failure paths

    fn fail_frame<B: GraphicsBackend, S>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        surface: &mut PresentationSurface,
        frame: Frame<S>,
        reason: String,
    ) {
        self.release_frame(device, surface, frame);
        self.stats.failed_frames += 1;
        self.last_outcome = Some(FrameOutcome::Failed);
        self.last_error.set(format!("frame dropped: {reason}"));
        self.refresh_counters();
    }

    fn release_frame<B: GraphicsBackend, S>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        surface: &mut PresentationSurface,
        frame: Frame<S>,
    ) {
        self.state.end_pass();
        self.frame_pool.end_frame(device.backend_mut());
        surface.drop_image();
        device.abandon(frame.recorder);
    }

    /// Drop a frame at any stage without submitting it. Counted as skipped.
    pub fn abandon_frame<B: GraphicsBackend, S>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        surface: &mut PresentationSurface,
        frame: Frame<S>,
    ) {
        log::debug!("Frame {} abandoned by the caller", frame.sequence());
        self.release_frame(device, surface, frame);
        self.stats.skipped_frames += 1;
        self.last_outcome = Some(FrameOutcome::Skipped);
    }

    fn violation(&mut self, message: &str) {
        self.violations += 1;
        self.last_error
            .set(RenderError::ContractViolation(message.to_string()).to_string());
    }

    fn refresh_counters(&mut self) {
        self.stats.dropped_instances = self.instanced.dropped_instances();
        self.stats.failed_allocations = self.frame_pool.failed_allocations() + self.uniforms.failed_allocations();
        self.stats.slot_overruns = self.frame_pool.overruns();
        self.stats.contract_violations = self.violations + self.transparent.contract_violations();
        self.stats.elided_binds = self.state.elided_binds();
        self.stats.peak_uniform_bytes = self
            .stats
            .peak_uniform_bytes
            .max(self.uniforms.last_frame_peak())
            .max(self.uniforms.frame_usage());
        self.stats.last_frame_draw_calls = self.frame_draws;
        self.stats.last_frame_visible_chunks = self.instanced.visible_chunks();
        self.stats.last_frame_culled_chunks = self.instanced.culled_chunks();
    }

    // Stages

    /// Acquire a command recorder and the next image, and start the frame's allocations.
    ///
    /// `None` when no image is available (skipped) or acquisition failed; see `last_outcome`.
    pub fn begin_frame<B: GraphicsBackend>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        surface: &mut PresentationSurface,
        camera: &FrameCamera,
    ) -> Option<Frame<Acquired>> {
        self.stats.reset_frame_counters();
        // Bindings may be left over from a frame that was dropped mid-pass
        self.state.end_pass();
        self.opaque_rendered = false;
        self.frame_draws = 0;

        let Some(recorder) = device.acquire_command_recorder() else {
            self.stats.failed_frames += 1;
            self.last_outcome = Some(FrameOutcome::Failed);
            self.last_error.set(format!(
                "no command recorder: {}",
                device.last_error().unwrap_or("unknown")
            ));
            return None;
        };
        let Some(context) = surface.acquire_next_image(device, &recorder) else {
            device.abandon(recorder);
            if surface.acquire_status() == AcquireStatus::Unavailable {
                log::debug!("Frame skipped: no presentable image");
                self.stats.skipped_frames += 1;
                self.last_outcome = Some(FrameOutcome::Skipped);
            } else {
                self.stats.failed_frames += 1;
                self.last_outcome = Some(FrameOutcome::Failed);
                self.last_error.set(format!(
                    "image acquisition failed: {}",
                    surface.last_error().unwrap_or("unknown")
                ));
            }
            return None;
        };

        let backend = device.backend_mut();
        let slot = self.frame_pool.begin_frame(backend);
        self.uniforms.reset();
        self.instanced.begin_frame();
        self.transparent.begin(camera.position);

        let block_size = std::mem::size_of::<FrameUniforms>() as u64;
        let Some(frame_block) = self.uniforms.allocate(backend, block_size) else {
            self.frame_pool.end_frame(backend);
            surface.drop_image();
            device.abandon(recorder);
            self.stats.failed_frames += 1;
            self.last_outcome = Some(FrameOutcome::Failed);
            self.last_error.set("no uniform space for the frame block");
            return None;
        };

        Some(Frame::new(context, recorder, slot, *camera, frame_block))
    }

    /// Instance batches and transparent queue for this frame
    pub fn submission(&mut self, _frame: &Frame<Acquired>) -> SceneSubmission<'_> {
        SceneSubmission {
            instanced: &mut self.instanced,
            transparent: &mut self.transparent,
        }
    }

    fn frame_uniforms(&self, camera: &FrameCamera) -> FrameUniforms {
        let shadow = &self.config.shadow;
        FrameUniforms {
            camera: CameraUniform {
                view_proj: camera.view_projection(),
                light_view_proj: self.shadow.light_view_projection(camera),
            },
            scene: SceneUniform {
                view: camera.view,
                camera_position: camera.position.extend(1.0),
                light_direction: (-self.shadow.light_direction()).extend(shadow.light_intensity),
                ambient: self.config.ambient.extend(shadow.strength),
                shadow_params: glam::Vec4::new(
                    self.shadow.texel_size(),
                    if self.shadow.is_enabled() { 1.0 } else { 0.0 },
                    0.0,
                    0.0,
                ),
            },
        }
    }

    /// Write the frame block, upload and cull instances, and sort transparents.
    ///
    /// Every upload is recorded here, before the first pass opens.
    pub fn upload<B: GraphicsBackend>(&mut self, device: &mut GraphicsDevice<B>, frame: Frame<Acquired>) -> Frame<Uploaded> {
        let uniforms = self.frame_uniforms(&frame.camera);
        let backend = device.backend_mut();
        backend.write_buffer(
            frame.frame_block.buffer,
            frame.frame_block.offset,
            bytemuck::bytes_of(&uniforms),
        );

        self.instanced.update_frustum(&uniforms.camera.view_proj);
        self.instanced.upload_instances(backend, &mut self.frame_pool);
        self.transparent.sort_back_to_front();
        self.frame_pool.flush(backend);
        frame.advance()
    }

    /// Light-space depth of every instance; a disabled shadow pass records nothing
    pub fn render_shadows<B: GraphicsBackend>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        frame: Frame<Uploaded>,
    ) -> Frame<ShadowsRendered> {
        match self.shadow.render(
            device.backend_mut(),
            &mut self.state,
            &mut self.instanced,
            &self.assets,
            &frame.frame_block,
        ) {
            Ok(draws) => self.frame_draws += draws,
            Err(e) => log::warn!("Shadow pass skipped: {e}"),
        }
        frame.advance()
    }

    /// Make sure the size-dependent targets exist, clear them and open the opaque pass
    pub fn begin_render_pass<B: GraphicsBackend>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        surface: &mut PresentationSurface,
        frame: Frame<ShadowsRendered>,
    ) -> Option<Frame<OpaqueOpen>> {
        let backend = device.backend_mut();
        if !self
            .targets
            .ensure(backend, surface.size(), surface.size_generation())
        {
            let reason = self.targets.last_error().unwrap_or("target rebuild failed").to_string();
            self.fail_frame(device, surface, frame, reason);
            return None;
        }
        let Some(targets) = self.targets.get() else {
            self.fail_frame(device, surface, frame, "no auxiliary targets".into());
            return None;
        };
        if let Err(e) = self.opaque.begin(
            backend,
            &mut self.state,
            targets,
            &self.config.clear,
            &frame.frame_block,
        ) {
            self.fail_frame(device, surface, frame, format!("opaque pass: {e}"));
            return None;
        }
        Some(frame.advance())
    }

    /// Draw the opaque layers in order: terrain, buildings, effects
    pub fn render_opaque<B: GraphicsBackend>(&mut self, device: &mut GraphicsDevice<B>, _frame: &mut Frame<OpaqueOpen>) -> u32 {
        let backend = device.backend_mut();
        let mut draws = 0;
        for layer in RenderLayer::ORDER {
            match self.instanced.render(backend, &mut self.state, &self.assets, layer) {
                Some(count) => draws += count,
                None => self.violation("opaque layer drawn without a bound camera block"),
            }
        }
        self.opaque_rendered = true;
        self.frame_draws += draws;
        draws
    }

    pub fn end_opaque_pass<B: GraphicsBackend>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        frame: Frame<OpaqueOpen>,
    ) -> Frame<OpaqueDone> {
        self.opaque.end(device.backend_mut(), &mut self.state);
        frame.advance()
    }

    /// Outline pass over the closed opaque targets.
    ///
    /// Running it when no opaque geometry was drawn is flagged as a contract
    /// violation; the edges then come from the cleared neutral normals.
    pub fn execute_edge_detection<B: GraphicsBackend>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        surface: &mut PresentationSurface,
        frame: Frame<OpaqueDone>,
    ) -> Option<Frame<EdgesResolved>> {
        if !self.opaque_rendered {
            self.violation("edge detection ran before the opaque layers were rendered; using cleared normals");
        }
        let Some(targets) = self.targets.get() else {
            self.fail_frame(device, surface, frame, "no auxiliary targets".into());
            return None;
        };
        let generation = self.targets.generation();
        if let Err(e) = self
            .edges
            .execute(device.backend_mut(), &mut self.state, targets, generation)
        {
            self.fail_frame(device, surface, frame, format!("edge detection: {e}"));
            return None;
        }
        self.frame_draws += 1;
        Some(frame.advance())
    }

    /// Reopen scene color and depth with load operations
    pub fn begin_transparent_render_pass<B: GraphicsBackend>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        surface: &mut PresentationSurface,
        frame: Frame<EdgesResolved>,
    ) -> Option<Frame<TransparentOpen>> {
        let Some(targets) = self.targets.get() else {
            self.fail_frame(device, surface, frame, "no auxiliary targets".into());
            return None;
        };
        if let Err(e) = self
            .opaque
            .begin_transparent(device.backend_mut(), &mut self.state, targets, &frame.frame_block)
        {
            self.fail_frame(device, surface, frame, format!("transparent pass: {e}"));
            return None;
        }
        Some(frame.advance())
    }

    /// Draw the sorted transparent queue. False if the queue refused to render.
    pub fn render_transparent<B: GraphicsBackend>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        _frame: &mut Frame<TransparentOpen>,
    ) -> bool {
        let pipeline = self.opaque.transparent_pipeline();
        match self.transparent.render(
            device.backend_mut(),
            &mut self.state,
            &self.assets,
            &mut self.uniforms,
            self.opaque.object_groups_mut(),
            pipeline,
        ) {
            Some(draws) => {
                self.frame_draws += draws;
                true
            }
            None => false,
        }
    }

    pub fn end_transparent_pass<B: GraphicsBackend>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        frame: Frame<TransparentOpen>,
    ) -> Frame<TransparentDone> {
        self.opaque.end(device.backend_mut(), &mut self.state);
        frame.advance()
    }

    /// Draw UI on top of the scene. The pass loads scene color and has no depth attachment.
    pub fn render_ui_overlay<B, F>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        surface: &mut PresentationSurface,
        frame: Frame<TransparentDone>,
        draw: F,
    ) -> Option<Frame<Overlaid>>
    where
        B: GraphicsBackend,
        F: FnOnce(&mut dyn GraphicsBackend, &FrameContext),
    {
        let Some(targets) = self.targets.get() else {
            self.fail_frame(device, surface, frame, "no auxiliary targets".into());
            return None;
        };
        let backend: &mut dyn GraphicsBackend = device.backend_mut();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some(UI_OVERLAY_LABEL.into()),
            color_attachments: vec![ColorAttachment {
                view: targets.scene_color.view,
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: None,
        });
        self.state.begin_pass(UI_OVERLAY_LABEL);
        draw(backend, &frame.context);
        backend.end_render_pass();
        self.state.end_pass();
        Some(frame.advance())
    }

    /// Bloom and composite into the swapchain, submit, then present
    pub fn end_frame<B: GraphicsBackend, S: ReadyForPostProcess>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        surface: &mut PresentationSurface,
        frame: Frame<S>,
    ) -> FrameOutcome {
        let Some(targets) = self.targets.get() else {
            self.fail_frame(device, surface, frame, "no auxiliary targets".into());
            return FrameOutcome::Failed;
        };
        let generation = self.targets.generation();
        let output = frame.context.swapchain_view;
        match self
            .bloom
            .execute(device.backend_mut(), &mut self.state, targets, generation, output)
        {
            Ok(passes) => self.frame_draws += passes,
            Err(e) => {
                self.fail_frame(device, surface, frame, format!("bloom: {e}"));
                return FrameOutcome::Failed;
            }
        }

        self.frame_pool.end_frame(device.backend_mut());
        let Some(index) = device.submit(frame.recorder) else {
            surface.drop_image();
            self.stats.failed_frames += 1;
            self.last_outcome = Some(FrameOutcome::Failed);
            self.last_error.set(format!(
                "frame dropped: {}",
                device.last_error().unwrap_or("submit failed")
            ));
            self.refresh_counters();
            return FrameOutcome::Failed;
        };
        self.frame_pool.stamp_submission(index);

        let outcome = if surface.present(device) {
            self.stats.presented_frames += 1;
            FrameOutcome::Presented
        } else {
            self.stats.failed_frames += 1;
            self.last_error.set(format!(
                "present failed: {}",
                surface.last_error().unwrap_or("unknown")
            ));
            FrameOutcome::Failed
        };
        self.last_outcome = Some(outcome);
        self.refresh_counters();
        outcome
    }

    /// Run every stage of one frame. `submit` fills the frame's scene content.
    pub fn render_frame<B, F>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        surface: &mut PresentationSurface,
        camera: &FrameCamera,
        submit: F,
    ) -> FrameOutcome
    where
        B: GraphicsBackend,
        F: FnOnce(&mut SceneSubmission<'_>),
    {
        let Some(frame) = self.begin_frame(device, surface, camera) else {
            return self.last_outcome.unwrap_or(FrameOutcome::Failed);
        };
        submit(&mut self.submission(&frame));

        let frame = self.upload(device, frame);
        let frame = self.render_shadows(device, frame);
        let Some(mut frame) = self.begin_render_pass(device, surface, frame) else {
            return FrameOutcome::Failed;
        };
        self.render_opaque(device, &mut frame);
        let frame = self.end_opaque_pass(device, frame);
        let Some(frame) = self.execute_edge_detection(device, surface, frame) else {
            return FrameOutcome::Failed;
        };
        let Some(mut frame) = self.begin_transparent_render_pass(device, surface, frame) else {
            return FrameOutcome::Failed;
        };
        self.render_transparent(device, &mut frame);
        let frame = self.end_transparent_pass(device, frame);
        self.end_frame(device, surface, frame)
    }

    // Accessors

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn stats(&self) -> &FrameStatistics {
        &self.stats
    }

    pub fn assets(&self) -> &AssetRegistry {
        &self.assets
    }

    pub fn instanced(&self) -> &InstancedRenderer {
        &self.instanced
    }

    pub fn transparent(&self) -> &TransparentRenderQueue {
        &self.transparent
    }

    pub fn targets(&self) -> &AuxiliaryTargets {
        &self.targets
    }

    pub fn frame_pool(&self) -> &FrameResourcePool {
        &self.frame_pool
    }

    pub fn uniforms(&self) -> &UniformBufferPool {
        &self.uniforms
    }

    pub fn samplers(&self) -> &SamplerCache {
        &self.samplers
    }

    pub fn last_outcome(&self) -> Option<FrameOutcome> {
        self.last_outcome
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.get()
    }

    /// Wait for the GPU, then destroy everything this pass created
    pub fn release<B: GraphicsBackend>(&mut self, device: &mut GraphicsDevice<B>) {
        if !device.wait_for_idle() {
            log::warn!("Releasing renderer resources without an idle GPU");
        }
        let backend = device.backend_mut();
        self.bloom.release(backend);
        self.edges.release(backend);
        self.opaque.release(backend);
        self.shadow.release(backend);
        self.targets.release(backend);
        self.instanced.release_all(backend);
        self.assets.release_all(backend);
        self.uniforms.release_all(backend);
        self.frame_pool.release(backend);
        self.samplers.clear(backend);
        log::info!("Main render pass released after {} frames", self.stats.total_frames());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, PresentMode};
    use glam::{Mat4, Vec3};

    fn setup(config: RendererConfig) -> (GraphicsDevice<HeadlessBackend>, PresentationSurface, MainRenderPass) {
        let mut device = GraphicsDevice::new(HeadlessBackend::new(320, 240), false).unwrap();
        let mut surface = PresentationSurface::new(320, 240, PresentMode::Fifo);
        assert!(surface.claim(&mut device));
        let renderer = MainRenderPass::new(&mut device, config).unwrap();
        (device, surface, renderer)
    }

    fn camera() -> FrameCamera {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 10.0, 10.0), Vec3::ZERO, Vec3::Y);
        FrameCamera::new(view, Mat4::perspective_rh(1.0, 4.0 / 3.0, 0.1, 100.0), Vec3::new(0.0, 10.0, 10.0))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut device = GraphicsDevice::new(HeadlessBackend::new(320, 240), false).unwrap();
        let result = MainRenderPass::new(&mut device, RendererConfig::default().with_slot_count(7));
        assert!(matches!(result, Err(RenderError::InvalidParameter(_))));
    }

    #[test]
    fn test_frame_statistics_accumulate() {
        let (mut device, mut surface, mut renderer) = setup(RendererConfig::default());
        for _ in 0..3 {
            let outcome = renderer.render_frame(&mut device, &mut surface, &camera(), |_| {});
            assert_eq!(outcome, FrameOutcome::Presented);
        }
        assert_eq!(renderer.stats().presented_frames, 3);
        assert_eq!(renderer.stats().total_frames(), 3);
        assert_eq!(renderer.last_outcome(), Some(FrameOutcome::Presented));
        assert!(renderer.stats().last_frame_draw_calls > 0);
        assert_eq!(device.submitted_count(), 3);
    }

    #[test]
    fn test_frame_block_written_before_passes() {
        let (mut device, mut surface, mut renderer) = setup(RendererConfig::default().with_shadows(false));
        let frame = renderer.begin_frame(&mut device, &mut surface, &camera()).unwrap();
        let block = frame.frame_block;
        let frame = renderer.upload(&mut device, frame);

        let data = device.backend().buffer_data(block.buffer).unwrap();
        let written: FrameUniforms =
            bytemuck::pod_read_unaligned(&data[block.offset as usize..block.offset as usize + block.size as usize]);
        assert_eq!(written.camera.view_proj, camera().view_projection());
        assert_eq!(written.scene.shadow_params.y, 0.0);
        assert!(device.backend().render_pass_labels().is_empty());
        renderer.abandon_frame(&mut device, &mut surface, frame);
    }

    #[test]
    fn test_abandoned_frame_leaves_no_open_recording() {
        let (mut device, mut surface, mut renderer) = setup(RendererConfig::default());
        let frame = renderer.begin_frame(&mut device, &mut surface, &camera()).unwrap();
        let frame = renderer.upload(&mut device, frame);
        renderer.abandon_frame(&mut device, &mut surface, frame);

        assert!(!device.is_recording());
        assert!(!renderer.frame_pool().is_in_frame());
        assert_eq!(renderer.last_outcome(), Some(FrameOutcome::Skipped));
        let outcome = renderer.render_frame(&mut device, &mut surface, &camera(), |_| {});
        assert_eq!(outcome, FrameOutcome::Presented);
    }
}
