//! Frame pipeline integration tests.
//!
//! Each test drives whole frames through `MainRenderPass` on the headless backend
//! and checks what reached the command stream and the statistics.
//!
//! # Test Categories
//!
//! - **Frame Order**: pass sequence, UI overlay placement, bloom variants
//! - **Surface**: claiming, resize handling, skipped and failed frames
//! - **Resources**: instance capacity, frame slot rotation, uniform alignment
//! - **Transparency**: back-to-front ordering
//! - **Contracts**: edge detection without opaque geometry

mod common;

use city_renderer::backend::{BackendError, HeadlessBackend, RecordedCommand};
use city_renderer::config::BloomQuality;
use city_renderer::orchestrator::FrameOutcome;
use city_renderer::pipeline::postprocess::{
    BLOOM_COMPOSITE_LABEL, BLOOM_DOWNSAMPLE_LABEL, BLOOM_EXTRACT_LABEL, BLOOM_UPSAMPLE_LABEL,
};
use city_renderer::pipeline::{EDGE_PASS_LABEL, OPAQUE_PASS_LABEL, SHADOW_PASS_LABEL, TRANSPARENT_PASS_LABEL};
use city_renderer::{GraphicsBackend, GraphicsDevice, ModelId, PresentMode, PresentationSurface, RendererConfig};
use common::{origin_camera, overview_camera, TestContext, HEIGHT, WIDTH};
use glam::{Mat4, Vec3, Vec4};
use rstest::rstest;

const BUILDINGS: ModelId = ModelId(1);

fn bloom_labels(mips: u32) -> Vec<&'static str> {
    let mut labels = vec![BLOOM_EXTRACT_LABEL];
    labels.extend(std::iter::repeat(BLOOM_DOWNSAMPLE_LABEL).take(mips as usize - 1));
    labels.extend(std::iter::repeat(BLOOM_UPSAMPLE_LABEL).take(mips as usize - 1));
    labels.push(BLOOM_COMPOSITE_LABEL);
    labels
}

// ============================================================================
// Frame Order
// ============================================================================

#[rstest]
#[case::low(BloomQuality::Low)]
#[case::medium(BloomQuality::Medium)]
#[case::high(BloomQuality::High)]
fn test_full_frame_pass_order(#[case] quality: BloomQuality) {
    let mut ctx = TestContext::new(RendererConfig::default().with_bloom_quality(quality).with_shadows(true));
    ctx.cube_model(BUILDINGS, 16);

    let outcome = ctx.renderer.render_frame(&mut ctx.device, &mut ctx.surface, &overview_camera(), |scene| {
        assert!(scene.add_instance(BUILDINGS, Mat4::IDENTITY, Vec4::ONE, Vec4::ZERO));
    });
    assert_eq!(outcome, FrameOutcome::Presented);

    let mut expected = vec![SHADOW_PASS_LABEL, OPAQUE_PASS_LABEL, EDGE_PASS_LABEL, TRANSPARENT_PASS_LABEL];
    expected.extend(bloom_labels(quality.mip_levels()));
    assert_eq!(ctx.pass_labels(), expected);
    assert_eq!(ctx.renderer.stats().presented_frames, 1);
}

#[test]
fn test_disabled_bloom_and_shadows_keep_composite() {
    let mut ctx = TestContext::new(RendererConfig::default().with_bloom_disabled(true).with_shadows(false));

    let outcome = ctx
        .renderer
        .render_frame(&mut ctx.device, &mut ctx.surface, &overview_camera(), |_| {});
    assert_eq!(outcome, FrameOutcome::Presented);
    assert_eq!(
        ctx.pass_labels(),
        vec![OPAQUE_PASS_LABEL, EDGE_PASS_LABEL, TRANSPARENT_PASS_LABEL, BLOOM_COMPOSITE_LABEL]
    );
}

#[test]
fn test_ui_overlay_lands_before_post_processing() {
    let mut ctx = TestContext::new(RendererConfig::default().with_bloom_disabled(true).with_shadows(false));
    let camera = overview_camera();
    let device = &mut ctx.device;
    let surface = &mut ctx.surface;
    let renderer = &mut ctx.renderer;

    let frame = renderer.begin_frame(device, surface, &camera).unwrap();
    let frame = renderer.upload(device, frame);
    let frame = renderer.render_shadows(device, frame);
    let mut frame = renderer.begin_render_pass(device, surface, frame).unwrap();
    renderer.render_opaque(device, &mut frame);
    let frame = renderer.end_opaque_pass(device, frame);
    let frame = renderer.execute_edge_detection(device, surface, frame).unwrap();
    let mut frame = renderer.begin_transparent_render_pass(device, surface, frame).unwrap();
    assert!(renderer.render_transparent(device, &mut frame));
    let frame = renderer.end_transparent_pass(device, frame);

    let mut overlay_calls = 0;
    let frame = renderer
        .render_ui_overlay(device, surface, frame, |backend, context| {
            overlay_calls += 1;
            assert_eq!((context.width, context.height), (WIDTH, HEIGHT));
            backend.draw(0..6, 0..1);
        })
        .unwrap();
    assert_eq!(renderer.end_frame(device, surface, frame), FrameOutcome::Presented);

    assert_eq!(overlay_calls, 1);
    assert_eq!(
        ctx.pass_labels(),
        vec![
            OPAQUE_PASS_LABEL,
            EDGE_PASS_LABEL,
            TRANSPARENT_PASS_LABEL,
            city_renderer::orchestrator::UI_OVERLAY_LABEL,
            BLOOM_COMPOSITE_LABEL,
        ]
    );
}

// ============================================================================
// Surface
// ============================================================================

#[test]
fn test_claim_is_idempotent_per_device() {
    let mut ctx = TestContext::new(RendererConfig::default());
    assert!(ctx.surface.claim(&mut ctx.device));
    assert!(ctx.surface.claim(&mut ctx.device));

    let mut other = GraphicsDevice::new(HeadlessBackend::new(WIDTH, HEIGHT), false).unwrap();
    assert!(!ctx.surface.claim(&mut other));

    ctx.surface.release();
    assert!(ctx.surface.claim(&mut other));
}

#[test]
fn test_resize_rebuilds_targets_before_next_frame() {
    let mut ctx = TestContext::new(RendererConfig::default());
    let camera = overview_camera();

    ctx.renderer.render_frame(&mut ctx.device, &mut ctx.surface, &camera, |_| {});
    let targets = ctx.renderer.targets().get().unwrap();
    assert_eq!(targets.scene_color.size(), (1280, 720));
    assert_eq!(ctx.renderer.targets().rebuilds(), 1);

    ctx.surface.on_resize(1920, 1080);
    // Deferred until the next acquire
    assert_eq!(ctx.surface.size(), (1280, 720));

    let outcome = ctx.renderer.render_frame(&mut ctx.device, &mut ctx.surface, &camera, |_| {});
    assert_eq!(outcome, FrameOutcome::Presented);
    assert_eq!(ctx.surface.size(), (1920, 1080));
    // Scene color, normal, emissive, depth, then the bloom mips at 1/2, 1/4 and 1/8
    assert_eq!(
        ctx.renderer.targets().dimensions(),
        vec![
            (1920, 1080),
            (1920, 1080),
            (1920, 1080),
            (1920, 1080),
            (960, 540),
            (480, 270),
            (240, 135),
        ]
    );
    assert_eq!(ctx.renderer.targets().rebuilds(), 2);
}

#[rstest]
#[case::timeout(BackendError::Timeout)]
#[case::outdated(BackendError::SurfaceOutdated)]
fn test_unavailable_image_skips_frame(#[case] error: BackendError) {
    let mut ctx = TestContext::new(RendererConfig::default());
    let camera = overview_camera();
    ctx.device.backend_mut().fail_next_acquire(error);

    let outcome = ctx.renderer.render_frame(&mut ctx.device, &mut ctx.surface, &camera, |_| {
        panic!("no scene submission for a skipped frame");
    });
    assert_eq!(outcome, FrameOutcome::Skipped);
    assert_eq!(ctx.renderer.stats().skipped_frames, 1);
    assert!(ctx.pass_labels().is_empty());
    assert!(!ctx.device.is_recording());

    let outcome = ctx.renderer.render_frame(&mut ctx.device, &mut ctx.surface, &camera, |_| {});
    assert_eq!(outcome, FrameOutcome::Presented);
}

#[test]
fn test_minimized_window_skips_until_restored() {
    let mut ctx = TestContext::new(RendererConfig::default());
    let camera = overview_camera();

    ctx.surface.on_resize(0, 0);
    let outcome = ctx.renderer.render_frame(&mut ctx.device, &mut ctx.surface, &camera, |_| {});
    assert_eq!(outcome, FrameOutcome::Skipped);

    ctx.surface.on_resize(800, 600);
    let outcome = ctx.renderer.render_frame(&mut ctx.device, &mut ctx.surface, &camera, |_| {});
    assert_eq!(outcome, FrameOutcome::Presented);
    assert_eq!(ctx.surface.size(), (800, 600));
}

#[test]
fn test_acquire_failure_counts_failed_frame() {
    let mut ctx = TestContext::new(RendererConfig::default());
    ctx.device
        .backend_mut()
        .fail_next_acquire(BackendError::AcquireImageFailed("device removed".into()));

    let outcome = ctx
        .renderer
        .render_frame(&mut ctx.device, &mut ctx.surface, &overview_camera(), |_| {});
    assert_eq!(outcome, FrameOutcome::Failed);
    assert_eq!(ctx.renderer.stats().failed_frames, 1);
    assert!(ctx.renderer.last_error().is_some());
}

#[test]
fn test_submit_failure_drops_frame_and_recovers() {
    let mut ctx = TestContext::new(RendererConfig::default());
    let camera = overview_camera();
    ctx.device.backend_mut().fail_next_submit();

    let outcome = ctx.renderer.render_frame(&mut ctx.device, &mut ctx.surface, &camera, |_| {});
    assert_eq!(outcome, FrameOutcome::Failed);
    assert_eq!(ctx.device.failed_submissions(), 1);

    let outcome = ctx.renderer.render_frame(&mut ctx.device, &mut ctx.surface, &camera, |_| {});
    assert_eq!(outcome, FrameOutcome::Presented);
    let stats = ctx.renderer.stats();
    assert_eq!((stats.presented_frames, stats.failed_frames), (1, 1));
}

#[test]
fn test_present_mode_change_applied_on_next_acquire() {
    let mut ctx = TestContext::new(RendererConfig::default());
    ctx.surface.set_present_mode(PresentMode::Mailbox);
    assert_eq!(ctx.device.backend().present_mode(), PresentMode::Fifo);

    ctx.renderer
        .render_frame(&mut ctx.device, &mut ctx.surface, &overview_camera(), |_| {});
    assert_eq!(ctx.device.backend().present_mode(), PresentMode::Mailbox);
    assert_eq!(ctx.surface.present_mode(), PresentMode::Mailbox);
}

// ============================================================================
// Resources
// ============================================================================

#[test]
fn test_instance_capacity_drops_overflow() {
    let mut ctx = TestContext::new(RendererConfig::default());
    ctx.cube_model(BUILDINGS, 4);

    let outcome = ctx.renderer.render_frame(&mut ctx.device, &mut ctx.surface, &overview_camera(), |scene| {
        let kept = (0..5)
            .filter(|i| {
                let transform = Mat4::from_translation(Vec3::new(*i as f32, 0.0, 0.0));
                scene.add_instance(BUILDINGS, transform, Vec4::ONE, Vec4::ZERO)
            })
            .count();
        assert_eq!(kept, 4);
        assert_eq!(scene.instance_count(BUILDINGS), 4);
    });
    assert_eq!(outcome, FrameOutcome::Presented);
    assert_eq!(ctx.renderer.stats().dropped_instances, 1);
}

#[test]
fn test_unknown_model_is_ignored() {
    let mut ctx = TestContext::new(RendererConfig::default());
    ctx.renderer
        .render_frame(&mut ctx.device, &mut ctx.surface, &overview_camera(), |scene| {
            assert!(!scene.add_instance(ModelId(99), Mat4::IDENTITY, Vec4::ONE, Vec4::ZERO));
        });
    assert_eq!(ctx.renderer.instanced().model_count(), 0);
}

#[rstest]
#[case::two(2)]
#[case::three(3)]
#[case::four(4)]
fn test_frame_slots_rotate_and_reset(#[case] slots: usize) {
    let mut ctx = TestContext::new(RendererConfig::default().with_slot_count(slots));
    ctx.cube_model(BUILDINGS, 8);
    let camera = overview_camera();

    for frame_index in 0..slots * 2 {
        let frame = ctx
            .renderer
            .begin_frame(&mut ctx.device, &mut ctx.surface, &camera)
            .unwrap();
        assert_eq!(frame.slot(), frame_index % slots);
        assert_eq!(ctx.renderer.frame_pool().current_cursor(), 0);

        ctx.renderer
            .submission(&frame)
            .add_instance(BUILDINGS, Mat4::IDENTITY, Vec4::ONE, Vec4::ZERO);
        let frame = ctx.renderer.upload(&mut ctx.device, frame);
        assert!(ctx.renderer.frame_pool().current_cursor() > 0);
        ctx.renderer.abandon_frame(&mut ctx.device, &mut ctx.surface, frame);
    }
    assert_eq!(ctx.renderer.stats().skipped_frames, (slots * 2) as u64);
}

#[rstest]
#[case::device_256(256, 256)]
#[case::device_512(512, 512)]
#[case::device_64(64, 256)]
fn test_uniform_alignment_follows_device(#[case] device_alignment: u32, #[case] expected: u64) {
    let backend = HeadlessBackend::new(WIDTH, HEIGHT).with_min_uniform_alignment(device_alignment);
    let mut ctx = TestContext::with_backend(backend, RendererConfig::default());
    assert_eq!(ctx.renderer.uniforms().alignment(), expected);

    let (mesh, material) = ctx.cube();
    ctx.renderer
        .render_frame(&mut ctx.device, &mut ctx.surface, &origin_camera(), |scene| {
            for i in 0..3 {
                let transform = Mat4::from_translation(Vec3::new(0.0, 0.0, -(i as f32) - 1.0));
                scene.add_object(mesh, material, transform, None, Vec4::ZERO);
            }
        });

    let object_offsets: Vec<u32> = ctx
        .device
        .backend()
        .commands()
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::SetBindGroup { index: 2, offsets, .. } => offsets.first().copied(),
            _ => None,
        })
        .collect();
    assert_eq!(object_offsets.len(), 3);
    assert!(object_offsets.iter().all(|o| *o as u64 % expected == 0));
    // Frame block plus three transparent object blocks
    assert_eq!(ctx.renderer.stats().peak_uniform_bytes, 256 + 3 * 96);
}

// ============================================================================
// Transparency
// ============================================================================

#[test]
fn test_transparent_objects_sorted_back_to_front() {
    let mut ctx = TestContext::new(RendererConfig::default());
    let (mesh, material) = ctx.cube();
    let camera = origin_camera();

    let frame = ctx
        .renderer
        .begin_frame(&mut ctx.device, &mut ctx.surface, &camera)
        .unwrap();
    {
        let mut scene = ctx.renderer.submission(&frame);
        for distance in [1.0, 10.0, 5.0] {
            scene.add_construction_ghost(mesh, material, Mat4::from_translation(Vec3::new(distance, 0.0, 0.0)));
        }
    }
    let frame = ctx.renderer.upload(&mut ctx.device, frame);

    let order: Vec<f32> = ctx
        .renderer
        .transparent()
        .objects()
        .iter()
        .map(|o| o.world_position().x)
        .collect();
    assert_eq!(order, vec![10.0, 5.0, 1.0]);
    assert!(ctx.renderer.transparent().is_sorted());
    ctx.renderer.abandon_frame(&mut ctx.device, &mut ctx.surface, frame);
}

#[test]
fn test_transparent_draws_one_call_per_object() {
    let mut ctx = TestContext::new(RendererConfig::default().with_bloom_disabled(true).with_shadows(false));
    let (mesh, material) = ctx.cube();

    ctx.renderer
        .render_frame(&mut ctx.device, &mut ctx.surface, &origin_camera(), |scene| {
            scene.add_selection_overlay(mesh, material, Mat4::from_translation(Vec3::NEG_Z * 3.0));
            scene.add_underground_ghost(mesh, material, Mat4::from_translation(Vec3::NEG_Z * 6.0));
        });
    // Edge detection, two transparent objects and the composite
    assert_eq!(ctx.device.backend().draw_count(), 4);
    assert_eq!(ctx.renderer.stats().contract_violations, 0);
}

// ============================================================================
// Contracts
// ============================================================================

#[test]
fn test_edge_detection_without_opaque_is_flagged() {
    let mut ctx = TestContext::new(RendererConfig::default());
    let camera = overview_camera();
    let device = &mut ctx.device;
    let surface = &mut ctx.surface;
    let renderer = &mut ctx.renderer;

    let frame = renderer.begin_frame(device, surface, &camera).unwrap();
    let frame = renderer.upload(device, frame);
    let frame = renderer.render_shadows(device, frame);
    let frame = renderer.begin_render_pass(device, surface, frame).unwrap();
    // Opaque layers intentionally skipped
    let frame = renderer.end_opaque_pass(device, frame);
    let frame = renderer.execute_edge_detection(device, surface, frame).unwrap();
    let mut frame = renderer.begin_transparent_render_pass(device, surface, frame).unwrap();
    renderer.render_transparent(device, &mut frame);
    let frame = renderer.end_transparent_pass(device, frame);

    assert_eq!(renderer.end_frame(device, surface, frame), FrameOutcome::Presented);
    assert_eq!(renderer.stats().contract_violations, 1);
    assert!(renderer.last_error().unwrap().contains("edge detection"));
}

#[rstest]
#[case::after_acquire(false)]
#[case::inside_opaque_pass(true)]
fn test_dropped_frame_does_not_block_later_frames(#[case] mid_pass: bool) {
    let mut ctx = TestContext::new(RendererConfig::default());
    ctx.cube_model(BUILDINGS, 4);
    let camera = overview_camera();
    {
        let device = &mut ctx.device;
        let surface = &mut ctx.surface;
        let renderer = &mut ctx.renderer;
        let frame = renderer.begin_frame(device, surface, &camera).unwrap();
        if mid_pass {
            let frame = renderer.upload(device, frame);
            let frame = renderer.render_shadows(device, frame);
            let mut frame = renderer.begin_render_pass(device, surface, frame).unwrap();
            renderer.render_opaque(device, &mut frame);
            drop(frame);
        } else {
            drop(frame);
        }
    }
    assert!(ctx.device.is_recording());

    let outcomes: Vec<FrameOutcome> = (0..3)
        .map(|_| {
            ctx.renderer.render_frame(&mut ctx.device, &mut ctx.surface, &camera, |scene| {
                scene.add_instance(BUILDINGS, Mat4::IDENTITY, Vec4::ONE, Vec4::ZERO);
            })
        })
        .collect();
    assert_eq!(outcomes, vec![FrameOutcome::Presented; 3]);
    assert_eq!(ctx.device.stale_recordings(), 1);
    assert_eq!(ctx.renderer.stats().presented_frames, 3);
    assert!(!ctx.device.is_recording());
}

#[test]
fn test_release_frees_gpu_resources() {
    let mut ctx = TestContext::new(RendererConfig::default());
    ctx.cube_model(BUILDINGS, 8);
    ctx.renderer
        .render_frame(&mut ctx.device, &mut ctx.surface, &overview_camera(), |_| {});
    assert!(ctx.device.backend().live_textures() > 0);

    ctx.renderer.release(&mut ctx.device);
    assert_eq!(ctx.device.backend().live_textures(), 0);
    assert_eq!(ctx.device.backend().live_samplers(), 0);
}

#[test]
fn test_surface_without_claim_fails_frame() {
    let mut ctx = TestContext::new(RendererConfig::default());
    let mut unclaimed = PresentationSurface::new(WIDTH, HEIGHT, PresentMode::Fifo);

    let outcome = ctx
        .renderer
        .render_frame(&mut ctx.device, &mut unclaimed, &overview_camera(), |_| {});
    assert_eq!(outcome, FrameOutcome::Failed);
    assert!(ctx.renderer.last_error().unwrap().contains("surface is not claimed"));
    assert!(!ctx.device.is_recording());
}
