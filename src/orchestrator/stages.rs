//! Typed frame stages
//!
//! A `Frame<S>` is consumed by each stage method and returned in the next stage,
//! so the pass order is checked at compile time: no stage can be reached without
//! completing the one before it.

use crate::backend::FrameContext;
use crate::device::CommandRecorder;
use crate::resources::UniformAllocation;
use crate::scene::FrameCamera;
use std::marker::PhantomData;

/// Image and command recorder acquired; scene content may be submitted
#[derive(Debug)]
pub struct Acquired;
/// Frame uniforms written, instances uploaded and culled, transparents sorted
#[derive(Debug)]
pub struct Uploaded;
#[derive(Debug)]
pub struct ShadowsRendered;
/// Opaque pass open with the camera block bound
#[derive(Debug)]
pub struct OpaqueOpen;
#[derive(Debug)]
pub struct OpaqueDone;
#[derive(Debug)]
pub struct EdgesResolved;
#[derive(Debug)]
pub struct TransparentOpen;
#[derive(Debug)]
pub struct TransparentDone;
/// UI overlay drawn on top of the scene
#[derive(Debug)]
pub struct Overlaid;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::TransparentDone {}
    impl Sealed for super::Overlaid {}
}

/// Stages after which post-processing, submit and present may run
pub trait ReadyForPostProcess: sealed::Sealed {}

impl ReadyForPostProcess for TransparentDone {}
impl ReadyForPostProcess for Overlaid {}

/// One in-flight frame.
///
/// Should end in `MainRenderPass::end_frame` or `MainRenderPass::abandon_frame`.
/// A dropped frame is lost; its recording is discarded when the next frame begins.
#[derive(Debug)]
#[must_use = "a frame must be ended or abandoned"]
pub struct Frame<S> {
    pub(crate) context: FrameContext,
    pub(crate) recorder: CommandRecorder,
    pub(crate) slot: usize,
    pub(crate) camera: FrameCamera,
    pub(crate) frame_block: UniformAllocation,
    _stage: PhantomData<S>,
}

impl Frame<Acquired> {
    pub(crate) fn new(
        context: FrameContext,
        recorder: CommandRecorder,
        slot: usize,
        camera: FrameCamera,
        frame_block: UniformAllocation,
    ) -> Self {
        Self {
            context,
            recorder,
            slot,
            camera,
            frame_block,
            _stage: PhantomData,
        }
    }
}

impl<S> Frame<S> {
    pub(crate) fn advance<T>(self) -> Frame<T> {
        Frame {
            context: self.context,
            recorder: self.recorder,
            slot: self.slot,
            camera: self.camera,
            frame_block: self.frame_block,
            _stage: PhantomData,
        }
    }

    /// The presentable image this frame renders to
    pub fn context(&self) -> &FrameContext {
        &self.context
    }

    /// Frame pool slot in use
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn camera(&self) -> &FrameCamera {
        &self.camera
    }

    /// Sequence number of the frame's command recording
    pub fn sequence(&self) -> u64 {
        self.recorder.sequence()
    }
}

static_assertions::assert_impl_all!(Frame<Acquired>: Send);
static_assertions::assert_not_impl_any!(Acquired: ReadyForPostProcess);
static_assertions::assert_not_impl_any!(OpaqueDone: ReadyForPostProcess);
