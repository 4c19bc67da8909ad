//! City Renderer - per-frame GPU rendering pipeline for a tile-based city simulator
//!
//! The renderer draws one frame as a fixed sequence of passes:
//! - **Shadow**: light-space depth of every instanced model
//! - **Opaque**: instanced terrain, buildings and effects into HDR scene color, normals and emissive
//! - **Edge detection**: outlines from the normal and depth targets
//! - **Transparent**: construction ghosts, selection overlays and underground views, back to front
//! - **Bloom**: threshold, mip chain and composite into the swapchain image
//!
//! `MainRenderPass` owns the per-frame state and hands out typed `Frame<S>` tokens so the
//! pass order is checked at compile time. Two backends implement `GraphicsBackend`:
//! - **wgpu**: the real GPU backend
//! - **headless**: records commands in memory, for tests and tooling

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod stats;
pub mod surface;

pub use backend::wgpu_backend::WgpuBackend;
pub use backend::{GraphicsBackend, HeadlessBackend, PresentMode};
pub use config::RendererConfig;
pub use device::GraphicsDevice;
pub use error::{RenderError, RenderResult};
pub use orchestrator::{Frame, FrameOutcome, MainRenderPass, SceneSubmission};
pub use renderer::{ModelAsset, RenderLayer};
pub use resources::{AssetRegistry, GpuMesh, InstanceRecord, MaterialDesc, MeshData, ModelId};
pub use scene::{Camera, FrameCamera};
pub use stats::FrameStatistics;
pub use surface::PresentationSurface;
