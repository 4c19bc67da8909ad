//! GPU passes of the city frame
//!
//! 1. Shadow pass - light-space depth of every instance
//! 2. Opaque pass - instanced geometry into scene color, normal, emissive and depth
//! 3. Edge detection - outlines from normal and depth discontinuities
//! 4. Transparent pass - blended objects, back to front
//! 5. Bloom - emissive glow, composited and tonemapped into the swapchain

mod bindings;
mod edge_detect;
mod opaque;
pub mod postprocess;
mod shaders;
mod shadow_pass;
mod targets;

pub use bindings::*;
pub use edge_detect::*;
pub use opaque::*;
pub use shaders::{EDGE_SHADER, SCENE_SHADER, SHADOW_SHADER, TRANSPARENT_SHADER};
pub use shadow_pass::*;
pub use targets::*;
