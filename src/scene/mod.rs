//! Camera and culling primitives

mod camera;
mod frustum;

pub use camera::*;
pub use frustum::*;
