//! Scene-content renderers that draw into an open pass

mod instanced;
mod state;
mod transparent;

pub use instanced::*;
pub use state::*;
pub use transparent::*;
