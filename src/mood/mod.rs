//! Mood collaborators
//!
//! The pieces around the connect layer that decide which mood is shown:
//! the renderer seam, the button policy and the HTTP control surface.

mod button;
mod control;
mod renderer;

pub use button::{CyclePolicy, MoodCycler};
pub use control::{ControlSurface, Response};
pub use renderer::{MoodBoard, Renderer, DEFAULT_MOODS, MAX_MOODS};
