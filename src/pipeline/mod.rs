//! Per-source acquisition, latest-frame slots and the compositor.

pub mod compositor;
pub mod history;
pub mod slot;
pub mod source;

pub use compositor::{CompositeError, Composite, Compositor, CompositorHandle, GridLayout};
pub use history::DetectionHistory;
pub use slot::FrameSlot;
pub use source::{CameraSource, SourceHealth, SourceOptions, SourceView};
