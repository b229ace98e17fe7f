//! Live screen monitoring of runners.

pub mod hub;
pub mod model;
pub mod ws;

pub use hub::ScreenHub;
pub use model::{FrameUpload, ScreenFrame, ScreenStatus, image_dimensions};
