pub mod config;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use types::{
    object_color, Geometry, ObjectInfo, SegmentationMask, BACKGROUND_GRAY,
};
