mod result;

pub use result::{BoundingBox, DetectionSnapshot};
