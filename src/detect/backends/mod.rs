pub mod motion;
pub mod threshold;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use motion::MotionBackend;
pub use threshold::ThresholdBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
