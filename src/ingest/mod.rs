//! Frame sources for the capture stage.
//!
//! `StreamSource` picks a backend from the URL: `stub://` scenes are generated
//! in-process; anything else (`rtsp://`, `srt://`, `file://`, `http(s)://`) is
//! decoded through GStreamer when the `ingest-gstreamer` feature is enabled.

#[cfg(feature = "ingest-gstreamer")]
mod pipeline;
pub mod synthetic;

use anyhow::Result;

use crate::frame::{Frame, FrameSource};

#[cfg(feature = "ingest-gstreamer")]
use self::pipeline::GstreamerSource;
pub use synthetic::{SceneSpec, SyntheticScene};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub url: String,
    /// Frames per second delivered to the segment writer.
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "stub://finish_line".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

pub struct StreamSource {
    backend: StreamBackend,
}

enum StreamBackend {
    Synthetic(SyntheticScene),
    #[cfg(feature = "ingest-gstreamer")]
    Gstreamer(GstreamerSource),
}

impl StreamSource {
    pub fn new(config: StreamConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: StreamBackend::Synthetic(SyntheticScene::new(config)?),
            })
        } else {
            #[cfg(feature = "ingest-gstreamer")]
            {
                Ok(Self {
                    backend: StreamBackend::Gstreamer(GstreamerSource::new(config)?),
                })
            }
            #[cfg(not(feature = "ingest-gstreamer"))]
            {
                anyhow::bail!(
                    "stream {} requires the ingest-gstreamer feature",
                    config.url
                )
            }
        }
    }
}

impl FrameSource for StreamSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            StreamBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "ingest-gstreamer")]
            StreamBackend::Gstreamer(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            StreamBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "ingest-gstreamer")]
            StreamBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn frame_rate(&self) -> f64 {
        match &self.backend {
            StreamBackend::Synthetic(source) => source.frame_rate(),
            #[cfg(feature = "ingest-gstreamer")]
            StreamBackend::Gstreamer(source) => source.frame_rate(),
        }
    }

    fn describe(&self) -> String {
        match &self.backend {
            StreamBackend::Synthetic(_) => "synthetic".to_string(),
            #[cfg(feature = "ingest-gstreamer")]
            StreamBackend::Gstreamer(source) => source.describe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_urls_use_the_synthetic_backend() -> Result<()> {
        let mut source = StreamSource::new(StreamConfig {
            url: "stub://test?duration=0.2&pace=0".to_string(),
            target_fps: 10,
            width: 32,
            height: 24,
        })?;
        source.connect()?;
        assert_eq!(source.describe(), "synthetic");
        assert_eq!(source.frame_rate(), 10.0);

        let frame = source.next_frame()?.expect("first frame");
        assert_eq!((frame.width, frame.height), (32, 24));
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        Ok(())
    }

    #[cfg(not(feature = "ingest-gstreamer"))]
    #[test]
    fn network_urls_need_gstreamer() {
        let err = StreamSource::new(StreamConfig {
            url: "rtsp://camera/stream".to_string(),
            ..Default::default()
        })
        .err()
        .expect("rtsp without gstreamer");
        assert!(err.to_string().contains("ingest-gstreamer"));
    }
}
