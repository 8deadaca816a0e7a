use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;

use crate::clock::{Clock, SystemClock};
use crate::frame::Frame;

use super::StreamConfig;

/// Network or file stream decoded through GStreamer into RGB frames.
///
/// Pipeline: `<source> ! videoconvert ! videoscale ! videorate ! RGB caps ! appsink`.
/// Frame timestamps are the wall-clock time at the first sample plus the
/// buffer PTS, so segment boundaries follow the stream clock rather than
/// arrival jitter.
pub(crate) struct GstreamerSource {
    config: StreamConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    live: bool,
    frame_count: u64,
    base: Option<(i64, u64)>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

impl GstreamerSource {
    pub(crate) fn new(config: StreamConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let (source, live) = source_element(&config.url);
        let pipeline_description = format!(
            "{source} ! videoconvert ! videoscale ! videorate ! \
             video/x-raw,format=RGB,width={},height={},framerate={}/1 ! \
             appsink name=appsink sync=false",
            config.width, config.height, config.target_fps
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build stream pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("stream pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;
        // Live sources drop stale frames; files must not lose any.
        appsink.set_max_buffers(if live { 4 } else { 0 });
        appsink.set_drop(live);

        Ok(Self {
            config,
            pipeline,
            appsink,
            live,
            frame_count: 0,
            base: None,
            connected_at: None,
            last_error: None,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set stream pipeline to Playing")?;
        self.connected_at = Some(Instant::now());
        log::info!(
            "StreamSource: connected to {} ({})",
            self.config.url,
            if self.live { "live" } else { "file" }
        );
        Ok(())
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.poll_bus();
        if let Some(err) = self.last_error.take() {
            return Err(anyhow!(err));
        }

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout().as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                log::info!(
                    "StreamSource: end of stream {} after {} frames",
                    self.config.url,
                    self.frame_count
                );
                return Ok(None);
            }
            return Err(anyhow!("stream {} stalled", self.config.url));
        };

        let (pixels, width, height, pts_us) = sample_to_pixels(&sample)?;
        let timestamp_us = match (self.base, pts_us) {
            (Some((wall, pts0)), Some(pts)) => wall + pts.saturating_sub(pts0) as i64,
            (None, Some(pts)) => {
                let wall = SystemClock.now_us();
                self.base = Some((wall, pts));
                wall
            }
            (_, None) => SystemClock.now_us(),
        };
        let frame = Frame::new(self.frame_count, timestamp_us, width, height, pixels)?;
        self.frame_count += 1;
        Ok(Some(frame))
    }

    pub(crate) fn frame_rate(&self) -> f64 {
        self.config.target_fps.max(1) as f64
    }

    pub(crate) fn describe(&self) -> String {
        format!("gstreamer:{}", self.config.url)
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = (1000 / self.config.target_fps.max(1)).saturating_mul(4);
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            if let MessageView::Error(err) = message.view() {
                self.last_error = Some(format!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                ));
            }
        }
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("StreamSource: failed to stop pipeline: {err}");
        }
    }
}

fn source_element(url: &str) -> (String, bool) {
    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        (format!("rtspsrc location={url} latency=0 ! decodebin"), true)
    } else if url.starts_with("srt://") {
        (format!("srtsrc uri={url} ! decodebin"), true)
    } else {
        let live = !url.starts_with("file://");
        (format!("uridecodebin uri={url}"), live)
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32, Option<u64>)> {
    let buffer = sample.buffer().context("stream sample missing buffer")?;
    let caps = sample.caps().context("stream sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse stream caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;
    let pts_us = buffer.pts().map(|pts| pts.useconds());

    let map = buffer.map_readable().context("map stream buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("stream buffer shorter than frame")?
            .to_vec();
        return Ok((pixels, width, height, pts_us));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("stream buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height, pts_us))
}
