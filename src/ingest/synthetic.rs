use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::clock::{Clock, SystemClock};
use crate::frame::{rgb_len, Frame};
use crate::{frame_interval_us, MICROS_PER_SECOND};

use super::StreamConfig;

const BACKGROUND: u8 = 20;
const RUNNER: u8 = 235;

/// Parameters of a `stub://` scene.
///
/// `stub://name?duration=30&runner=10:20&start=1700000000000000&pace=0`
///
/// * `duration`: seconds until end of stream (unbounded when absent)
/// * `runner`: one bright runner moving left to right across the frame between
///   the two times (seconds from stream start); may be repeated
/// * `start`: timestamp of the first frame in microseconds (wall clock when absent)
/// * `pace`: `0` delivers frames as fast as they are pulled, otherwise frames
///   are paced to the frame rate
#[derive(Clone, Debug, PartialEq)]
pub struct SceneSpec {
    pub duration: Option<Duration>,
    pub runners: Vec<(f64, f64)>,
    pub start_us: Option<i64>,
    pub paced: bool,
}

impl SceneSpec {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("not a stub url: {url}"))?;
        let query = rest.split_once('?').map(|(_, q)| q).unwrap_or("");
        let mut spec = SceneSpec {
            duration: None,
            runners: Vec::new(),
            start_us: None,
            paced: true,
        };
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("stub parameter `{pair}` has no value"))?;
            *seen.entry(key).or_default() += 1;
            match key {
                "duration" => {
                    let secs: f64 = value.parse().context("stub duration")?;
                    if !(secs > 0.0 && secs.is_finite()) {
                        return Err(anyhow!("stub duration must be positive"));
                    }
                    spec.duration = Some(Duration::from_secs_f64(secs));
                }
                "runner" => {
                    let (from, to) = value
                        .split_once(':')
                        .ok_or_else(|| anyhow!("stub runner must be from:to seconds"))?;
                    let from: f64 = from.parse().context("stub runner start")?;
                    let to: f64 = to.parse().context("stub runner end")?;
                    if !(from >= 0.0 && to > from) {
                        return Err(anyhow!("stub runner needs 0 <= from < to"));
                    }
                    spec.runners.push((from, to));
                }
                "start" => spec.start_us = Some(value.parse().context("stub start")?),
                "pace" => spec.paced = value != "0",
                other => return Err(anyhow!("unknown stub parameter `{other}`")),
            }
        }
        if let Some((key, _)) = seen.iter().find(|(k, n)| **n > 1 && **k != "runner") {
            return Err(anyhow!("stub parameter `{key}` given twice"));
        }
        Ok(spec)
    }
}

/// Deterministic scene generator for `stub://` URLs.
///
/// A dark frame with one bright rectangle per active runner. Each runner
/// travels from 1/8 to 7/8 of the frame width at constant speed while active,
/// vertically centred. Frame timestamps are exact multiples of the frame
/// interval from the scene start.
pub struct SyntheticScene {
    config: StreamConfig,
    spec: SceneSpec,
    start_us: i64,
    next_index: u64,
    connected_at: Option<Instant>,
}

impl SyntheticScene {
    pub fn new(config: StreamConfig) -> Result<Self> {
        let spec = SceneSpec::parse(&config.url)?;
        rgb_len(config.width, config.height)?;
        Ok(Self {
            config,
            spec,
            start_us: 0,
            next_index: 0,
            connected_at: None,
        })
    }

    pub fn connect(&mut self) -> Result<()> {
        self.start_us = self.spec.start_us.unwrap_or_else(|| SystemClock.now_us());
        self.next_index = 0;
        self.connected_at = Some(Instant::now());
        log::info!(
            "StreamSource: connected to {} (synthetic, {} runners)",
            self.config.url,
            self.spec.runners.len()
        );
        Ok(())
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let connected_at = self
            .connected_at
            .ok_or_else(|| anyhow!("synthetic source not connected"))?;
        let interval_us = frame_interval_us(self.frame_rate());
        let offset_us = self.next_index as i64 * interval_us;
        if let Some(duration) = self.spec.duration {
            if offset_us as u128 >= duration.as_micros() {
                return Ok(None);
            }
        }
        if self.spec.paced {
            let due = connected_at + Duration::from_micros(offset_us as u64);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }

        let t = offset_us as f64 / MICROS_PER_SECOND as f64;
        let pixels = self.render(t);
        let frame = Frame::new(
            self.next_index,
            self.start_us + offset_us,
            self.config.width,
            self.config.height,
            pixels,
        )?;
        self.next_index += 1;
        Ok(Some(frame))
    }

    pub fn frame_rate(&self) -> f64 {
        self.config.target_fps.max(1) as f64
    }

    /// Horizontal centre of each runner visible at `t` seconds, in pixels.
    pub fn runner_positions(&self, t: f64) -> Vec<f64> {
        let w = self.config.width as f64;
        self.spec
            .runners
            .iter()
            .filter(|(from, to)| t >= *from && t <= *to)
            .map(|(from, to)| {
                let progress = (t - from) / (to - from);
                w / 8.0 + progress * (w * 6.0 / 8.0)
            })
            .collect()
    }

    fn render(&self, t: f64) -> Vec<u8> {
        let (w, h) = (self.config.width as usize, self.config.height as usize);
        let mut pixels = vec![BACKGROUND; w * h * 3];
        let runner_w = (self.config.width as f64 / 10.0).max(1.0);
        let runner_h = (self.config.height as f64 / 3.0).max(1.0);
        let top = (h as f64 - runner_h) / 2.0;
        for cx in self.runner_positions(t) {
            let left = cx - runner_w / 2.0;
            for y in 0..h {
                let py = y as f64 + 0.5;
                if py < top || py >= top + runner_h {
                    continue;
                }
                for x in 0..w {
                    let px = x as f64 + 0.5;
                    if px >= left && px < left + runner_w {
                        let idx = (y * w + x) * 3;
                        pixels[idx..idx + 3].fill(RUNNER);
                    }
                }
            }
        }
        pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> StreamConfig {
        StreamConfig {
            url: url.to_string(),
            target_fps: 10,
            width: 64,
            height: 48,
        }
    }

    #[test]
    fn parses_scene_parameters() {
        let spec =
            SceneSpec::parse("stub://finish?duration=30&runner=10:20&runner=12:25&start=5&pace=0")
                .unwrap();
        assert_eq!(spec.duration, Some(Duration::from_secs(30)));
        assert_eq!(spec.runners, vec![(10.0, 20.0), (12.0, 25.0)]);
        assert_eq!(spec.start_us, Some(5));
        assert!(!spec.paced);

        assert!(SceneSpec::parse("stub://x?runner=5:5").is_err());
        assert!(SceneSpec::parse("stub://x?bogus=1").is_err());
        assert!(SceneSpec::parse("stub://x?duration=1&duration=2").is_err());
        assert!(SceneSpec::parse("stub://plain").unwrap().paced);
    }

    #[test]
    fn stream_ends_after_duration() {
        let mut scene = SyntheticScene::new(config("stub://t?duration=1&start=0&pace=0")).unwrap();
        scene.connect().unwrap();
        let mut count = 0;
        while let Some(frame) = scene.next_frame().unwrap() {
            assert_eq!(frame.timestamp_us, count * 100_000);
            count += 1;
        }
        assert_eq!(count, 10);
    }

    #[test]
    fn runner_crosses_the_middle_halfway() {
        let mut scene =
            SyntheticScene::new(config("stub://t?duration=30&runner=10:20&start=0&pace=0")).unwrap();
        scene.connect().unwrap();
        assert!(scene.runner_positions(5.0).is_empty());
        assert_eq!(scene.runner_positions(15.0), vec![32.0]);

        let frame = (0..=150)
            .filter_map(|_| scene.next_frame().unwrap())
            .last()
            .unwrap();
        assert_eq!(frame.timestamp_us, 15_000_000);
        let row = 24 * 64 * 3;
        let lit: Vec<usize> = (0..64)
            .filter(|x| frame.pixels()[row + x * 3] == RUNNER)
            .collect();
        assert_eq!(lit.first(), Some(&29));
        assert_eq!(lit.last(), Some(&34));
    }
}
