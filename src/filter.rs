//! Motion filter: decides whether a captured segment is worth detecting on and
//! proposes the trimmed window the crossing detector should look at.

use crate::detect::{BoxLimits, DetectionCapability, DetectorBackend, ObjectClass};
use crate::error::StageError;
use crate::frame::Frame;
use crate::registry::StageOutcome;
use crate::{TimeWindow, WorkUnit};

#[derive(Clone, Debug, PartialEq)]
pub struct MotionFilterConfig {
    /// Minimum share of frames with a qualifying detection (closed boundary).
    pub threshold: f64,
    pub min_confidence: f32,
    pub class: ObjectClass,
    pub pre_roll_us: i64,
    pub post_roll_us: i64,
    pub box_limits: BoxLimits,
}

impl Default for MotionFilterConfig {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            min_confidence: 0.6,
            class: ObjectClass::Person,
            pre_roll_us: 2_000_000,
            post_roll_us: 2_000_000,
            box_limits: BoxLimits::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FilterVerdict {
    Qualified {
        window: TimeWindow,
        qualifying_fraction: f64,
    },
    Discarded {
        qualifying_fraction: f64,
    },
}

impl FilterVerdict {
    pub fn into_outcome(self) -> StageOutcome {
        match self {
            FilterVerdict::Qualified {
                window,
                qualifying_fraction,
            } => StageOutcome::Filtered {
                window,
                qualifying_fraction,
            },
            FilterVerdict::Discarded {
                qualifying_fraction,
            } => StageOutcome::Discarded {
                qualifying_fraction,
            },
        }
    }
}

pub struct MotionFilter {
    config: MotionFilterConfig,
}

impl MotionFilter {
    pub fn new(config: MotionFilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MotionFilterConfig {
        &self.config
    }

    /// Run the backend over `frames` and decide the unit's fate.
    ///
    /// `checkpoint` runs before every frame and aborts the pass when it errors.
    pub fn evaluate(
        &self,
        unit: &WorkUnit,
        frames: &[Frame],
        backend: &mut dyn DetectorBackend,
        checkpoint: &mut dyn FnMut() -> Result<(), StageError>,
    ) -> Result<FilterVerdict, StageError> {
        if frames.is_empty() {
            log::info!("MotionFilter: {} has no frames, discarding", unit.id);
            return Ok(FilterVerdict::Discarded {
                qualifying_fraction: 0.0,
            });
        }

        let motion_only = !backend.supports(DetectionCapability::ObjectDetection);
        backend.reset();

        let mut qualifying = 0usize;
        let mut first: Option<i64> = None;
        let mut last: Option<i64> = None;
        for frame in frames {
            checkpoint()?;
            let result = backend
                .detect(frame.pixels(), frame.width, frame.height)
                .map_err(StageError::detector)?;
            let hit = if motion_only {
                result.motion_detected
            } else {
                result
                    .qualifying(
                        self.config.class,
                        self.config.min_confidence,
                        &self.config.box_limits,
                    )
                    .next()
                    .is_some()
            };
            if hit {
                qualifying += 1;
                first.get_or_insert(frame.timestamp_us);
                last = Some(frame.timestamp_us);
            }
        }

        let qualifying_fraction = qualifying as f64 / frames.len() as f64;
        let (Some(first), Some(last)) = (first, last) else {
            log::info!("MotionFilter: {} has no qualifying frames, discarding", unit.id);
            return Ok(FilterVerdict::Discarded {
                qualifying_fraction,
            });
        };
        if qualifying_fraction < self.config.threshold {
            log::info!(
                "MotionFilter: {} discarded ({}/{} frames qualify, threshold {})",
                unit.id,
                qualifying,
                frames.len(),
                self.config.threshold
            );
            return Ok(FilterVerdict::Discarded {
                qualifying_fraction,
            });
        }

        let window = TimeWindow::new(
            first.saturating_sub(self.config.pre_roll_us),
            last.saturating_add(self.config.post_roll_us),
        )
        .clamp_to(&unit.window());
        log::info!(
            "MotionFilter: {} qualifies ({}/{} frames), trimmed to {}..{}",
            unit.id,
            qualifying,
            frames.len(),
            window.start_us,
            window.end_us
        );
        Ok(FilterVerdict::Qualified {
            window,
            qualifying_fraction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{MotionBackend, ThresholdBackend};
    use crate::registry::UnitState;

    const W: u32 = 20;
    const H: u32 = 10;

    fn unit(start_us: i64, duration_us: i64) -> WorkUnit {
        WorkUnit {
            id: "u1".into(),
            event_id: "race".into(),
            start_us,
            duration_us,
            frame_rate: 10.0,
            location: Some("events/race/captured/u1".into()),
            state: UnitState::Filtering,
            owner: Some("w".into()),
            lease_expires_us: None,
            retry_count: 0,
            failed_stage: None,
            failure_reason: None,
            trimmed_window: None,
            created_us: 0,
            updated_us: 0,
        }
    }

    fn frames(count: u64, lit: &[u64]) -> Vec<Frame> {
        (0..count)
            .map(|i| {
                let mut pixels = vec![10u8; (W * H * 3) as usize];
                if lit.contains(&i) {
                    for y in 3..7u32 {
                        for x in 8..11u32 {
                            let idx = ((y * W + x) * 3) as usize;
                            pixels[idx..idx + 3].copy_from_slice(&[250, 250, 250]);
                        }
                    }
                }
                Frame::new(i, i as i64 * 100_000, W, H, pixels).unwrap()
            })
            .collect()
    }

    fn run(filter: &MotionFilter, frames: &[Frame], backend: &mut dyn DetectorBackend) -> FilterVerdict {
        filter
            .evaluate(&unit(0, 1_000_000), frames, backend, &mut || Ok(()))
            .unwrap()
    }

    #[test]
    fn threshold_is_a_closed_boundary() {
        let frames = frames(10, &[3, 4, 5]);
        let at = MotionFilter::new(MotionFilterConfig {
            threshold: 0.3,
            pre_roll_us: 0,
            post_roll_us: 0,
            ..Default::default()
        });
        assert!(matches!(
            run(&at, &frames, &mut ThresholdBackend::default()),
            FilterVerdict::Qualified { .. }
        ));

        let above = MotionFilter::new(MotionFilterConfig {
            threshold: 0.31,
            ..Default::default()
        });
        assert!(matches!(
            run(&above, &frames, &mut ThresholdBackend::default()),
            FilterVerdict::Discarded { .. }
        ));
    }

    #[test]
    fn trimmed_window_adds_rolls_and_clamps() {
        let filter = MotionFilter::new(MotionFilterConfig {
            threshold: 0.1,
            pre_roll_us: 200_000,
            post_roll_us: 500_000,
            ..Default::default()
        });
        let verdict = run(&filter, &frames(10, &[4, 5]), &mut ThresholdBackend::default());
        let FilterVerdict::Qualified { window, qualifying_fraction } = verdict else {
            panic!("expected qualified verdict");
        };
        assert_eq!(window, TimeWindow::new(200_000, 1_000_000));
        assert!((qualifying_fraction - 0.2).abs() < 1e-9);
    }

    #[test]
    fn empty_segment_is_discarded() {
        let filter = MotionFilter::new(MotionFilterConfig::default());
        let verdict = run(&filter, &[], &mut ThresholdBackend::default());
        assert_eq!(verdict.into_outcome().target_state(), UnitState::Done);
    }

    #[test]
    fn motion_backend_uses_change_flag() {
        let filter = MotionFilter::new(MotionFilterConfig {
            threshold: 0.1,
            ..Default::default()
        });
        // Frame 4 lights up, frame 5 goes dark again: two changed frames.
        let verdict = run(&filter, &frames(10, &[4]), &mut MotionBackend::default());
        let FilterVerdict::Qualified { qualifying_fraction, .. } = verdict else {
            panic!("expected qualified verdict");
        };
        assert!((qualifying_fraction - 0.2).abs() < 1e-9);
    }

    #[test]
    fn checkpoint_error_aborts_the_pass() {
        let filter = MotionFilter::new(MotionFilterConfig::default());
        let err = filter
            .evaluate(
                &unit(0, 1_000_000),
                &frames(3, &[]),
                &mut ThresholdBackend::default(),
                &mut || Err(StageError::Cancelled),
            )
            .unwrap_err();
        assert!(matches!(err, StageError::Cancelled));
    }
}
