use std::collections::{BTreeMap, HashSet};

use super::geometry::Point;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackPoint {
    pub frame_index: u64,
    pub timestamp_us: i64,
    pub anchor: Point,
    pub confidence: f32,
}

/// One object followed across frames of a single detection pass.
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub id: u64,
    pub points: Vec<TrackPoint>,
    /// Consecutive frames without a matching detection.
    pub missed: u32,
    /// Time of the last crossing this track emitted.
    pub last_emitted_us: Option<i64>,
}

impl Track {
    pub fn last(&self) -> Option<&TrackPoint> {
        self.points.last()
    }

    /// The two most recent points, oldest first.
    pub fn last_step(&self) -> Option<(&TrackPoint, &TrackPoint)> {
        match self.points.as_slice() {
            [.., prev, cur] => Some((prev, cur)),
            _ => None,
        }
    }
}

/// A detection reduced to what the tracker needs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation {
    pub anchor: Point,
    pub confidence: f32,
}

#[derive(Debug, Default)]
pub struct TrackUpdate {
    /// Existing tracks that received a new point this frame.
    pub extended: Vec<u64>,
    pub created: Vec<u64>,
    pub closed: Vec<Track>,
}

/// Short-lived track arena for one unit.
///
/// Association is greedy: every (track, observation) pair within
/// `max_distance` is considered in order of increasing distance and taken when
/// neither side is matched yet. A track is closed once it has gone unmatched
/// for more than `timeout_frames` frames.
pub struct Tracker {
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
    max_distance: f64,
    timeout_frames: u32,
}

impl Tracker {
    pub fn new(max_distance: f64, timeout_frames: u32) -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 1,
            max_distance,
            timeout_frames,
        }
    }

    pub fn get(&self, id: u64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Track> {
        self.tracks.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn update(
        &mut self,
        frame_index: u64,
        timestamp_us: i64,
        observations: &[Observation],
    ) -> TrackUpdate {
        let mut pairs: Vec<(f64, u64, usize)> = Vec::new();
        for (id, track) in &self.tracks {
            let Some(last) = track.last() else { continue };
            for (idx, obs) in observations.iter().enumerate() {
                let distance = last.anchor.distance(&obs.anchor);
                if distance <= self.max_distance {
                    pairs.push((distance, *id, idx));
                }
            }
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut update = TrackUpdate::default();
        let mut matched_tracks = HashSet::new();
        let mut matched_obs = vec![false; observations.len()];
        for (_, id, idx) in pairs {
            if matched_obs[idx] || matched_tracks.contains(&id) {
                continue;
            }
            matched_obs[idx] = true;
            matched_tracks.insert(id);
            if let Some(track) = self.tracks.get_mut(&id) {
                track.points.push(TrackPoint {
                    frame_index,
                    timestamp_us,
                    anchor: observations[idx].anchor,
                    confidence: observations[idx].confidence,
                });
                track.missed = 0;
                update.extended.push(id);
            }
        }

        let mut expired = Vec::new();
        for (id, track) in self.tracks.iter_mut() {
            if matched_tracks.contains(id) {
                continue;
            }
            track.missed += 1;
            if track.missed > self.timeout_frames {
                expired.push(*id);
            }
        }
        for id in expired {
            if let Some(track) = self.tracks.remove(&id) {
                update.closed.push(track);
            }
        }

        for (idx, obs) in observations.iter().enumerate() {
            if matched_obs[idx] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.insert(
                id,
                Track {
                    id,
                    points: vec![TrackPoint {
                        frame_index,
                        timestamp_us,
                        anchor: obs.anchor,
                        confidence: obs.confidence,
                    }],
                    missed: 0,
                    last_emitted_us: None,
                },
            );
            update.created.push(id);
        }
        update.extended.sort_unstable();
        update
    }

    /// End of pass: hand back every remaining track.
    pub fn drain(&mut self) -> Vec<Track> {
        std::mem::take(&mut self.tracks).into_values().collect()
    }
}
