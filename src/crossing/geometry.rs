use crate::CrossingDirection;

const EXTENT_EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Where a motion segment meets the trigger line.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LineCrossing {
    /// Position of the intersection along the motion segment, in `(0, 1]`.
    pub fraction: f64,
    pub direction: CrossingDirection,
}

/// Trigger line from `a` to `b`.
///
/// The side of a point is the sign of the cross product of `b - a` and `p - a`
/// in image coordinates (y down): for a line drawn top to bottom, points on the
/// left are negative and points on the right positive. Moving from the negative
/// to the positive side is `Forward`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LineSegment {
    pub a: Point,
    pub b: Point,
}

impl LineSegment {
    pub fn new(a: Point, b: Point) -> Self {
        Self { a, b }
    }

    /// Line given as normalised `[x1, y1, x2, y2]`, scaled to a frame.
    pub fn from_normalized(coords: [f64; 4], width: u32, height: u32) -> Self {
        let (w, h) = (width as f64, height as f64);
        Self {
            a: Point::new(coords[0] * w, coords[1] * h),
            b: Point::new(coords[2] * w, coords[3] * h),
        }
    }

    pub fn side(&self, p: &Point) -> f64 {
        (self.b.y - self.a.y) * (p.x - self.a.x) - (self.b.x - self.a.x) * (p.y - self.a.y)
    }

    /// Test the motion `from -> to` against the line.
    ///
    /// Leaving a point that lies exactly on the line is not a crossing; arriving
    /// on it is. A track that touches the line and continues therefore crosses
    /// once.
    pub fn crossing(&self, from: &Point, to: &Point) -> Option<LineCrossing> {
        let s0 = self.side(from);
        let s1 = self.side(to);
        let direction = if s0 < 0.0 && s1 >= 0.0 {
            CrossingDirection::Forward
        } else if s0 > 0.0 && s1 <= 0.0 {
            CrossingDirection::Reverse
        } else {
            return None;
        };

        let fraction = s0 / (s0 - s1);
        let hit = Point::new(
            from.x + fraction * (to.x - from.x),
            from.y + fraction * (to.y - from.y),
        );
        let (dx, dy) = (self.b.x - self.a.x, self.b.y - self.a.y);
        let len_sq = dx * dx + dy * dy;
        if len_sq <= 0.0 {
            return None;
        }
        let along = ((hit.x - self.a.x) * dx + (hit.y - self.a.y) * dy) / len_sq;
        if !(-EXTENT_EPSILON..=1.0 + EXTENT_EPSILON).contains(&along) {
            return None;
        }

        Some(LineCrossing {
            fraction,
            direction,
        })
    }
}
