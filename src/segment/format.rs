use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat};
use sha2::{Digest, Sha256};

use crate::frame::{rgb_len, Frame};
use crate::TimeWindow;

const MAGIC: &[u8; 4] = b"FLSG";
const VERSION: u16 = 2;

/// Header flag: the container holds a clip that does not cover its requested window.
pub const FLAG_PARTIAL: u16 = 0x0001;

/// Maximum frames in one container (about 55 minutes at 30 fps).
const MAX_FRAMES: usize = 100_000;

/// Maximum frame edge accepted when decoding.
const MAX_DIMENSION: u32 = 8192;

/// Slack over the raw frame size allowed for one coded frame; JPEG headers
/// outweigh the pixels of very small frames.
const CODED_FRAME_SLACK: usize = 64 * 1024;

const DIGEST_LEN: usize = 32;

const CODEC_RAW: u8 = 0;
const CODEC_JPEG: u8 = 1;

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// How frame pixels are stored inside a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameCodec {
    /// Uncompressed RGB24, bit exact.
    Raw,
    /// One baseline JPEG per frame (motion-JPEG style); lossy.
    Jpeg { quality: u8 },
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::Jpeg {
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl FrameCodec {
    fn tag(self) -> (u8, u8) {
        match self {
            FrameCodec::Raw => (CODEC_RAW, 0),
            FrameCodec::Jpeg { quality } => (CODEC_JPEG, quality),
        }
    }

    fn from_tag(codec: u8, quality: u8) -> Result<Self> {
        match codec {
            CODEC_RAW => Ok(FrameCodec::Raw),
            CODEC_JPEG if (1..=100).contains(&quality) => Ok(FrameCodec::Jpeg { quality }),
            CODEC_JPEG => Err(anyhow!("invalid jpeg quality {}", quality)),
            other => Err(anyhow!("unknown frame codec {}", other)),
        }
    }

    fn encode_frame(self, frame: &Frame) -> Result<Vec<u8>> {
        match self {
            FrameCodec::Raw => Ok(frame.pixels().to_vec()),
            FrameCodec::Jpeg { quality } => {
                let mut out = Vec::new();
                JpegEncoder::new_with_quality(&mut out, quality)
                    .encode(frame.pixels(), frame.width, frame.height, ExtendedColorType::Rgb8)
                    .with_context(|| format!("jpeg encoding frame {}", frame.index))?;
                Ok(out)
            }
        }
    }

    fn decode_frame(self, bytes: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
        match self {
            FrameCodec::Raw => Ok(bytes.to_vec()),
            FrameCodec::Jpeg { .. } => {
                let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
                    .context("jpeg decoding frame")?
                    .into_rgb8();
                if image.dimensions() != (width, height) {
                    return Err(anyhow!(
                        "jpeg frame is {}x{}, segment is {}x{}",
                        image.width(),
                        image.height(),
                        width,
                        height
                    ));
                }
                Ok(image.into_raw())
            }
        }
    }
}

/// Segment container: a header, coded frames with their capture timestamps and
/// a SHA-256 trailer over everything before it.
///
/// Layout (little endian):
///
/// ```text
/// "FLSG" | version u16 | flags u16 | codec u8 | quality u8 | width u32 | height u32
/// frame_rate f64 | start_us i64 | duration_us i64 | frame_count u32
/// frame_count × (index u64 | timestamp_us i64 | len u32 | len bytes)
/// sha256[32]
/// ```
///
/// Clips reuse the same container with `FLAG_PARTIAL` set when truncated.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentFile {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub start_us: i64,
    pub duration_us: i64,
    pub partial: bool,
    pub codec: FrameCodec,
    pub frames: Vec<Frame>,
}

impl SegmentFile {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.start_us, self.start_us + self.duration_us)
    }

    /// Frames whose capture time falls inside `window` (closed).
    pub fn frames_in(&self, window: TimeWindow) -> impl Iterator<Item = &Frame> {
        self.frames
            .iter()
            .filter(move |frame| window.contains(frame.timestamp_us))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let frame_len = rgb_len(self.width, self.height)?;
        if self.frames.len() > MAX_FRAMES {
            return Err(anyhow!(
                "segment holds {} frames, maximum is {}",
                self.frames.len(),
                MAX_FRAMES
            ));
        }
        let per_frame = match self.codec {
            FrameCodec::Raw => frame_len,
            FrameCodec::Jpeg { .. } => frame_len / 10,
        };
        let mut out = Vec::with_capacity(50 + self.frames.len() * (20 + per_frame) + DIGEST_LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        let flags = if self.partial { FLAG_PARTIAL } else { 0 };
        out.extend_from_slice(&flags.to_le_bytes());
        let (codec, quality) = self.codec.tag();
        out.extend_from_slice(&[codec, quality]);
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.frame_rate.to_bits().to_le_bytes());
        out.extend_from_slice(&self.start_us.to_le_bytes());
        out.extend_from_slice(&self.duration_us.to_le_bytes());
        out.extend_from_slice(&(self.frames.len() as u32).to_le_bytes());
        for frame in &self.frames {
            if frame.width != self.width || frame.height != self.height {
                return Err(anyhow!(
                    "frame {} is {}x{}, segment is {}x{}",
                    frame.index,
                    frame.width,
                    frame.height,
                    self.width,
                    self.height
                ));
            }
            out.extend_from_slice(&frame.index.to_le_bytes());
            out.extend_from_slice(&frame.timestamp_us.to_le_bytes());
            let coded = self.codec.encode_frame(frame)?;
            out.extend_from_slice(&(coded.len() as u32).to_le_bytes());
            out.extend_from_slice(&coded);
        }
        let digest = Sha256::digest(&out);
        out.extend_from_slice(&digest);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MAGIC.len() + DIGEST_LEN {
            return Err(anyhow!("segment too short"));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - DIGEST_LEN);
        if Sha256::digest(body).as_slice() != trailer {
            return Err(anyhow!("segment digest mismatch"));
        }

        let mut cursor = 0usize;
        if read_slice(body, &mut cursor, 4)? != MAGIC {
            return Err(anyhow!("not a segment container"));
        }
        let version = read_u16(body, &mut cursor)?;
        if version != VERSION {
            return Err(anyhow!("unsupported segment version {}", version));
        }
        let flags = read_u16(body, &mut cursor)?;
        let tag = read_slice(body, &mut cursor, 2)?;
        let codec = FrameCodec::from_tag(tag[0], tag[1])?;
        let width = read_u32(body, &mut cursor)?;
        let height = read_u32(body, &mut cursor)?;
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(anyhow!("invalid segment dimensions {}x{}", width, height));
        }
        let frame_rate = f64::from_bits(read_u64(body, &mut cursor)?);
        if !(frame_rate > 0.0 && frame_rate.is_finite()) {
            return Err(anyhow!("invalid segment frame rate"));
        }
        let start_us = read_i64(body, &mut cursor)?;
        let duration_us = read_i64(body, &mut cursor)?;
        let frame_count = read_u32(body, &mut cursor)? as usize;
        if frame_count > MAX_FRAMES {
            return Err(anyhow!(
                "frame count {} exceeds maximum {}",
                frame_count,
                MAX_FRAMES
            ));
        }
        let frame_len = rgb_len(width, height)?;

        let mut frames = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            let index = read_u64(body, &mut cursor)?;
            let timestamp_us = read_i64(body, &mut cursor)?;
            let len = read_u32(body, &mut cursor)? as usize;
            let fits = match codec {
                FrameCodec::Raw => len == frame_len,
                FrameCodec::Jpeg { .. } => len <= frame_len + CODED_FRAME_SLACK,
            };
            if !fits {
                return Err(anyhow!("frame {} has an implausible length of {} bytes", index, len));
            }
            let coded = read_slice(body, &mut cursor, len)?;
            let pixels = codec
                .decode_frame(coded, width, height)
                .with_context(|| format!("frame {}", index))?;
            frames.push(Frame::new(index, timestamp_us, width, height, pixels)?);
        }
        if cursor != body.len() {
            return Err(anyhow!("trailing bytes after last frame"));
        }

        Ok(Self {
            width,
            height,
            frame_rate,
            start_us,
            duration_us,
            partial: flags & FLAG_PARTIAL != 0,
            codec,
            frames,
        })
    }
}

/// Short hex fingerprint of an encoded container, for logs.
pub fn fingerprint(encoded: &[u8]) -> String {
    let start = encoded.len().saturating_sub(DIGEST_LEN);
    hex::encode(&encoded[start..(start + 8).min(encoded.len())])
}

fn read_u16(bytes: &[u8], cursor: &mut usize) -> Result<u16> {
    let slice = read_slice(bytes, cursor, 2)?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let slice = read_slice(bytes, cursor, 4)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64> {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(read_slice(bytes, cursor, 8)?);
    Ok(u64::from_le_bytes(buf))
}

fn read_i64(bytes: &[u8], cursor: &mut usize) -> Result<i64> {
    Ok(read_u64(bytes, cursor)? as i64)
}

fn read_slice<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .ok_or_else(|| anyhow!("invalid segment encoding"))?;
    if end > bytes.len() {
        return Err(anyhow!("invalid segment encoding"));
    }
    let out = &bytes[*cursor..end];
    *cursor = end;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(partial: bool) -> SegmentFile {
        let frames = (0..3)
            .map(|i| Frame::new(i, 1_000_000 + i as i64 * 100_000, 2, 2, vec![i as u8; 12]).unwrap())
            .collect();
        SegmentFile {
            width: 2,
            height: 2,
            frame_rate: 10.0,
            start_us: 1_000_000,
            duration_us: 300_000,
            partial,
            codec: FrameCodec::Raw,
            frames,
        }
    }

    /// Dark frame with a bright block that moves one pixel per frame.
    fn scene_frame(i: u64, width: u32, height: u32) -> Frame {
        let mut pixels = vec![20u8; (width * height * 3) as usize];
        for y in height / 3..2 * height / 3 {
            for x in (i as u32 + 10)..(i as u32 + 26) {
                let idx = ((y * width + x) * 3) as usize;
                pixels[idx..idx + 3].fill(235);
            }
        }
        Frame::new(i, 2_000_000 + i as i64 * 100_000, width, height, pixels).unwrap()
    }

    #[test]
    fn encoded_segment_decodes_identically() {
        let segment = sample(true);
        let decoded = SegmentFile::decode(&segment.encode().unwrap()).unwrap();
        assert_eq!(decoded, segment);
        assert!(decoded.partial);
    }

    #[test]
    fn jpeg_frames_are_much_smaller_and_close_to_the_source() {
        let (width, height) = (160, 120);
        let frames: Vec<Frame> = (0..10).map(|i| scene_frame(i, width, height)).collect();
        let raw = SegmentFile {
            width,
            height,
            frame_rate: 10.0,
            start_us: 2_000_000,
            duration_us: 1_000_000,
            partial: false,
            codec: FrameCodec::Raw,
            frames: frames.clone(),
        };
        let jpeg = SegmentFile {
            codec: FrameCodec::default(),
            ..raw.clone()
        };
        let raw_bytes = raw.encode().unwrap();
        let jpeg_bytes = jpeg.encode().unwrap();
        assert!(
            jpeg_bytes.len() * 4 < raw_bytes.len(),
            "jpeg {} bytes vs raw {} bytes",
            jpeg_bytes.len(),
            raw_bytes.len()
        );

        let decoded = SegmentFile::decode(&jpeg_bytes).unwrap();
        assert_eq!(decoded.codec, FrameCodec::Jpeg { quality: 90 });
        assert_eq!(decoded.frames.len(), frames.len());
        for (got, want) in decoded.frames.iter().zip(&frames) {
            assert_eq!(got.index, want.index);
            assert_eq!(got.timestamp_us, want.timestamp_us);
            assert_eq!((got.width, got.height), (width, height));
            let worst = got
                .pixels()
                .iter()
                .zip(want.pixels())
                .map(|(a, b)| a.abs_diff(*b))
                .max()
                .unwrap();
            // Bright stays bright and dark stays dark at the luma threshold.
            assert!(worst < 100, "frame {} off by {}", want.index, worst);
        }
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let mut bytes = sample(false).encode().unwrap();
        bytes[8] = 7;
        let body_len = bytes.len() - DIGEST_LEN;
        let digest = Sha256::digest(&bytes[..body_len]);
        bytes[body_len..].copy_from_slice(&digest);
        let err = SegmentFile::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("codec"));
    }

    #[test]
    fn flipped_byte_is_detected() {
        let mut bytes = sample(false).encode().unwrap();
        bytes[60] ^= 0xff;
        let err = SegmentFile::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("digest"));
    }

    #[test]
    fn truncated_segment_is_rejected() {
        let bytes = sample(false).encode().unwrap();
        assert!(SegmentFile::decode(&bytes[..bytes.len() - 10]).is_err());
        assert!(SegmentFile::decode(b"FLSG").is_err());
    }

    #[test]
    fn frames_in_window_is_closed() {
        let segment = sample(false);
        let inside: Vec<u64> = segment
            .frames_in(TimeWindow::new(1_100_000, 1_200_000))
            .map(|f| f.index)
            .collect();
        assert_eq!(inside, vec![1, 2]);
    }

    #[test]
    fn mismatched_frame_dimensions_do_not_encode() {
        let mut segment = sample(false);
        segment.frames.push(Frame::new(9, 0, 1, 1, vec![0; 3]).unwrap());
        assert!(segment.encode().is_err());
    }
}
