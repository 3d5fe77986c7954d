//! Record framing.
//!
//! Every supported payload format begins with the 32-bit magic number
//! [`RECORD_MAGIC`]. Fixed-size records are validated in bulk with
//! [`valid_records`]; variable-sized payloads (camera frames, point clouds)
//! carry a packed metadata header from which the payload length is derived.

use log::{error, warn};
use num_enum::TryFromPrimitive;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::errors::{PipeError, Result};

/// Leading magic number of every record ("VOXL" in little-endian ASCII).
pub const RECORD_MAGIC: u32 = 0x564F584C;

/// Image formats carried in [`CameraMeta::format`].
///
/// Only the encoded formats change library behavior (frame sequencing); the
/// rest are tags passed through to consumers.
pub mod image_format {
    /// 8-bit raw greyscale.
    pub const RAW8: i16 = 0;
    /// 16-bit raw.
    pub const RAW16: i16 = 1;
    /// NV12 YUV 4:2:0.
    pub const NV12: i16 = 2;
    /// NV21 YUV 4:2:0.
    pub const NV21: i16 = 3;
    /// Packed YUV 4:2:2.
    pub const YUV422: i16 = 4;
    /// 24-bit RGB.
    pub const RGB: i16 = 5;
    /// 32-bit float, one channel.
    pub const FLOAT32: i16 = 6;
    /// Side-by-side stereo pair of RAW8 images.
    pub const STEREO_RAW8: i16 = 7;
    /// H.264 encoded video.
    pub const H264: i16 = 8;
    /// H.265 encoded video.
    pub const H265: i16 = 9;
}

/// Metadata header preceding every camera frame payload.
///
/// 48 bytes, packed, little-endian fields. The payload that follows is
/// exactly `size_bytes` long; for stereo formats it is split 50/50 into left
/// then right image.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct CameraMeta {
    /// Must equal [`RECORD_MAGIC`].
    pub magic_number: u32,
    /// Frame capture time, nanoseconds, monotonic.
    pub timestamp_ns: i64,
    /// Monotonically increasing frame counter.
    pub frame_id: i32,
    /// Image width in pixels.
    pub width: i16,
    /// Image height in pixels.
    pub height: i16,
    /// Payload length in bytes.
    pub size_bytes: u32,
    /// Row stride in bytes.
    pub stride: u32,
    /// Exposure time in nanoseconds.
    pub exposure_ns: i32,
    /// Sensor gain.
    pub gain: i16,
    /// One of the [`image_format`] constants.
    pub format: i16,
    /// Nominal frame rate, frames per second.
    pub framerate: i32,
    /// Reserved, write as zero.
    pub reserved: u64,
}

impl CameraMeta {
    /// A zeroed header with the magic number set.
    pub fn new() -> CameraMeta {
        let mut meta = CameraMeta::new_zeroed();
        meta.magic_number = RECORD_MAGIC;
        meta
    }

    /// Expected payload length.
    pub fn payload_len(&self) -> usize {
        self.size_bytes as usize
    }

    /// Upper bound on a sane payload for these dimensions, used to reject a
    /// garbage header before allocating for it.
    pub fn max_reasonable_size(&self) -> usize {
        let w = self.width.max(0) as usize;
        let h = self.height.max(0) as usize;
        w * h * 10
    }
}

impl Default for CameraMeta {
    fn default() -> CameraMeta {
        CameraMeta::new()
    }
}

/// Point-cloud payload layouts, one per stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum PointCloudFormat {
    /// Three f32 coordinates per point.
    FloatXyz = 0,
    /// XYZ plus an f32 confidence.
    FloatXyzc = 1,
    /// XYZ plus three color bytes.
    FloatXyzRgb = 2,
    /// XYZ, f32 confidence, three color bytes.
    FloatXyzcRgb = 3,
    /// Two f32 coordinates per point.
    FloatXy = 4,
    /// XY plus an f32 confidence.
    FloatXyc = 5,
}

impl PointCloudFormat {
    /// Bytes per point for this layout.
    pub const fn stride(self) -> usize {
        match self {
            PointCloudFormat::FloatXyz => 12,
            PointCloudFormat::FloatXyzc => 16,
            PointCloudFormat::FloatXyzRgb => 15,
            PointCloudFormat::FloatXyzcRgb => 19,
            PointCloudFormat::FloatXy => 8,
            PointCloudFormat::FloatXyc => 12,
        }
    }
}

/// Metadata header preceding every point-cloud payload.
///
/// 64 bytes, packed. The payload is `n_points` times the stride of `format`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct PointCloudMeta {
    /// Must equal [`RECORD_MAGIC`].
    pub magic_number: u32,
    /// Capture time, nanoseconds, monotonic.
    pub timestamp_ns: i64,
    /// Number of points in the payload.
    pub n_points: u32,
    /// A [`PointCloudFormat`] discriminant.
    pub format: u32,
    /// Publisher-assigned stream id.
    pub id: u32,
    /// NUL-padded name of the publishing server.
    pub server_name: [u8; 32],
    /// Reserved, write as zero.
    pub reserved: u64,
}

impl PointCloudMeta {
    /// A zeroed header with the magic number set.
    pub fn new() -> PointCloudMeta {
        let mut meta = PointCloudMeta::new_zeroed();
        meta.magic_number = RECORD_MAGIC;
        meta
    }

    /// Expected payload length, derived from the format stride table.
    ///
    /// Fails on an unknown format id.
    pub fn payload_len(&self) -> Result<usize> {
        let format = self.format;
        let n_points = self.n_points;
        match PointCloudFormat::try_from(format) {
            Ok(f) => Ok(f.stride() * n_points as usize),
            Err(_) => {
                error!("unknown point cloud format id {}", format);
                Err(PipeError::InvalidArg)
            }
        }
    }
}

impl Default for PointCloudMeta {
    fn default() -> PointCloudMeta {
        PointCloudMeta::new()
    }
}

/// A fixed-size record type that can be bulk-validated out of a byte stream.
///
/// Implementors must be `#[repr(C, packed)]` so that any buffer offset is a
/// valid record start.
pub trait FixedRecord: FromBytes + KnownLayout + Immutable + Sized {
    /// The leading magic-number field of this record.
    fn magic_number(&self) -> u32;
}

/// Validate a buffer holding consecutive fixed-size records.
///
/// The buffer length must be a whole multiple of the record size; readers
/// allocate their buffers that way so a partial tail never occurs. Returns the
/// prefix of records whose magic number checks out, warning if any trailing
/// records were rejected.
pub fn valid_records<T: FixedRecord>(buf: &[u8]) -> Result<&[T]> {
    let record_size = std::mem::size_of::<T>();
    if record_size == 0 || buf.len() % record_size != 0 {
        error!(
            "record buffer of {} bytes is not a multiple of the {}-byte record",
            buf.len(),
            record_size
        );
        return Err(PipeError::InvalidArg);
    }
    let records = <[T]>::ref_from_bytes(buf).map_err(|_| PipeError::InvalidArg)?;
    let valid = records
        .iter()
        .take_while(|r| r.magic_number() == RECORD_MAGIC)
        .count();
    if valid < records.len() {
        warn!(
            "bad magic number at record {} of {}, dropping the rest",
            valid,
            records.len()
        );
    }
    Ok(&records[..valid])
}

/// Classification of an encoded-video payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodedFrameKind {
    /// Codec configuration (SPS/VPS). Cached by the server for late joiners.
    Header,
    /// Intra-coded frame, decodable on its own.
    Intra,
    /// Predicted frame, requires the preceding intra frame.
    Predicted,
}

/// Classify an encoded-video payload from the NAL byte at offset 4.
///
/// Returns `None` (with a warning) for a byte that matches no known class;
/// B-frames land here and are treated as unsupported.
pub fn classify_encoded_frame(format: i16, payload: &[u8]) -> Option<EncodedFrameKind> {
    if payload.len() <= 4 {
        warn!("encoded frame of {} bytes is too short to classify", payload.len());
        return None;
    }
    let nal = payload[4];
    let kind = match format {
        image_format::H264 => match nal {
            0x67 => Some(EncodedFrameKind::Header),
            0x65 => Some(EncodedFrameKind::Intra),
            0x41 => Some(EncodedFrameKind::Predicted),
            _ => None,
        },
        image_format::H265 => match nal {
            0x40 => Some(EncodedFrameKind::Header),
            0x26 => Some(EncodedFrameKind::Intra),
            0x02 => Some(EncodedFrameKind::Predicted),
            _ => None,
        },
        _ => {
            warn!("format {} is not an encoded video format", format);
            return None;
        }
    };
    if kind.is_none() {
        warn!("unclassified frame byte 0x{:02x} for format {}", nal, format);
    }
    kind
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metadata_layouts_are_stable() {
        assert_eq!(std::mem::size_of::<CameraMeta>(), 48);
        assert_eq!(std::mem::size_of::<PointCloudMeta>(), 64);
    }

    #[test]
    fn stride_table() {
        assert_eq!(PointCloudFormat::FloatXyz.stride(), 12);
        assert_eq!(PointCloudFormat::FloatXyzc.stride(), 16);
        assert_eq!(PointCloudFormat::FloatXyzRgb.stride(), 15);
        assert_eq!(PointCloudFormat::FloatXyzcRgb.stride(), 19);
        assert_eq!(PointCloudFormat::FloatXy.stride(), 8);
        assert_eq!(PointCloudFormat::FloatXyc.stride(), 12);
    }

    #[test]
    fn point_cloud_payload_len() {
        let mut meta = PointCloudMeta::new();
        meta.n_points = 100;
        meta.format = PointCloudFormat::FloatXyzcRgb as u32;
        assert_eq!(meta.payload_len().unwrap(), 1900);

        meta.format = 99;
        assert_eq!(meta.payload_len(), Err(PipeError::InvalidArg));
    }

    #[test]
    fn classify_h264() {
        let mut frame = [0u8; 16];
        frame[4] = 0x67;
        assert_eq!(
            classify_encoded_frame(image_format::H264, &frame),
            Some(EncodedFrameKind::Header)
        );
        frame[4] = 0x65;
        assert_eq!(
            classify_encoded_frame(image_format::H264, &frame),
            Some(EncodedFrameKind::Intra)
        );
        frame[4] = 0x41;
        assert_eq!(
            classify_encoded_frame(image_format::H264, &frame),
            Some(EncodedFrameKind::Predicted)
        );
        frame[4] = 0x99;
        assert_eq!(classify_encoded_frame(image_format::H264, &frame), None);
    }

    #[test]
    fn classify_h265() {
        let mut frame = [0u8; 16];
        frame[4] = 0x40;
        assert_eq!(
            classify_encoded_frame(image_format::H265, &frame),
            Some(EncodedFrameKind::Header)
        );
        frame[4] = 0x26;
        assert_eq!(
            classify_encoded_frame(image_format::H265, &frame),
            Some(EncodedFrameKind::Intra)
        );
        frame[4] = 0x02;
        assert_eq!(
            classify_encoded_frame(image_format::H265, &frame),
            Some(EncodedFrameKind::Predicted)
        );
    }

    #[test]
    fn classify_rejects_short_and_non_video() {
        assert_eq!(classify_encoded_frame(image_format::H264, &[0u8; 3]), None);
        assert_eq!(classify_encoded_frame(image_format::RAW8, &[0u8; 16]), None);
    }

    #[repr(C, packed)]
    #[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
    struct TestRecord {
        magic_number: u32,
        value: u32,
    }

    impl FixedRecord for TestRecord {
        fn magic_number(&self) -> u32 {
            self.magic_number
        }
    }

    #[test]
    fn valid_records_accepts_whole_stream() {
        let mut buf = Vec::new();
        for value in 0u32..4 {
            let rec = TestRecord {
                magic_number: RECORD_MAGIC,
                value,
            };
            buf.extend_from_slice(rec.as_bytes());
        }
        let records: &[TestRecord] = valid_records(&buf).unwrap();
        assert_eq!(records.len(), 4);
        let last = records[3].value;
        assert_eq!(last, 3);
    }

    #[test]
    fn valid_records_stops_at_bad_magic() {
        let good = TestRecord {
            magic_number: RECORD_MAGIC,
            value: 7,
        };
        let bad = TestRecord {
            magic_number: 0xDEADBEEF,
            value: 8,
        };
        let mut buf = Vec::new();
        buf.extend_from_slice(good.as_bytes());
        buf.extend_from_slice(bad.as_bytes());
        let records: &[TestRecord] = valid_records(&buf).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn valid_records_rejects_partial_tail() {
        let buf = vec![0u8; std::mem::size_of::<TestRecord>() + 1];
        assert!(valid_records::<TestRecord>(&buf).is_err());
    }
}
