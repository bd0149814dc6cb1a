use bytes::{BufMut, Bytes, BytesMut};
use memchr::memmem;

use crate::error::{IngestError, IngestResult};

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

pub fn nal_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1f).unwrap_or(0)
}

/// Coded slice NAL units, the only ones carried in packets.
pub fn is_frame_nal(kind: u8) -> bool {
    (NAL_SLICE..=NAL_IDR).contains(&kind)
}

/// Splits an Annex-B byte stream on `00 00 01` / `00 00 00 01` start codes.
pub fn split_annexb(data: &Bytes) -> Vec<Bytes> {
    let mut starts = Vec::new();
    for pos in memmem::find_iter(data, b"\x00\x00\x01") {
        starts.push(pos + 3);
    }

    let mut nalus = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let mut end = match starts.get(i + 1) {
            Some(next) => next - 3,
            None => data.len(),
        };
        // trailing_zero_8bits and the leading zero of a 4-byte start code
        while end > start && data[end - 1] == 0x00 {
            end -= 1;
        }
        if end > start {
            nalus.push(data.slice(start..end));
        }
    }
    nalus
}

/// Splits `length_size`-byte length-prefixed NAL units (AVCC framing).
pub fn split_length_prefixed(data: &Bytes, length_size: usize) -> IngestResult<Vec<Bytes>> {
    if !(1..=4).contains(&length_size) {
        return Err(IngestError::Stream(format!(
            "invalid NAL length size {length_size}"
        )));
    }

    let mut nalus = Vec::new();
    let mut pos = 0;
    while pos + length_size <= data.len() {
        let len = data[pos..pos + length_size]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        pos += length_size;
        if pos + len > data.len() {
            return Err(IngestError::Stream("truncated NAL unit".into()));
        }
        if len > 0 {
            nalus.push(data.slice(pos..pos + len));
        }
        pos += len;
    }
    Ok(nalus)
}

/// Joins NAL units into the canonical 4-byte length-prefixed payload.
pub fn length_prefix<'a>(nalus: impl IntoIterator<Item = &'a Bytes>) -> Bytes {
    let mut out = BytesMut::new();
    for nal in nalus {
        out.put_u32(nal.len() as u32);
        out.extend_from_slice(nal);
    }
    out.freeze()
}

/// First SPS, first PPS and NAL length size from an
/// AVCDecoderConfigurationRecord.
pub struct AvcConfig {
    pub sps: Bytes,
    pub pps: Bytes,
    pub length_size: usize,
}

impl AvcConfig {
    pub fn parse(record: &Bytes) -> IngestResult<Self> {
        let invalid = || IngestError::Negotiation("invalid AVC decoder configuration".into());
        if record.len() < 7 || record[0] != 1 {
            return Err(invalid());
        }
        let length_size = (record[4] & 0x03) as usize + 1;

        let mut pos = 5;
        let read_sets = |pos: &mut usize, count: usize| -> IngestResult<Option<Bytes>> {
            let mut first = None;
            for _ in 0..count {
                let len_bytes = record.get(*pos..*pos + 2).ok_or_else(invalid)?;
                let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                *pos += 2;
                if *pos + len > record.len() {
                    return Err(invalid());
                }
                first.get_or_insert_with(|| record.slice(*pos..*pos + len));
                *pos += len;
            }
            Ok(first)
        };

        let sps_count = (record[pos] & 0x1f) as usize;
        pos += 1;
        let sps = read_sets(&mut pos, sps_count)?.ok_or_else(invalid)?;
        let pps_count = *record.get(pos).ok_or_else(invalid)? as usize;
        pos += 1;
        let pps = read_sets(&mut pos, pps_count)?.ok_or_else(invalid)?;

        Ok(Self {
            sps,
            pps,
            length_size,
        })
    }

    pub fn build(sps: &[u8], pps: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(11 + sps.len() + pps.len());
        out.put_u8(1);
        out.put_u8(sps.get(1).copied().unwrap_or(0x42));
        out.put_u8(sps.get(2).copied().unwrap_or(0));
        out.put_u8(sps.get(3).copied().unwrap_or(0x1e));
        // reserved bits, 4-byte NAL lengths
        out.put_u8(0xff);
        out.put_u8(0xe1);
        out.put_u16(sps.len() as u16);
        out.extend_from_slice(sps);
        out.put_u8(1);
        out.put_u16(pps.len() as u16);
        out.extend_from_slice(pps);
        out.freeze()
    }
}

/// Removes emulation prevention bytes.
fn to_rbsp(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0;
    for &b in nal {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    fn bits(&mut self, n: u32) -> Option<u32> {
        (0..n).try_fold(0u32, |acc, _| Some((acc << 1) | self.bit()?))
    }

    fn ue(&mut self) -> Option<u32> {
        let mut zeros = 0;
        while self.bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        Some((1u32 << zeros) - 1 + self.bits(zeros)?)
    }

    fn se(&mut self) -> Option<i32> {
        let v = self.ue()?;
        Some(if v % 2 == 1 {
            ((v + 1) / 2) as i32
        } else {
            -((v / 2) as i32)
        })
    }
}

/// `seq_parameter_set_id` of an SPS NAL unit.
pub fn sps_id(sps: &[u8]) -> Option<u32> {
    let rbsp = to_rbsp(sps);
    let mut r = BitReader {
        data: rbsp.get(1..)?,
        pos: 0,
    };
    r.bits(24)?; // profile_idc, constraint flags, level_idc
    r.ue()
}

/// `pic_parameter_set_id` of a PPS NAL unit.
pub fn pps_id(pps: &[u8]) -> Option<u32> {
    let rbsp = to_rbsp(pps);
    let mut r = BitReader {
        data: rbsp.get(1..)?,
        pos: 0,
    };
    r.ue()
}

/// Picture dimensions from a sequence parameter set NAL unit.
pub fn sps_dimensions(sps: &[u8]) -> Option<(u32, u32)> {
    let rbsp = to_rbsp(sps);
    let mut r = BitReader {
        data: rbsp.get(1..)?,
        pos: 0,
    };

    let profile_idc = r.bits(8)?;
    r.bits(16)?; // constraint flags, level_idc
    r.ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.ue()?;
        if chroma_format_idc == 3 {
            r.bit()?; // separate_colour_plane_flag
        }
        r.ue()?; // bit_depth_luma_minus8
        r.ue()?; // bit_depth_chroma_minus8
        r.bit()?; // qpprime_y_zero_transform_bypass_flag
        if r.bit()? == 1 {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.bit()? == 1 {
                    let size = if i < 6 { 16 } else { 64 };
                    let (mut last, mut next) = (8i32, 8i32);
                    for _ in 0..size {
                        if next != 0 {
                            next = (last + r.se()? + 256) % 256;
                        }
                        if next != 0 {
                            last = next;
                        }
                    }
                }
            }
        }
    }

    r.ue()?; // log2_max_frame_num_minus4
    match r.ue()? {
        0 => {
            r.ue()?;
        }
        1 => {
            r.bit()?;
            r.se()?;
            r.se()?;
            for _ in 0..r.ue()? {
                r.se()?;
            }
        }
        _ => {}
    }
    r.ue()?; // max_num_ref_frames
    r.bit()?; // gaps_in_frame_num_value_allowed_flag

    let width_mbs = r.ue()? + 1;
    let height_map_units = r.ue()? + 1;
    let frame_mbs_only = r.bit()?;
    if frame_mbs_only == 0 {
        r.bit()?;
    }
    r.bit()?; // direct_8x8_inference_flag

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if r.bit()? == 1 {
        crop_left = r.ue()?;
        crop_right = r.ue()?;
        crop_top = r.ue()?;
        crop_bottom = r.ue()?;
    }

    let (crop_unit_x, crop_unit_y) = match chroma_format_idc {
        0 => (1, 2 - frame_mbs_only),
        1 => (2, 2 * (2 - frame_mbs_only)),
        2 => (2, 2 - frame_mbs_only),
        _ => (1, 2 - frame_mbs_only),
    };

    let width = (width_mbs * 16).checked_sub(crop_unit_x * (crop_left + crop_right))?;
    let height = ((2 - frame_mbs_only) * height_map_units * 16)
        .checked_sub(crop_unit_y * (crop_top + crop_bottom))?;
    Some((width, height))
}
