//! Writes a short H.264 + AAC transport stream.

use super::{PPS, SPS};

const PACKET_SIZE: usize = 188;
const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x100;
pub const AUDIO_PID: u16 = 0x101;

const VIDEO_FRAME_TICKS: u64 = 3600;
const AUDIO_RATE: u64 = 44100;

#[derive(Debug, Clone, Copy)]
pub struct TsOptions {
    pub video_frames: usize,
    /// An IDR every this many frames.
    pub gop: usize,
    pub audio: bool,
}

impl Default for TsOptions {
    fn default() -> Self {
        Self {
            video_frames: 50,
            gop: 10,
            audio: true,
        }
    }
}

#[derive(Default)]
struct Muxer {
    out: Vec<u8>,
    counters: std::collections::HashMap<u16, u8>,
}

impl Muxer {
    fn continuity(&mut self, pid: u16) -> u8 {
        let counter = self.counters.entry(pid).or_insert(0);
        let value = *counter;
        *counter = (*counter + 1) & 0x0f;
        value
    }

    /// Splits `payload` over packets of `pid`, stuffing the last one.
    fn write(&mut self, pid: u16, payload: &[u8]) {
        let mut rest = payload;
        let mut first = true;
        while first || !rest.is_empty() {
            let take = rest.len().min(PACKET_SIZE - 4);
            let (chunk, tail) = rest.split_at(take);
            let cc = self.continuity(pid);

            let mut packet = Vec::with_capacity(PACKET_SIZE);
            packet.push(0x47);
            let start = if first { 0x40 } else { 0x00 };
            packet.push(start | ((pid >> 8) as u8 & 0x1f));
            packet.push(pid as u8);
            if chunk.len() == PACKET_SIZE - 4 {
                packet.push(0x10 | cc);
            } else {
                packet.push(0x30 | cc);
                let adaptation_len = PACKET_SIZE - 5 - chunk.len();
                packet.push(adaptation_len as u8);
                if adaptation_len > 0 {
                    packet.push(0x00);
                    packet.resize(PACKET_SIZE - chunk.len(), 0xff);
                }
            }
            packet.extend_from_slice(chunk);
            assert_eq!(packet.len(), PACKET_SIZE);
            self.out.extend_from_slice(&packet);

            rest = tail;
            first = false;
        }
    }

    fn section(&mut self, pid: u16, table_id: u8, id: u16, body: &[u8]) {
        let length = 5 + body.len() + 4;
        let mut section = vec![
            0x00, // pointer field
            table_id,
            0xb0 | (length >> 8) as u8,
            length as u8,
            (id >> 8) as u8,
            id as u8,
            0xc1,
            0x00,
            0x00,
        ];
        section.extend_from_slice(body);
        let crc = crc32_mpeg2(&section[1..]);
        section.extend_from_slice(&crc.to_be_bytes());
        self.write(pid, &section);
    }

    fn tables(&mut self, audio: bool) {
        self.section(
            0,
            0x00,
            1,
            &[0x00, 0x01, 0xe0 | (PMT_PID >> 8) as u8, PMT_PID as u8],
        );

        let mut pmt = vec![0xe0 | (VIDEO_PID >> 8) as u8, VIDEO_PID as u8, 0xf0, 0x00];
        pmt.extend_from_slice(&[0x1b, 0xe0 | (VIDEO_PID >> 8) as u8, VIDEO_PID as u8, 0xf0, 0x00]);
        if audio {
            pmt.extend_from_slice(&[0x0f, 0xe0 | (AUDIO_PID >> 8) as u8, AUDIO_PID as u8, 0xf0, 0x00]);
        }
        self.section(PMT_PID, 0x02, 1, &pmt);
    }

    fn pes(&mut self, pid: u16, stream_id: u8, pts: u64, dts: Option<u64>, data: &[u8]) {
        let mut pes = vec![0x00, 0x00, 0x01, stream_id];
        let header_len = if dts.is_some() { 10 } else { 5 };
        let length = 3 + header_len + data.len();
        // video PES may leave the length open
        let length = if stream_id >= 0xe0 || length > 0xffff {
            0
        } else {
            length
        };
        pes.extend_from_slice(&(length as u16).to_be_bytes());
        pes.push(0x80);
        match dts {
            Some(dts) => {
                pes.push(0xc0);
                pes.push(10);
                pes.extend_from_slice(&timestamp(0x3, pts));
                pes.extend_from_slice(&timestamp(0x1, dts));
            }
            None => {
                pes.push(0x80);
                pes.push(5);
                pes.extend_from_slice(&timestamp(0x2, pts));
            }
        }
        pes.extend_from_slice(data);
        self.write(pid, &pes);
    }
}

fn timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    [
        (prefix << 4) | (((ts >> 30) & 0x07) as u8) << 1 | 1,
        (ts >> 22) as u8,
        (((ts >> 15) & 0x7f) as u8) << 1 | 1,
        (ts >> 7) as u8,
        ((ts & 0x7f) as u8) << 1 | 1,
    ]
}

fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for byte in data {
        crc ^= (*byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04c1_1db7
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn access_unit(key: bool, frame: usize) -> Vec<u8> {
    let mut au = vec![0, 0, 0, 1, 0x09, 0xf0];
    if key {
        au.extend_from_slice(&[0, 0, 0, 1]);
        au.extend_from_slice(SPS);
        au.extend_from_slice(&[0, 0, 0, 1]);
        au.extend_from_slice(PPS);
        au.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x84]);
    } else {
        au.extend_from_slice(&[0, 0, 0, 1, 0x41, 0x9a]);
    }
    // filler without start code emulation
    au.extend(std::iter::repeat(0xa0 | (frame % 16) as u8).take(if key { 600 } else { 120 }));
    au
}

fn adts_frame(frame: usize) -> Vec<u8> {
    let payload = [0x21, 0x10 | (frame % 16) as u8, 0x04, 0x60, 0x8c, 0x1c];
    let len = payload.len() + 7;
    let mut out = vec![
        0xff,
        0xf1,
        0x50,
        0x80 | ((len >> 11) & 0x03) as u8,
        ((len >> 3) & 0xff) as u8,
        (((len & 0x07) << 5) | 0x1f) as u8,
        0xfc,
    ];
    out.extend_from_slice(&payload);
    out
}

/// A complete stream: tables first, then video and audio interleaved by
/// decode time.
pub fn stream(options: TsOptions) -> Vec<u8> {
    let mut muxer = Muxer::default();
    muxer.tables(options.audio);

    let start = 126_000u64;
    let end = options.video_frames as u64 * VIDEO_FRAME_TICKS;
    let mut video = 0usize;
    let mut audio = 0usize;
    loop {
        let video_ticks = video as u64 * VIDEO_FRAME_TICKS;
        let audio_ticks = audio as u64 * 1024 * 90_000 / AUDIO_RATE;
        let video_left = video < options.video_frames;
        let audio_left = options.audio && audio_ticks < end;
        if !video_left && !audio_left {
            break;
        }

        if video_left && (!audio_left || video_ticks <= audio_ticks) {
            let key = video % options.gop == 0;
            let dts = start + video_ticks;
            // one frame of reordering delay
            muxer.pes(
                VIDEO_PID,
                0xe0,
                dts + VIDEO_FRAME_TICKS,
                Some(dts),
                &access_unit(key, video),
            );
            video += 1;
        } else {
            muxer.pes(AUDIO_PID, 0xc0, start + audio_ticks, None, &adts_frame(audio));
            audio += 1;
        }
    }
    muxer.out
}
