//! Bitstream helpers for the two supported codecs.

pub mod aac;
pub mod h264;
