//! Choosing the output sample rate and bitrate from what the inputs offer.

use strum_macros::Display;

use crate::probe::Track;

pub const HIGH_SAMPLE_RATE: u32 = 48_000;
pub const MID_SAMPLE_RATE: u32 = 44_100;

/// Rates the encoder is asked for when the inputs are below the mid tier.
pub const SAMPLE_RATE_PREFERENCE: &[u32] = &[
    48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
];

/// Input bitrate (kbps) from which the high quality tier is used.
pub const HIGH_QUALITY_THRESHOLD_KBPS: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[strum(serialize_all = "lowercase")]
pub enum QualityTier {
    Standard,
    High,
}

impl QualityTier {
    /// Target bitrate of the tier in kbps.
    pub fn target_kbps(self) -> u32 {
        match self {
            QualityTier::Standard => 72,
            QualityTier::High => 112,
        }
    }
}

/// Encode target shared by every part of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub quality: QualityTier,
    /// Bitrate handed to the encoder, in kbps.
    pub bitrate_kbps: u32,
}

/// Picks an output format that never exceeds what the inputs provide.
///
/// `sample_rates` are in Hz, `bitrates_kbps` in kbps; both may contain
/// duplicates.
pub fn select_format(sample_rates: &[u32], bitrates_kbps: &[u32]) -> OutputFormat {
    let min_rate = sample_rates.iter().copied().filter(|&r| r > 0).min();
    let max_rate = sample_rates.iter().copied().filter(|&r| r > 0).max();

    let sample_rate = match (min_rate, max_rate) {
        (Some(min), _) if min >= HIGH_SAMPLE_RATE => HIGH_SAMPLE_RATE,
        (_, Some(max)) if max >= MID_SAMPLE_RATE => MID_SAMPLE_RATE,
        (_, Some(max)) => SAMPLE_RATE_PREFERENCE
            .iter()
            .copied()
            .find(|&r| r <= max)
            .unwrap_or(max),
        _ => MID_SAMPLE_RATE,
    };

    let max_kbps = bitrates_kbps.iter().copied().filter(|&b| b > 0).max();
    let quality = match max_kbps {
        Some(b) if b >= HIGH_QUALITY_THRESHOLD_KBPS => QualityTier::High,
        _ => QualityTier::Standard,
    };
    let bitrate_kbps = match max_kbps {
        Some(b) => quality.target_kbps().min(b),
        None => quality.target_kbps(),
    };

    OutputFormat {
        sample_rate,
        quality,
        bitrate_kbps,
    }
}

/// Runs [`select_format`] over probed tracks.
pub fn select_for_tracks(tracks: &[Track]) -> OutputFormat {
    let mut rates: Vec<u32> = tracks.iter().filter_map(|t| t.sample_rate).collect();
    rates.sort_unstable();
    rates.dedup();
    let mut kbps: Vec<u32> = tracks
        .iter()
        .filter_map(|t| t.bit_rate)
        .map(|b| (b / 1000) as u32)
        .collect();
    kbps.sort_unstable();
    kbps.dedup();
    select_format(&rates, &kbps)
}
