use std::io::Cursor;

use log::warn;

/// Percentages are expressed in millionths, so 100% is one million.
pub const MAX_PERCENTAGE: u32 = 1_000_000;

/// Maps a percentage key onto a bucket in `0..MAX_PERCENTAGE`.
///
/// Implementations must be pure: the same inputs always produce the same bucket, and every SDK
/// evaluating the same feature must agree on it.
pub trait PercentageCalculator: Send + Sync {
    fn determine_client_percentage(&self, percentage_key: &str, feature_value_id: &str) -> u32;
}

/// MurmurHash3 (x86, 32 bit, seed 0) over the key followed by the feature value id, scaled onto
/// the percentage range. This is the bucketing the FeatureHub server and other SDKs use.
#[derive(Clone, Copy, Debug, Default)]
pub struct Murmur3PercentageCalculator;

impl PercentageCalculator for Murmur3PercentageCalculator {
    fn determine_client_percentage(&self, percentage_key: &str, feature_value_id: &str) -> u32 {
        let mut text = String::with_capacity(percentage_key.len() + feature_value_id.len());
        text.push_str(percentage_key);
        text.push_str(feature_value_id);

        match murmur3::murmur3_32(&mut Cursor::new(text.as_bytes()), 0) {
            Ok(hash) => scale(hash),
            Err(e) => {
                // reading from memory cannot fail, but if it does the key lands past every slice
                warn!("unable to hash percentage key {}: {}", percentage_key, e);
                MAX_PERCENTAGE
            }
        }
    }
}

fn scale(hash: u32) -> u32 {
    ((hash as u64 * MAX_PERCENTAGE as u64) >> 32) as u32
}
