//! Adaptive decorrelation passes.
//!
//! Each pass predicts a sample from recent history and replaces it with
//! the prediction error, steering an adaptive weight by +/- delta per
//! sample. Positive terms 1..=8 predict from the sample `term` positions
//! back, terms 17 and 18 extrapolate from the previous two samples, and
//! negative terms -1..=-3 predict one channel from the other. Passes run
//! in reverse list order, and each pass's trailing output samples are
//! wrapped into its seed history for the next block.

use crate::core::WEIGHT_MAXIMUM;

const WEIGHT_MINIMUM: i32 = -WEIGHT_MAXIMUM;

pub(crate) fn apply_weight(weight: i32, sample: i64) -> i32 {
    ((weight as i64 * sample + 512) >> 10) as i32
}

pub(crate) fn update_weight(source: i64, result: i32, delta: i32) -> i32 {
    if source == 0 || result == 0 {
        0
    } else if (source ^ result as i64) >= 0 {
        delta
    } else {
        -delta
    }
}

fn clamp_weight(weight: i32) -> i32 {
    weight.clamp(WEIGHT_MINIMUM, WEIGHT_MAXIMUM)
}

/// Seed history length a term requires per channel.
pub fn term_history_len(term: i32) -> usize {
    match term {
        17 | 18 => 2,
        1..=8 => term as usize,
        -3..=-1 => 1,
        other => panic!("unsupported decorrelation term {}", other),
    }
}

/// Cached decorrelation and entropy state for one block position within
/// a frame, carried from block to block.
#[derive(Debug, Clone, Default)]
pub struct SlotState {
    pub channel_count: usize,
    pub terms: Vec<i32>,
    pub deltas: Vec<i32>,
    pub weights_a: Vec<i32>,
    pub weights_b: Vec<i32>,
    pub samples_a: Vec<Vec<i32>>,
    pub samples_b: Vec<Vec<i32>>,
    pub medians_a: [i32; 3],
    pub medians_b: [i32; 3],
}

impl SlotState {
    /// Fresh state with the default term topology for a pass count.
    /// Stereo blocks mix in cross-channel terms; mono blocks never
    /// carry them.
    pub fn default_topology(passes: usize, channel_count: usize) -> SlotState {
        let terms: Vec<i32> = match (passes, channel_count) {
            (0, _) => vec![],
            (1, _) => vec![18],
            (2, _) => vec![17, 18],
            (5, _) => vec![3, 17, 2, 18, 18],
            (10, 2) => vec![4, 17, -1, 5, 3, 2, -2, 18, 18, 18],
            (16, 2) => vec![2, 18, -1, 8, 6, 3, 5, 7, 4, 2, 18, -2, 3, 2, 18, 18],
            (n, c) => panic!("unsupported topology: {} passes, {} channels", n, c),
        };
        let deltas = vec![2; terms.len()];
        let weights = vec![0; terms.len()];
        let samples: Vec<Vec<i32>> = terms
            .iter()
            .map(|&term| vec![0; term_history_len(term)])
            .collect();
        SlotState {
            channel_count,
            deltas,
            weights_a: weights.clone(),
            weights_b: if channel_count == 2 { weights } else { vec![] },
            samples_a: samples.clone(),
            samples_b: if channel_count == 2 { samples } else { vec![] },
            terms,
            medians_a: [0; 3],
            medians_b: [0; 3],
        }
    }
}

/// Runs decorrelation passes, reusing internal scratch buffers between
/// calls.
#[derive(Debug, Default)]
pub struct Decorrelator {
    input_a: Vec<i32>,
    input_b: Vec<i32>,
}

fn single_channel_pass(
    input: &mut Vec<i32>,
    channel: &mut Vec<i32>,
    term: i32,
    delta: i32,
    weight: &mut i32,
    seeds: &[i32],
) {
    input.clear();
    input.extend_from_slice(seeds);
    input.append(channel);

    let mut w = *weight;
    for i in seeds.len()..input.len() {
        let temp: i64 = match term {
            18 => (3 * input[i - 1] as i64 - input[i - 2] as i64) >> 1,
            17 => 2 * input[i - 1] as i64 - input[i - 2] as i64,
            1..=8 => input[i - term as usize] as i64,
            other => panic!("unsupported single-channel term {}", other),
        };
        let residual = input[i].wrapping_sub(apply_weight(w, temp));
        channel.push(residual);
        w = clamp_weight(w + update_weight(temp, residual, delta));
    }
    *weight = w;
}

impl Decorrelator {
    pub fn new() -> Decorrelator {
        Decorrelator::default()
    }

    /// Applies one pass in place. `channel_b` is ignored for mono input.
    #[allow(clippy::too_many_arguments)]
    pub fn perform_pass(
        &mut self,
        term: i32,
        delta: i32,
        channel_a: &mut Vec<i32>,
        channel_b: &mut Vec<i32>,
        weight_a: &mut i32,
        weight_b: &mut i32,
        seeds_a: &[i32],
        seeds_b: &[i32],
        channel_count: usize,
    ) {
        debug_assert!(channel_count == 1 || channel_count == 2);

        if channel_count == 1 {
            assert!(term > 0, "cross-channel term {} in a mono block", term);
            single_channel_pass(&mut self.input_a, channel_a, term, delta, weight_a, seeds_a);
            return;
        }

        if term >= 1 {
            single_channel_pass(&mut self.input_a, channel_a, term, delta, weight_a, seeds_a);
            single_channel_pass(&mut self.input_b, channel_b, term, delta, weight_b, seeds_b);
            return;
        }

        let input_a = &mut self.input_a;
        let input_b = &mut self.input_b;
        input_a.clear();
        input_a.extend_from_slice(seeds_a);
        input_a.append(channel_a);
        input_b.clear();
        input_b.extend_from_slice(seeds_b);
        input_b.append(channel_b);

        let mut w_a = *weight_a;
        let mut w_b = *weight_b;
        for i in seeds_a.len()..input_a.len() {
            let (temp_a, temp_b) = match term {
                -1 => (input_b[i - 1] as i64, input_a[i] as i64),
                -2 => (input_b[i] as i64, input_a[i - 1] as i64),
                -3 => (input_b[i - 1] as i64, input_a[i - 1] as i64),
                other => panic!("unsupported cross-channel term {}", other),
            };

            let residual_a = input_a[i].wrapping_sub(apply_weight(w_a, temp_a));
            channel_a.push(residual_a);
            w_a = clamp_weight(w_a + update_weight(temp_a, residual_a, delta));

            let residual_b = input_b[i].wrapping_sub(apply_weight(w_b, temp_b));
            channel_b.push(residual_b);
            w_b = clamp_weight(w_b + update_weight(temp_b, residual_b, delta));
        }
        *weight_a = w_a;
        *weight_b = w_b;
    }
}

fn tail(seeds: &[i32], output: &[i32], count: usize) -> Vec<i32> {
    // short blocks fall back on prior history to keep the seed length
    let mut combined: Vec<i32> = seeds.iter().chain(output.iter()).copied().collect();
    combined.split_off(combined.len().saturating_sub(count))
}

/// Replaces a pass's seed history with the trailing samples of its
/// output, for use by the next block.
pub fn wrap_samples(
    seeds_a: &mut Vec<i32>,
    seeds_b: &mut Vec<i32>,
    term: i32,
    channel_a: &[i32],
    channel_b: &[i32],
    channel_count: usize,
) {
    let count = term_history_len(term);
    *seeds_a = tail(seeds_a, channel_a, count);
    if channel_count > 1 {
        *seeds_b = tail(seeds_b, channel_b, count);
    }
}
