#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReduceError {
    #[error("Cannot average an empty window (0 samples per channel)")]
    EmptyWindow,

    #[error("Channel {channel} is out of range for {channel_count} channels")]
    ChannelOutOfRange { channel: usize, channel_count: usize },

    #[error("Block holds {actual} values but the geometry needs {required}")]
    BlockTooShort { required: usize, actual: usize },
}

/// Mean of the `samples_per_channel` values of `channel` in a block laid out
/// channel-major, i.e. channel `c` at `[c * n, (c + 1) * n)`.
pub fn reduce(
    block: &[f64],
    channel_count: usize,
    samples_per_channel: usize,
    channel: usize,
) -> Result<f64, ReduceError> {
    if samples_per_channel == 0 {
        return Err(ReduceError::EmptyWindow);
    }
    if channel >= channel_count {
        return Err(ReduceError::ChannelOutOfRange {
            channel,
            channel_count,
        });
    }
    let required = channel_count.saturating_mul(samples_per_channel);
    if block.len() < required {
        return Err(ReduceError::BlockTooShort {
            required,
            actual: block.len(),
        });
    }

    let start = channel * samples_per_channel;
    let sum: f64 = block[start..start + samples_per_channel].iter().sum();
    Ok(sum / samples_per_channel as f64)
}

/// Fill `averages` with the mean of every channel. `averages.len()` is the
/// channel count.
pub fn reduce_all(
    block: &[f64],
    samples_per_channel: usize,
    averages: &mut [f64],
) -> Result<(), ReduceError> {
    let channel_count = averages.len();
    for (channel, average) in averages.iter_mut().enumerate() {
        *average = reduce(block, channel_count, samples_per_channel, channel)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_block() {
        let block = vec![2.5; 4 * 200];
        for channel in 0..4 {
            assert_eq!(reduce(&block, 4, 200, channel).unwrap(), 2.5);
        }

        let block = vec![3.3; 4 * 200];
        for channel in 0..4 {
            let avg = reduce(&block, 4, 200, channel).unwrap();
            assert!((avg - 3.3).abs() < 1e-12);
        }
    }

    #[test]
    fn test_linear_samples() {
        // Channel 1 holds [1, 2, 3, 4]
        let block = [0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(reduce(&block, 2, 4, 1).unwrap(), 2.5);
        assert_eq!(reduce(&block, 2, 4, 0).unwrap(), 0.0);
    }

    #[test]
    fn test_channel_major_segments() {
        let block = [1.0, 1.0, 5.0, 7.0, -2.0, -4.0];
        let mut averages = [0.0; 3];
        reduce_all(&block, 2, &mut averages).unwrap();
        assert_eq!(averages, [1.0, 6.0, -3.0]);
    }

    #[test]
    fn test_rejects_empty_window() {
        assert_eq!(reduce(&[1.0, 2.0], 2, 0, 0), Err(ReduceError::EmptyWindow));
        let mut averages = [0.0; 2];
        assert_eq!(
            reduce_all(&[], 0, &mut averages),
            Err(ReduceError::EmptyWindow)
        );
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let block = [0.0; 8];
        assert_eq!(
            reduce(&block, 2, 4, 2),
            Err(ReduceError::ChannelOutOfRange {
                channel: 2,
                channel_count: 2
            })
        );
        assert_eq!(
            reduce(&block, 4, 4, 0),
            Err(ReduceError::BlockTooShort {
                required: 16,
                actual: 8
            })
        );
    }
}
