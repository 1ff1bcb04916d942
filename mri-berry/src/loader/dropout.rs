//! 输入通道 dropout.
//!
//! 训练/评估缺失模态鲁棒性时, 在组 batch 阶段随机清零一部分输入通道.

use log::warn;
use ndarray::Axis;
use rand::Rng;

use super::SegSample;

/// 通道是否为常值 (即不携带信号).
fn is_constant(sample: &SegSample, channel: usize) -> bool {
    let view = sample.input.index_axis(Axis(0), channel);
    let mut it = view.iter();
    match it.next() {
        Some(&first) => it.all(|&v| v == first),
        None => true,
    }
}

/// 随机清零样本的部分输入通道.
///
/// 清零个数在 `[0, n_channels - 1]` 内随机选取, 永远保留至少一个非空
/// 通道. 已为常值的通道优先计入清零配额, 额外的随机清零只从仍携带
/// 信号的通道中抽取, 以免配额被浪费在本就为空的通道上.
///
/// 单通道样本是无操作, 仅记录一条诊断日志.
pub fn dropout_input<R: Rng>(sample: &mut SegSample, rng: &mut R) {
    let n_channels = sample.input.shape()[0];
    if n_channels <= 1 {
        warn!("Impossible to apply input-level dropout since input is not multi-channel.");
        return;
    }

    let empty: Vec<usize> = (0..n_channels)
        .filter(|&c| is_constant(sample, c))
        .collect();

    // 清零通道数, 含已空通道; 至少保留一个输入.
    let n_dropped = rng.gen_range(0..n_channels);

    if n_dropped > empty.len() {
        // 已空通道抵扣配额后, 剩余名额从携带信号的通道中随机抽取.
        let extra = n_dropped - empty.len();
        debug_assert!(extra + empty.len() < n_channels);

        let mut chosen: Vec<usize> = Vec::with_capacity(extra);
        while chosen.len() < extra {
            let idx = rng.gen_range(0..n_channels);
            if !empty.contains(&idx) && !chosen.contains(&idx) {
                chosen.push(idx);
            }
        }
        for c in chosen {
            sample.input.index_axis_mut(Axis(0), c).fill(0.0);
        }
    }
    // n_dropped <= 已空通道数时无事可做: 清零空通道是无操作.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SliceAxis;
    use crate::loader::SampleMeta;
    use ndarray::{Array, Axis, IxDyn};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// 构造携带真实信号的多通道样本: 非空通道内像素取值各不相同,
    /// 不会被误判为常值通道.
    fn sample(channels: usize, empty_channels: &[usize]) -> SegSample {
        let mut input = Array::from_shape_fn(IxDyn(&[channels, 4, 4]), |ix| {
            (ix[0] * 16 + ix[1] * 4 + ix[2] + 1) as f32
        });
        for &c in empty_channels {
            input.index_axis_mut(Axis(0), c).fill(0.0);
        }
        SegSample {
            input,
            gt: None,
            missing_mask: vec![true; channels],
            meta: SampleMeta {
                input_filenames: vec![],
                gt_filenames: vec![],
                slice_index: 0,
                slice_axis: SliceAxis::Axial,
                pix_dim: [1.0; 3],
                patch_origin: None,
            },
        }
    }

    fn count_zero_channels(s: &SegSample) -> usize {
        let n = s.input.shape()[0];
        (0..n)
            .filter(|&c| s.input.index_axis(Axis(0), c).iter().all(|&v| v == 0.0))
            .count()
    }

    /// 不变式: 清零通道数在 [0, C-1] 内, 永远保留至少一个非零通道.
    #[test]
    fn test_dropout_invariants() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen_drop = false;
        for _ in 0..200 {
            let mut s = sample(4, &[]);
            dropout_input(&mut s, &mut rng);
            let zeros = count_zero_channels(&s);
            assert!(zeros < 4, "不允许清零全部通道");
            seen_drop |= zeros > 0;
        }
        // 配额不恒为 0: 200 次试验中必然有通道真正被清零.
        assert!(seen_drop);
    }

    /// 场景: 4 通道, 通道 2 已空, 共需清零 3 个通道.
    #[test]
    fn test_dropout_with_empty_channel() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen_three = false;
        for _ in 0..400 {
            let mut s = sample(4, &[2]);
            dropout_input(&mut s, &mut rng);
            let zeros = count_zero_channels(&s);
            // 通道 2 恒为空.
            assert!(s.input.index_axis(Axis(0), 2).iter().all(|&v| v == 0.0));
            assert!(zeros <= 3, "永远不允许 4 个通道全空");
            seen_three |= zeros == 3;
        }
        // 400 次试验中 n_dropped = 3 几乎必然出现过.
        assert!(seen_three);
    }

    #[test]
    fn test_single_channel_noop() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut s = sample(1, &[]);
        dropout_input(&mut s, &mut rng);
        assert_eq!(count_zero_channels(&s), 0);
    }
}
