//! 3D 子体块索引器.
//!
//! 给定体数据形状、patch 形状与步长, 计算确定性的、行优先
//! (最后轴最快) 的 patch 原点序列. 重建依赖该顺序与抽取顺序一致,
//! 因此序列必须稳定.

use itertools::iproduct;

use crate::Idx3d;

/// 单轴上的 patch 原点序列.
///
/// 从 0 开始按 `stride` 前进; 当下一步加 `patch_len` 会越过 `dim` 时,
/// 末端原点回拉到 `dim - patch_len` (overlap-adjust), 保证全覆盖且
/// 不产生越界读. 代价是该轴最后两个 patch 的重叠可能超过 `stride`.
///
/// 当 `patch_len >= dim` 时退化为单原点 `[0]`, 剩余部分由读取方填充.
///
/// `patch_len` 和 `stride` 必须为正, 否则程序 panic.
pub(crate) fn axis_origins(dim: usize, patch_len: usize, stride: usize) -> Vec<usize> {
    assert!(patch_len > 0, "patch 边长必须为正");
    assert!(stride > 0, "stride 必须为正");
    assert!(dim > 0, "体数据维度必须为正");

    if patch_len >= dim {
        return vec![0];
    }

    let last = dim - patch_len;
    let mut origins = Vec::with_capacity(dim / stride + 2);
    let mut k = 0usize;
    loop {
        let origin = stride * k;
        if origin >= last {
            origins.push(last);
            return origins;
        }
        origins.push(origin);
        k += 1;
    }
}

/// 计算覆盖 `volume` 的全部 patch 原点, 行优先 (最后轴最快).
///
/// 每个轴独立应用 [`axis_origins`] 的回拉规则. 返回序列中任何原点
/// `o` 均满足 `o + min(patch, volume) <= volume` (逐轴).
pub fn compute_patch_origins(volume: Idx3d, patch: Idx3d, stride: Idx3d) -> Vec<Idx3d> {
    let zs = axis_origins(volume.0, patch.0, stride.0);
    let hs = axis_origins(volume.1, patch.1, stride.1);
    let ws = axis_origins(volume.2, patch.2, stride.2);

    iproduct!(zs.into_iter(), hs.into_iter(), ws.into_iter()).collect()
}
