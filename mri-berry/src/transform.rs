//! 变换流水线的协作者接口.
//!
//! 实际的重采样/裁剪/增广实现不在本 crate 范围内. 数据集在取样时正向应用
//! 流水线, 重建器在 flush 时按切片携带的元数据逆向撤销; 两端只依赖这里的
//! trait.

use ndarray::Array2;

use crate::loader::SampleMeta;

/// 样本级 2D 变换流水线.
///
/// 实现者必须保证 `undo(apply(x, m), m) == x` 在其声明可逆的范围内成立,
/// 否则重建出的体数据与参考图像不对齐.
pub trait SampleTransform {
    /// 对一个 2D 切片正向应用流水线. `meta` 为该切片的元数据,
    /// 实现者可借助其中的分辨率等信息.
    fn apply(&self, slice: Array2<f32>, meta: &SampleMeta) -> Array2<f32>;

    /// 撤销流水线. `meta` 必须是正向应用时的同一份元数据.
    fn undo(&self, slice: Array2<f32>, meta: &SampleMeta) -> Array2<f32>;

    /// 流水线是否包含 ROI 裁剪.
    ///
    /// 若为 `false`, 数据集分派器会强制关闭基于 ROI 的切片过滤:
    /// 不裁剪而按 ROI 过滤会错误地丢弃合法切片.
    fn crops_to_roi(&self) -> bool {
        false
    }
}

/// 恒等变换. 推理流程不需要增广时使用.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransform;

impl SampleTransform for NoTransform {
    #[inline]
    fn apply(&self, slice: Array2<f32>, _meta: &SampleMeta) -> Array2<f32> {
        slice
    }

    #[inline]
    fn undo(&self, slice: Array2<f32>, _meta: &SampleMeta) -> Array2<f32> {
        slice
    }
}
