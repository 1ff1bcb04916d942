//! 解剖切片轴.

use crate::Idx2d;
use crate::Idx3d;
use ndarray::Axis;

/// 3D 体数据分解为 2D 切片时所沿的解剖轴.
///
/// 磁盘上的 nifti 数据按 `(w, h, z)` 组织 (RAS 惯例下 axial=2,
/// sagittal=0, coronal=1); 本 crate 的规范内存布局是 `(z, h, w)`,
/// 因此内存轴下标为 `2 - 磁盘轴下标`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SliceAxis {
    /// 水平 (横断) 面.
    Axial,

    /// 矢状面.
    Sagittal,

    /// 冠状面.
    Coronal,
}

impl SliceAxis {
    /// 磁盘 `(w, h, z)` 维度下标.
    #[inline]
    pub const fn disk_axis(self) -> usize {
        match self {
            Self::Sagittal => 0,
            Self::Coronal => 1,
            Self::Axial => 2,
        }
    }

    /// 规范内存布局 `(z, h, w)` 下的 ndarray 轴.
    #[inline]
    pub const fn canonical_axis(self) -> Axis {
        Axis(2 - self.disk_axis())
    }

    /// 从配置字符串解析. 大小写敏感, 未知取值返回 `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "axial" => Some(Self::Axial),
            "sagittal" => Some(Self::Sagittal),
            "coronal" => Some(Self::Coronal),
            _ => None,
        }
    }

    /// 配置字符串形式.
    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Axial => "axial",
            Self::Sagittal => "sagittal",
            Self::Coronal => "coronal",
        }
    }

    /// 沿该轴切片时, 规范布局体数据 `shape` 的切片个数.
    #[inline]
    pub fn len_along(self, shape: Idx3d) -> usize {
        let (z, h, w) = shape;
        [z, h, w][self.canonical_axis().index()]
    }

    /// 沿该轴切片时, 单张 2D 切片的形状 (移除切片轴后剩余两维, 保持原序).
    pub fn plane_shape(self, shape: Idx3d) -> Idx2d {
        let (z, h, w) = shape;
        match self.canonical_axis().index() {
            0 => (h, w),
            1 => (z, w),
            2 => (z, h),
            _ => unreachable!(),
        }
    }
}
