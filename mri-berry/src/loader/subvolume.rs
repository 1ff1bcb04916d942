//! 3D 子体块数据集.
//!
//! 每个文件名配对加载为完整体数据并常驻内存, 样本是按确定性原点序列
//! 抽取的子体块. 原点序列由 [`super::compute_patch_origins`] 给出,
//! 抽取顺序与之一致, 重建时据此放回.

use std::sync::Arc;

use ndarray::{s, stack, Array3, Array4, ArrayView3, Axis};

use super::pairs::{FilenamePair, PairRegistry};
use super::patch::compute_patch_origins;
use super::{open_pair, LoaderError, SampleMeta, SegSample};
use crate::data::SliceAxis;
use crate::Idx3d;

/// 一个常驻内存的配对体数据.
struct VolumeEntry {
    pair: Arc<FilenamePair>,
    inputs: Vec<Array3<f32>>,
    gts: Vec<Array3<f32>>,
    pix_dim: [f64; 3],
    shape: Idx3d,
}

/// 索引中的一个子体块.
struct PatchEntry {
    volume: usize,
    origin: Idx3d,
}

/// 3D 子体块数据集.
///
/// 2D 变换流水线不参与 3D 路径; 子体块按原值返回,
/// 重建时直接放回原点, 无需撤销.
pub struct SubVolumeDataset {
    volumes: Vec<VolumeEntry>,
    index: Vec<PatchEntry>,
    patch: Idx3d,
    stride: Idx3d,
    soft_gt: bool,
}

/// 从 `vol` 的 `origin` 处抽取形状为 `patch` 的子体块.
///
/// 体数据在某轴上小于 patch 边长时 (退化原点 0), 越出部分补零.
fn extract_patch(vol: &ArrayView3<f32>, origin: Idx3d, patch: Idx3d) -> Array3<f32> {
    let (oz, oh, ow) = origin;
    let (dz, dh, dw) = vol.dim();
    let (pz, ph, pw) = patch;

    let ez = pz.min(dz - oz);
    let eh = ph.min(dh - oh);
    let ew = pw.min(dw - ow);

    let mut out = Array3::zeros(patch);
    out.slice_mut(s![..ez, ..eh, ..ew])
        .assign(&vol.slice(s![oz..oz + ez, oh..oh + eh, ow..ow + ew]));
    out
}

impl SubVolumeDataset {
    pub(crate) fn build(
        registry: &PairRegistry,
        patch: Idx3d,
        stride: Idx3d,
        soft_gt: bool,
    ) -> Result<Self, LoaderError> {
        let mut volumes = Vec::with_capacity(registry.len());
        let mut index = Vec::new();

        for pair in registry.pairs() {
            let opened = open_pair(pair)?;
            let inputs: Vec<Array3<f32>> = opened
                .inputs
                .into_iter()
                .flatten()
                .map(|v| v.into_parts().1)
                .collect();
            let gts: Vec<Array3<f32>> = opened.gts.into_iter().map(|v| v.into_parts().1).collect();

            let volume = volumes.len();
            for origin in compute_patch_origins(opened.shape, patch, stride) {
                index.push(PatchEntry { volume, origin });
            }
            volumes.push(VolumeEntry {
                pair: Arc::clone(pair),
                inputs,
                gts,
                pix_dim: opened.pix_dim,
                shape: opened.shape,
            });
        }

        if index.is_empty() {
            return Err(LoaderError::EmptyDataset);
        }
        Ok(Self {
            volumes,
            index,
            patch,
            stride,
            soft_gt,
        })
    }

    /// 样本 (子体块) 个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// 数据集是否为空. 构建成功的数据集恒非空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// patch 形状.
    #[inline]
    pub fn patch(&self) -> Idx3d {
        self.patch
    }

    /// 步长.
    #[inline]
    pub fn stride(&self) -> Idx3d {
        self.stride
    }

    /// 真值是否保持软 (连续) 取值.
    #[inline]
    pub fn soft_gt(&self) -> bool {
        self.soft_gt
    }

    /// 单样本形状 (通道数, z, h, w).
    pub fn sample_shape(&self) -> Vec<usize> {
        let (pz, ph, pw) = self.patch;
        vec![self.volumes[0].inputs.len(), pz, ph, pw]
    }

    /// 第 `index` 个样本所属体数据的原始形状. 越界时程序 panic.
    pub fn volume_shape(&self, index: usize) -> Idx3d {
        self.volumes[self.index[index].volume].shape
    }

    /// 获取第 `index` 个样本. 越界时程序 panic.
    pub fn get(&self, index: usize) -> SegSample {
        let entry = &self.index[index];
        let vol = &self.volumes[entry.volume];

        let input = Self::stack_patches(&vol.inputs, entry.origin, self.patch);
        let gt = if vol.gts.is_empty() {
            None
        } else {
            Some(Self::stack_patches(&vol.gts, entry.origin, self.patch))
        };

        SegSample {
            input: input.into_dyn(),
            gt: gt.map(Array4::into_dyn),
            missing_mask: vol.pair.presence_mask(),
            meta: SampleMeta {
                input_filenames: vol.pair.present_inputs().map(Into::into).collect(),
                gt_filenames: vol.pair.gt_filenames().to_vec(),
                slice_index: 0,
                slice_axis: SliceAxis::Axial,
                pix_dim: vol.pix_dim,
                patch_origin: Some(entry.origin),
            },
        }
    }

    fn stack_patches(channels: &[Array3<f32>], origin: Idx3d, patch: Idx3d) -> Array4<f32> {
        let patches: Vec<Array3<f32>> = channels
            .iter()
            .map(|c| extract_patch(&c.view(), origin, patch))
            .collect();
        let views: Vec<_> = patches.iter().map(Array3::view).collect();
        stack(Axis(0), &views).expect("通道子体块形状必须一致")
    }
}
