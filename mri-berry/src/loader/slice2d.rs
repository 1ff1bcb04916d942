//! 2D 切片数据集.
//!
//! 将每个文件名配对的全部体数据沿切片轴分解为 2D 样本, 在索引构建时
//! 应用切片过滤器并缓存像素.

use std::sync::Arc;

use ndarray::{stack, Array2, Axis};

use super::cache::Payload;
use super::filter::SliceFilter;
use super::pairs::{FilenamePair, PairRegistry};
use super::{open_pair, LoaderError, SampleMeta, SegSample};
use crate::data::SliceAxis;
use crate::transform::SampleTransform;
use crate::Idx2d;

pub(crate) struct SliceEntry {
    pair: Arc<FilenamePair>,
    slice_index: usize,
    pix_dim: [f64; 3],
    inputs: Payload,
    gts: Payload,
}

/// 2D 切片数据集.
pub struct Slice2dDataset {
    entries: Vec<SliceEntry>,
    transform: Arc<dyn SampleTransform>,
    axis: SliceAxis,
    plane: Idx2d,
    soft_gt: bool,
}

impl Slice2dDataset {
    pub(crate) fn build(
        registry: &PairRegistry,
        axis: SliceAxis,
        filter: &SliceFilter,
        transform: Arc<dyn SampleTransform>,
        compressed: bool,
        soft_gt: bool,
    ) -> Result<Self, LoaderError> {
        let mut entries = Vec::new();
        let mut plane = None;

        for pair in registry.pairs() {
            let opened = open_pair(pair)?;
            let inputs: Vec<_> = opened.inputs.iter().flatten().collect();
            debug_assert!(!inputs.is_empty());
            plane.get_or_insert_with(|| axis.plane_shape(opened.shape));

            for slice_index in 0..axis.len_along(opened.shape) {
                let in_views: Vec<_> = inputs.iter().map(|v| v.slice_at(axis, slice_index)).collect();
                let gt_views: Vec<_> = opened
                    .gts
                    .iter()
                    .map(|v| v.slice_at(axis, slice_index))
                    .collect();
                let roi_view = opened.roi.as_ref().map(|v| v.slice_at(axis, slice_index));

                if !filter.keep(&in_views, &gt_views, roi_view.as_ref()) {
                    continue;
                }

                entries.push(SliceEntry {
                    pair: Arc::clone(pair),
                    slice_index,
                    pix_dim: opened.pix_dim,
                    inputs: Payload::build(in_views, compressed),
                    gts: Payload::build(gt_views, compressed),
                });
            }
        }

        if entries.is_empty() {
            return Err(LoaderError::EmptyDataset);
        }
        Ok(Self {
            entries,
            transform,
            axis,
            plane: plane.unwrap(),
            soft_gt,
        })
    }

    /// 样本个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 数据集是否为空. 构建成功的数据集恒非空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 单样本 2D 平面形状.
    #[inline]
    pub fn plane_shape(&self) -> Idx2d {
        self.plane
    }

    /// 单样本形状 (通道数, 高, 宽).
    pub fn sample_shape(&self) -> Vec<usize> {
        let (h, w) = self.plane;
        vec![self.entries[0].inputs.len(), h, w]
    }

    /// 真值是否保持软 (连续) 取值.
    #[inline]
    pub fn soft_gt(&self) -> bool {
        self.soft_gt
    }

    /// 获取第 `index` 个样本. 越界时程序 panic.
    ///
    /// 变换流水线在此处正向应用; 撤销所需的元数据随样本返回.
    pub fn get(&self, index: usize) -> SegSample {
        let entry = &self.entries[index];
        let meta = self.entry_meta(entry);

        let input = self.stack_channels(entry.inputs.fetch(), &meta);
        let gt = if entry.gts.len() == 0 {
            None
        } else {
            Some(self.stack_channels(entry.gts.fetch(), &meta))
        };

        SegSample {
            input: input.into_dyn(),
            gt: gt.map(ndarray::Array3::into_dyn),
            missing_mask: entry.pair.presence_mask(),
            meta,
        }
    }

    fn entry_meta(&self, entry: &SliceEntry) -> SampleMeta {
        SampleMeta {
            input_filenames: entry.pair.present_inputs().map(Into::into).collect(),
            gt_filenames: entry.pair.gt_filenames().to_vec(),
            slice_index: entry.slice_index,
            slice_axis: self.axis,
            pix_dim: entry.pix_dim,
            patch_origin: None,
        }
    }

    fn stack_channels(
        &self,
        channels: Vec<Array2<f32>>,
        meta: &SampleMeta,
    ) -> ndarray::Array3<f32> {
        let transformed: Vec<Array2<f32>> = channels
            .into_iter()
            .map(|c| self.transform.apply(c, meta))
            .collect();
        let views: Vec<_> = transformed.iter().map(Array2::view).collect();
        stack(Axis(0), &views).expect("通道切片形状必须一致")
    }
}
