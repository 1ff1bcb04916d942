//! 缺失模态 2D 切片数据集.
//!
//! 与 [`super::Slice2dDataset`] 的差别在于: 受试者允许缺失部分对比度,
//! 缺失通道在取样时以全零平面填充, 并通过 `missing_mask` 告知下游.
//! 后备存储可以是散装 nii 文件 (经配对注册表), 也可以是预整理的
//! npz 档案.

use std::path::PathBuf;
use std::sync::Arc;

use log::warn;
use ndarray::{stack, Array2, Array3, Axis};

use super::archive::VolumeArchive;
use super::cache::Payload;
use super::filter::SliceFilter;
use super::pairs::PairRegistry;
use super::{open_pair, LoaderError, SampleMeta, SegSample};
use crate::data::SliceAxis;
use crate::transform::SampleTransform;

struct MissingEntry {
    mask: Vec<bool>,
    slice_index: usize,
    pix_dim: [f64; 3],

    /// 仅存在的通道, 保持槽位顺序. 缺失通道在取样时补零.
    inputs: Payload,
    gts: Payload,

    input_filenames: Vec<PathBuf>,
    gt_filenames: Vec<PathBuf>,
}

/// 缺失模态 2D 切片数据集.
pub struct MissingModalityDataset {
    entries: Vec<MissingEntry>,
    transform: Arc<dyn SampleTransform>,
    axis: SliceAxis,
    n_channels: usize,
    soft_gt: bool,
}

impl MissingModalityDataset {
    /// 从配对注册表构建. 注册表必须以容忍缺失模态的方式建立.
    pub(crate) fn from_table(
        registry: &PairRegistry,
        axis: SliceAxis,
        filter: &SliceFilter,
        transform: Arc<dyn SampleTransform>,
        compressed: bool,
        soft_gt: bool,
    ) -> Result<Self, LoaderError> {
        let mut entries = Vec::new();
        let mut n_channels = None;

        for pair in registry.pairs() {
            let opened = open_pair(pair)?;
            let mask = pair.presence_mask();
            n_channels.get_or_insert(mask.len());

            let present: Vec<_> = opened.inputs.iter().flatten().collect();
            let input_filenames: Vec<PathBuf> = pair.present_inputs().map(Into::into).collect();
            let gt_filenames = pair.gt_filenames().to_vec();

            for slice_index in 0..axis.len_along(opened.shape) {
                let in_views: Vec<_> = present
                    .iter()
                    .map(|v| v.slice_at(axis, slice_index))
                    .collect();
                let gt_views: Vec<_> = opened
                    .gts
                    .iter()
                    .map(|v| v.slice_at(axis, slice_index))
                    .collect();
                let roi_view = opened.roi.as_ref().map(|v| v.slice_at(axis, slice_index));

                // 过滤只看实际存在的通道; 缺失通道不参与判定.
                if !filter.keep(&in_views, &gt_views, roi_view.as_ref()) {
                    continue;
                }

                entries.push(MissingEntry {
                    mask: mask.clone(),
                    slice_index,
                    pix_dim: opened.pix_dim,
                    inputs: Payload::build(in_views, compressed),
                    gts: Payload::build(gt_views, compressed),
                    input_filenames: input_filenames.clone(),
                    gt_filenames: gt_filenames.clone(),
                });
            }
        }

        Self::finish(entries, transform, axis, n_channels, soft_gt)
    }

    /// 从预整理的 npz 档案构建.
    ///
    /// 输入通道为条目 `{受试者}_{对比度}`; `gt_name` 指定真值条目的
    /// 对比度位名 (如 `gt`), `None` 代表纯推理; `roi_name` 同理指定
    /// ROI 掩码条目, 开启 ROI 切片过滤时必须提供. 全部通道缺失的
    /// 受试者被丢弃并记录日志.
    #[allow(clippy::too_many_arguments)]
    pub fn from_archive(
        archive: &VolumeArchive,
        subjects: &[String],
        contrasts: &[String],
        gt_name: Option<&str>,
        roi_name: Option<&str>,
        axis: SliceAxis,
        filter: &SliceFilter,
        transform: Arc<dyn SampleTransform>,
        compressed: bool,
        soft_gt: bool,
    ) -> Result<Self, LoaderError> {
        let mut entries = Vec::new();

        for subject in subjects {
            let channels: Vec<Option<Array3<f32>>> = contrasts
                .iter()
                .map(|c| {
                    if archive.contains(subject, c) {
                        archive.volume(subject, c).map(Some).map_err(LoaderError::Archive)
                    } else {
                        Ok(None)
                    }
                })
                .collect::<Result<_, _>>()?;

            let mask: Vec<bool> = channels.iter().map(Option::is_some).collect();
            if !mask.iter().any(|&m| m) {
                warn!("Subject {subject}: all contrasts missing in archive, sample dropped.");
                continue;
            }

            let gt = match gt_name {
                Some(name) if archive.contains(subject, name) => {
                    Some(archive.volume(subject, name).map_err(LoaderError::Archive)?)
                }
                Some(name) => {
                    warn!("Subject {subject}: missing ground truth {name}, sample dropped.");
                    continue;
                }
                None => None,
            };

            let roi = match roi_name {
                Some(name) if archive.contains(subject, name) => {
                    Some(archive.volume(subject, name).map_err(LoaderError::Archive)?)
                }
                Some(name) => {
                    warn!("Subject {subject}: missing ROI mask {name}, sample dropped.");
                    continue;
                }
                None => None,
            };

            let present: Vec<&Array3<f32>> = channels.iter().flatten().collect();
            let shape = present[0].dim();

            for slice_index in 0..axis.len_along(shape) {
                let in_views: Vec<_> = present
                    .iter()
                    .map(|v| v.index_axis(axis.canonical_axis(), slice_index))
                    .collect();
                let gt_views: Vec<_> = gt
                    .iter()
                    .map(|v| v.index_axis(axis.canonical_axis(), slice_index))
                    .collect();
                let roi_view = roi
                    .as_ref()
                    .map(|v| v.index_axis(axis.canonical_axis(), slice_index));

                if !filter.keep(&in_views, &gt_views, roi_view.as_ref()) {
                    continue;
                }

                entries.push(MissingEntry {
                    mask: mask.clone(),
                    slice_index,
                    // npz 档案不携带分辨率信息.
                    pix_dim: [1.0; 3],
                    inputs: Payload::build(in_views, compressed),
                    gts: Payload::build(gt_views, compressed),
                    input_filenames: Vec::new(),
                    gt_filenames: Vec::new(),
                });
            }
        }

        Self::finish(entries, transform, axis, Some(contrasts.len()), soft_gt)
    }

    fn finish(
        entries: Vec<MissingEntry>,
        transform: Arc<dyn SampleTransform>,
        axis: SliceAxis,
        n_channels: Option<usize>,
        soft_gt: bool,
    ) -> Result<Self, LoaderError> {
        if entries.is_empty() {
            return Err(LoaderError::EmptyDataset);
        }
        Ok(Self {
            entries,
            transform,
            axis,
            n_channels: n_channels.unwrap(),
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

    /// 输入通道 (含缺失槽位) 个数.
    #[inline]
    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    /// 真值是否保持软 (连续) 取值.
    #[inline]
    pub fn soft_gt(&self) -> bool {
        self.soft_gt
    }

    /// 单样本形状 (通道数, 高, 宽).
    pub fn sample_shape(&self) -> Vec<usize> {
        let (h, w) = self.entries[0].inputs.fetch()[0].dim();
        vec![self.n_channels, h, w]
    }

    /// 获取第 `index` 个样本. 越界时程序 panic.
    ///
    /// 缺失通道以全零平面参与堆叠, `missing_mask` 区分真缺失与真全零.
    pub fn get(&self, index: usize) -> SegSample {
        let entry = &self.entries[index];
        let meta = SampleMeta {
            input_filenames: entry.input_filenames.clone(),
            gt_filenames: entry.gt_filenames.clone(),
            slice_index: entry.slice_index,
            slice_axis: self.axis,
            pix_dim: entry.pix_dim,
            patch_origin: None,
        };

        let fetched = entry.inputs.fetch();
        let plane = fetched[0].dim();
        let mut present = fetched.into_iter();
        let channels: Vec<Array2<f32>> = entry
            .mask
            .iter()
            .map(|&m| {
                let c = if m {
                    present.next().expect("掩码与存在通道数不一致")
                } else {
                    Array2::zeros(plane)
                };
                self.transform.apply(c, &meta)
            })
            .collect();
        let views: Vec<_> = channels.iter().map(Array2::view).collect();
        let input = stack(Axis(0), &views).expect("通道切片形状必须一致");

        let gt = if entry.gts.len() == 0 {
            None
        } else {
            let gts: Vec<Array2<f32>> = entry
                .gts
                .fetch()
                .into_iter()
                .map(|g| self.transform.apply(g, &meta))
                .collect();
            let views: Vec<_> = gts.iter().map(Array2::view).collect();
            Some(stack(Axis(0), &views).expect("真值切片形状必须一致").into_dyn())
        };

        SegSample {
            input: input.into_dyn(),
            gt,
            missing_mask: entry.mask.clone(),
            meta,
        }
    }
}
