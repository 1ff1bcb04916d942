//! 推理预测结果的 3D 重建与持久化.
//!
//! 核心是 [`VolumeReconstructor`]: 一个显式的 accumulate/flush 状态机.
//! 逐切片预测按源文件 key 连续到达, key 变化或流结束时把缓冲的切片
//! 重组为完整体数据并写入 `pred_masks` 目录. 3D 整体预测经
//! [`PatchAssembler`] 与 [`save_volume_prediction`] 直接落盘,
//! 不经过逐切片累积.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use itertools::Itertools;
use log::{error, info};
use ndarray::{s, Array3, Array4, ArrayView4, Axis};

use crate::consts::{palette, NII_EXT, NII_GZ_EXT, PRED_MASKS_DIR, PRED_SUFFIX};
use crate::data::{save_rgb_volume, save_volume, save_volume4, MriVolume, VolumeMeta};
use crate::loader::SampleMeta;
use crate::transform::SampleTransform;
use crate::Idx3d;

mod uncertainty;

pub use uncertainty::run_uncertainty;

/// 体数据重建错误.
#[derive(Debug)]
pub enum ReconstructError {
    /// 已 flush 的 key 再次出现. 说明上游迭代顺序被打乱,
    /// 同一体数据的切片未连续到达.
    KeyReappeared(PathBuf),

    /// 同一体数据内出现重复切片索引.
    DuplicateSlice {
        /// 源文件 key.
        file: PathBuf,

        /// 重复的切片索引.
        index: usize,
    },

    /// 切片索引超出参考体数据范围.
    SliceOutOfBounds {
        /// 源文件 key.
        file: PathBuf,

        /// 越界的切片索引.
        index: usize,

        /// 参考体数据沿切片轴的长度.
        len: usize,
    },

    /// 读写 nii 文件错误.
    Nifti(nifti::NiftiError),

    /// 其他底层 I/O 错误.
    Io(std::io::Error),
}

impl From<nifti::NiftiError> for ReconstructError {
    fn from(e: nifti::NiftiError) -> Self {
        Self::Nifti(e)
    }
}

impl From<std::io::Error> for ReconstructError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Monte-Carlo 推理的第几趟.
#[derive(Debug, Clone, Copy)]
pub struct McPass {
    /// 趟序号, 从 0 开始. 进入输出文件名.
    pub index: u32,
}

/// 重建选项.
#[derive(Debug, Clone)]
pub struct ReconstructOptions {
    /// 输出根目录. 预测文件写入其 `pred_masks` 子目录.
    pub out_dir: PathBuf,

    /// 真值后缀. 构造输出文件名时从 key 文件名中截掉该后缀及其后内容.
    pub target_suffix: Option<String>,

    /// 二值化阈值. `None` 保持软输出 (软真值模式).
    pub bin_threshold: Option<f32>,

    /// Monte-Carlo 趟号. `None` 代表单趟确定性推理.
    pub mc_pass: Option<McPass>,
}

impl ReconstructOptions {
    /// 常规单趟推理选项.
    pub fn new<P: Into<PathBuf>>(out_dir: P) -> Self {
        Self {
            out_dir: out_dir.into(),
            target_suffix: None,
            bin_threshold: Some(crate::consts::DEFAULT_BIN_THRESHOLD),
            mc_pass: None,
        }
    }

    /// 由 key 文件名构造输出预测文件路径 (不含目录创建).
    pub fn pred_path(&self, key: &Path) -> PathBuf {
        let name = key
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut stem = name
            .strip_suffix(NII_GZ_EXT)
            .or_else(|| name.strip_suffix(NII_EXT))
            .unwrap_or(&name)
            .to_owned();

        if let Some(suffix) = &self.target_suffix {
            if let Some(pos) = stem.find(suffix.as_str()) {
                stem.truncate(pos);
            }
        }

        stem.push_str(PRED_SUFFIX);
        if let Some(pass) = self.mc_pass {
            stem.push_str(&format!("_{:02}", pass.index));
        }
        stem.push_str(NII_GZ_EXT);
        self.out_dir.join(PRED_MASKS_DIR).join(stem)
    }
}

/// 一张逐切片预测.
#[derive(Debug, Clone)]
pub struct PredictedSlice {
    /// 预测张量, 形状 (标签数, 高, 宽). 单标签模型标签数为 1.
    pub pred: Array3<f32>,

    /// 取样时随样本携带的元数据.
    pub meta: SampleMeta,
}

impl PredictedSlice {
    /// 该切片的重建 key: 首个真值文件路径, 纯推理模式退回首个输入路径.
    pub fn key(&self) -> &Path {
        self.meta
            .gt_filenames
            .first()
            .or_else(|| self.meta.input_filenames.first())
            .expect("预测切片的元数据不含任何文件路径")
    }
}

/// 体数据重建器: 显式的 accumulate/flush 状态机.
///
/// # 输入流契约
///
/// 同一体数据的全部切片必须连续到达 (数据集索引的确定性迭代顺序
/// 保证了这一点). 已 flush 的 key 再次出现说明上游配置错误,
/// [`VolumeReconstructor::push`] 对此返回
/// [`ReconstructError::KeyReappeared`].
pub struct VolumeReconstructor {
    opts: ReconstructOptions,
    transform: Arc<dyn SampleTransform>,
    current: Option<(PathBuf, Vec<PredictedSlice>)>,
    flushed: HashSet<PathBuf>,
}

impl VolumeReconstructor {
    /// 创建重建器. `transform` 为取样时使用的同一条变换流水线,
    /// flush 时逐切片撤销.
    pub fn new(opts: ReconstructOptions, transform: Arc<dyn SampleTransform>) -> Self {
        Self {
            opts,
            transform,
            current: None,
            flushed: HashSet::new(),
        }
    }

    /// 送入一张预测切片.
    ///
    /// key 与当前体数据一致时仅缓冲; key 变化时先 flush 旧体数据再开始
    /// 新的累积, 返回 `Ok(Some(已写入路径))`.
    pub fn push(&mut self, slice: PredictedSlice) -> Result<Option<PathBuf>, ReconstructError> {
        let key = slice.key().to_owned();
        if self.flushed.contains(&key) {
            return Err(ReconstructError::KeyReappeared(key));
        }

        match &mut self.current {
            Some((current_key, buffer)) if *current_key == key => {
                if buffer.iter().any(|s| s.meta.slice_index == slice.meta.slice_index) {
                    return Err(ReconstructError::DuplicateSlice {
                        file: key,
                        index: slice.meta.slice_index,
                    });
                }
                buffer.push(slice);
                Ok(None)
            }
            Some(_) => {
                let written = self.flush_current()?;
                self.current = Some((key, vec![slice]));
                Ok(Some(written))
            }
            None => {
                self.current = Some((key, vec![slice]));
                Ok(None)
            }
        }
    }

    /// 结束输入流, 强制 flush 最后一个体数据.
    ///
    /// 不调用该方法就丢弃重建器会静默丢失最后一个体数据.
    pub fn finish(mut self) -> Result<Option<PathBuf>, ReconstructError> {
        if self.current.is_none() {
            return Ok(None);
        }
        self.flush_current().map(Some)
    }

    fn flush_current(&mut self) -> Result<PathBuf, ReconstructError> {
        let (key, buffer) = self.current.take().expect("flush 时缓冲必须非空");

        let reference = MriVolume::open(&key)?;
        let shape = reference.shape();
        let axis = buffer[0].meta.slice_axis;
        let axis_len = axis.len_along(shape);
        let n_labels = buffer[0].pred.dim().0;

        let (z, h, w) = shape;
        let mut out = Array4::<f32>::zeros((n_labels, z, h, w));

        // 按切片索引升序放回绝对位置; 缺失的切片保持为零.
        for slice in buffer.into_iter().sorted_by_key(|s| s.meta.slice_index) {
            let index = slice.meta.slice_index;
            if index >= axis_len {
                return Err(ReconstructError::SliceOutOfBounds {
                    file: key,
                    index,
                    len: axis_len,
                });
            }
            for label in 0..n_labels {
                let plane = slice.pred.index_axis(Axis(0), label).to_owned();
                let undone = self.transform.undo(plane, &slice.meta);
                assert_eq!(
                    undone.dim(),
                    axis.plane_shape(shape),
                    "撤销变换后的切片形状必须与参考体数据吻合"
                );
                out.index_axis_mut(Axis(0), label)
                    .index_axis_mut(axis.canonical_axis(), index)
                    .assign(&undone);
            }
        }

        let path = write_prediction(out, reference.header(), &key, &self.opts)?;
        self.flushed.insert(key);
        Ok(path)
    }
}

impl Drop for VolumeReconstructor {
    /// 未 finish 就丢弃重建器会丢失最后一个体数据, 这是上游的正确性
    /// 缺陷, 在此大声记录 (错误路径上的丢弃除外, 彼时错误已经上报).
    fn drop(&mut self) {
        if let Some((key, buffer)) = &self.current {
            error!(
                "VolumeReconstructor dropped with {} unflushed slice(s) for {}; call finish().",
                buffer.len(),
                key.display()
            );
        }
    }
}

/// 将完整的 (标签, z, h, w) 预测写入 `pred_masks` 目录.
///
/// 单标签写为 3D 文件; 多标签写为 4D 文件并额外合成彩色标签文件.
/// 二值化仅作用于预测文件本身, 彩色合并始终使用原始通道值.
fn write_prediction(
    mut pred: Array4<f32>,
    reference: &nifti::NiftiHeader,
    key: &Path,
    opts: &ReconstructOptions,
) -> Result<PathBuf, ReconstructError> {
    let path = opts.pred_path(key);
    std::fs::create_dir_all(path.parent().expect("预测路径必有父目录"))?;

    let color_path = (pred.dim().0 > 1).then(|| {
        let mut p = path.to_string_lossy().into_owned();
        p.truncate(p.len() - NII_GZ_EXT.len());
        PathBuf::from(p + "_color" + NII_GZ_EXT)
    });
    if let Some(color_path) = color_path {
        save_rgb_volume(merge_color_labels(pred.view()).view(), reference, color_path)?;
    }

    if let Some(threshold) = opts.bin_threshold {
        pred.mapv_inplace(|v| if v > threshold { 1.0 } else { 0.0 });
    }

    if pred.dim().0 == 1 {
        save_volume(pred.index_axis(Axis(0), 0), reference, &path)?;
    } else {
        save_volume4(pred.view(), reference, &path)?;
    }
    info!("Saved reconstructed prediction to {}.", path.display());
    Ok(path)
}

/// 由原始多标签通道合成 RGB 彩色体数据.
///
/// 每个标签固定一种调色板颜色, 按通道原始值加权叠加后截断到 u8,
/// 重叠结构因混色而保持可分辨.
fn merge_color_labels(pred: ArrayView4<f32>) -> Array4<u8> {
    let (l, z, h, w) = pred.dim();
    let mut rgb = Array4::<u8>::zeros((z, h, w, 3));

    for (zi, hi, wi) in ndarray::indices((z, h, w)) {
        let mut acc = [0.0f32; 3];
        for label in 0..l {
            let v = pred[[label, zi, hi, wi]].clamp(0.0, 1.0);
            let color = palette::label_color(label);
            for (a, &c) in acc.iter_mut().zip(color.iter()) {
                *a += v * f32::from(c);
            }
        }
        for (k, a) in acc.into_iter().enumerate() {
            rgb[[zi, hi, wi, k]] = a.min(255.0) as u8;
        }
    }
    rgb
}

/// 3D 子体块预测的重组器.
///
/// 3D 整体路径不经过逐切片状态机: 子体块按原点放回, 重叠区域取平均.
pub struct PatchAssembler {
    sum: Array4<f32>,
    count: Array3<f32>,
}

impl PatchAssembler {
    /// 创建重组器. `shape` 为目标体数据的规范布局形状.
    pub fn new(n_labels: usize, shape: Idx3d) -> Self {
        let (z, h, w) = shape;
        Self {
            sum: Array4::zeros((n_labels, z, h, w)),
            count: Array3::zeros((z, h, w)),
        }
    }

    /// 在 `origin` 处放回一个 (标签, pz, ph, pw) 子体块预测.
    ///
    /// 子体块超出体数据的部分 (退化 patch 的补零区) 被忽略.
    /// 标签数不一致时程序 panic.
    pub fn add(&mut self, origin: Idx3d, patch: ArrayView4<f32>) {
        let (l, pz, ph, pw) = patch.dim();
        assert_eq!(l, self.sum.dim().0, "子体块标签数与重组器不一致");

        let (oz, oh, ow) = origin;
        let (_, dz, dh, dw) = self.sum.dim();
        let ez = pz.min(dz.saturating_sub(oz));
        let eh = ph.min(dh.saturating_sub(oh));
        let ew = pw.min(dw.saturating_sub(ow));

        self.sum
            .slice_mut(s![.., oz..oz + ez, oh..oh + eh, ow..ow + ew])
            .zip_mut_with(&patch.slice(s![.., ..ez, ..eh, ..ew]), |a, &b| *a += b);
        self.count
            .slice_mut(s![oz..oz + ez, oh..oh + eh, ow..ow + ew])
            .mapv_inplace(|c| c + 1.0);
    }

    /// 完成重组, 重叠区域取平均. 未被任何子体块覆盖的体素保持为零.
    pub fn into_volume(self) -> Array4<f32> {
        let Self { mut sum, count } = self;
        for label in 0..sum.dim().0 {
            sum.index_axis_mut(Axis(0), label)
                .zip_mut_with(&count, |a, &c| {
                    if c > 0.0 {
                        *a /= c;
                    }
                });
        }
        sum
    }
}

/// 3D 整体预测的直接落盘路径.
///
/// `pred` 为完整的 (标签, z, h, w) 预测, `key` 为参考体数据路径,
/// 其 header 提供输出方向信息. 绕过逐切片状态机.
pub fn save_volume_prediction(
    pred: Array4<f32>,
    key: &Path,
    opts: &ReconstructOptions,
) -> Result<PathBuf, ReconstructError> {
    let reference = MriVolume::open(key)?;
    let (_, z, h, w) = pred.dim();
    assert_eq!(
        (z, h, w),
        reference.shape(),
        "预测形状必须与参考体数据一致"
    );
    write_prediction(pred, reference.header(), key, opts)
}
