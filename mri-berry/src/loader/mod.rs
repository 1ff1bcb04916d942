//! 数据集构建.
//!
//! 从外部 BIDS 解析协作者给出的文件表出发, 构建三类分割数据集之一:
//! 2D 切片、3D 子体块、缺失模态 2D 切片. 数据集形态在配置验证阶段由
//! [`ModelCapability`] 一次性选定, 之后的代码对封闭变体做穷尽匹配.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use ndarray::ArrayD;
use ndarray_npy::ReadNpzError;

use crate::data::{MriVolume, SliceAxis, VolumeMeta};
use crate::transform::SampleTransform;
use crate::Idx3d;

pub mod archive;
mod cache;
mod dropout;
mod filter;
mod missing;
mod pairs;
mod patch;
mod slice2d;
mod subvolume;

pub use archive::{OpenArchiveError, VolumeArchive};
pub use cache::{CompactSlice, OwnedSlice};
pub use dropout::dropout_input;
pub use filter::SliceFilter;
pub use missing::MissingModalityDataset;
pub use pairs::{
    ContrastParams, ContrastSlot, FileRecord, FileTable, FilenamePair, ObjectDetectionParams,
    PairMeta, PairRegistry, RegistryOptions, RoiParams,
};
pub use patch::compute_patch_origins;
pub use slice2d::Slice2dDataset;
pub use subvolume::SubVolumeDataset;

/// 数据集构建错误.
#[derive(Debug)]
pub enum LoaderError {
    /// 全部候选样本被丢弃, 数据集为空.
    EmptyDataset,

    /// 读写 nii 文件错误.
    Nifti(nifti::NiftiError),

    /// 读取 npz 档案条目错误.
    Archive(ReadNpzError),

    /// 同一配对内的体数据形状不一致.
    ShapeMismatch {
        /// 形状不一致的文件.
        file: PathBuf,

        /// 期望形状 (取自配对的首个输入), 规范布局 `(z, h, w)`.
        expected: Idx3d,

        /// 实际形状.
        found: Idx3d,
    },
}

impl From<nifti::NiftiError> for LoaderError {
    fn from(e: nifti::NiftiError) -> Self {
        Self::Nifti(e)
    }
}

/// 随样本返回的切片级元数据. 重建器撤销变换、定位切片均依赖它.
#[derive(Debug, Clone)]
pub struct SampleMeta {
    /// 实际存在的输入文件路径, 保持通道顺序.
    pub input_filenames: Vec<PathBuf>,

    /// 真值文件路径列表. 纯推理模式下为空.
    pub gt_filenames: Vec<PathBuf>,

    /// 切片在源体数据内沿切片轴的绝对索引. 3D 样本恒为 0.
    pub slice_index: usize,

    /// 切片轴.
    pub slice_axis: SliceAxis,

    /// 体素分辨率, 毫米, `[z, h, w]` 顺序.
    pub pix_dim: [f64; 3],

    /// 3D 子体块的原点. 2D 样本为 `None`.
    pub patch_origin: Option<Idx3d>,
}

/// 一个分割样本.
///
/// 2D 形态下 `input` 形状为 `(通道, 高, 宽)`, 3D 形态下为
/// `(通道, z, h, w)`; `gt` 同理, 首维为目标标签数.
#[derive(Debug, Clone)]
pub struct SegSample {
    /// 输入张量.
    pub input: ArrayD<f32>,

    /// 真值张量. 纯推理模式下为 `None`.
    pub gt: Option<ArrayD<f32>>,

    /// 各输入通道槽位是否真实存在 (缺失模态掩码).
    pub missing_mask: Vec<bool>,

    /// 元数据.
    pub meta: SampleMeta,
}

/// 模型的数据形态能力. 配置验证阶段选定, 此后不再比较字符串.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCapability {
    /// 2D 逐切片模型.
    Slice2d,

    /// 3D 子体块模型.
    Volumetric {
        /// patch 形状, 规范布局 `(z, h, w)`.
        patch: Idx3d,

        /// 抽取步长.
        stride: Idx3d,
    },

    /// 允许输入模态缺失的 2D 模型.
    MissingModality,
}

/// 数据集构建选项.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// 目标真值后缀列表, 其顺序即真值通道顺序.
    pub target_suffixes: Vec<String>,

    /// 输入对比度参数.
    pub contrasts: ContrastParams,

    /// ROI 参数.
    pub roi: RoiParams,

    /// 目标检测 (裁剪框) 参数.
    pub object_detection: ObjectDetectionParams,

    /// 切片过滤器 (ROI 阈值以 [`RoiParams`] 为准, 此处的会被覆盖).
    pub slice_filter: SliceFilter,

    /// 切片轴.
    pub slice_axis: SliceAxis,

    /// 各对比度是否堆叠为多通道样本.
    pub multichannel: bool,

    /// 真值保持软 (连续) 取值, 不做二值化.
    pub soft_gt: bool,

    /// 是否要求真值存在.
    pub require_gt: bool,

    /// 切片缓存是否压缩存放.
    pub cache_compressed: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            target_suffixes: Vec::new(),
            contrasts: ContrastParams {
                contrasts: Vec::new(),
            },
            roi: RoiParams::default(),
            object_detection: ObjectDetectionParams::default(),
            slice_filter: SliceFilter::default(),
            slice_axis: SliceAxis::Axial,
            multichannel: false,
            soft_gt: false,
            require_gt: true,
            cache_compressed: false,
        }
    }
}

/// 已构建的分割数据集. 封闭变体, 下游穷尽匹配.
pub enum SegDataset {
    /// 2D 切片数据集.
    Slice2d(Slice2dDataset),

    /// 3D 子体块数据集.
    SubVolume(SubVolumeDataset),

    /// 缺失模态 2D 切片数据集.
    MissingModality(MissingModalityDataset),
}

impl SegDataset {
    /// 样本个数.
    pub fn len(&self) -> usize {
        match self {
            Self::Slice2d(d) => d.len(),
            Self::SubVolume(d) => d.len(),
            Self::MissingModality(d) => d.len(),
        }
    }

    /// 数据集是否为空. 构建成功的数据集恒非空.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 单样本形状 (含通道维).
    pub fn sample_shape(&self) -> Vec<usize> {
        match self {
            Self::Slice2d(d) => d.sample_shape(),
            Self::SubVolume(d) => d.sample_shape(),
            Self::MissingModality(d) => d.sample_shape(),
        }
    }

    /// 获取第 `index` 个样本. 越界时程序 panic.
    pub fn get(&self, index: usize) -> SegSample {
        match self {
            Self::Slice2d(d) => d.get(index),
            Self::SubVolume(d) => d.get(index),
            Self::MissingModality(d) => d.get(index),
        }
    }
}

/// 由能力与选项推导生效的切片过滤器.
///
/// 变换流水线不做 ROI 裁剪时, 基于 ROI 的切片过滤被强制关闭:
/// 不裁剪而按 ROI 过滤会错误地丢弃合法切片.
fn effective_filter(opts: &LoaderOptions, transform: &dyn SampleTransform) -> SliceFilter {
    let mut filter = opts.slice_filter;
    filter.filter_roi = match opts.roi.slice_filter_roi {
        Some(t) if transform.crops_to_roi() => Some(t),
        Some(_) => {
            warn!("ROI-based slice filtering disabled: transform pipeline does not crop to ROI.");
            None
        }
        None => None,
    };
    filter
}

/// 数据集分派器.
///
/// 根据 `capability` 构建对应形态的数据集. 文件表 `table` 由外部 BIDS
/// 解析协作者提供, `subjects` 为本划分 (训练/验证/测试) 的受试者列表.
pub fn load_dataset(
    table: &FileTable,
    subjects: &[String],
    capability: ModelCapability,
    opts: &LoaderOptions,
    transform: Arc<dyn SampleTransform>,
) -> Result<SegDataset, LoaderError> {
    let tolerate_missing = capability == ModelCapability::MissingModality;
    let registry = PairRegistry::build(
        table,
        subjects,
        &RegistryOptions {
            target_suffixes: &opts.target_suffixes,
            contrasts: &opts.contrasts,
            roi: &opts.roi,
            object_detection: &opts.object_detection,
            // 缺失模态形态隐含多通道堆叠.
            multichannel: opts.multichannel || tolerate_missing,
            require_gt: opts.require_gt,
            tolerate_missing,
        },
    )?;
    let filter = effective_filter(opts, transform.as_ref());

    let dataset = match capability {
        ModelCapability::Slice2d => SegDataset::Slice2d(Slice2dDataset::build(
            &registry,
            opts.slice_axis,
            &filter,
            transform,
            opts.cache_compressed,
            opts.soft_gt,
        )?),
        ModelCapability::Volumetric { patch, stride } => SegDataset::SubVolume(
            SubVolumeDataset::build(&registry, patch, stride, opts.soft_gt)?,
        ),
        ModelCapability::MissingModality => {
            SegDataset::MissingModality(MissingModalityDataset::from_table(
                &registry,
                opts.slice_axis,
                &filter,
                transform,
                opts.cache_compressed,
                opts.soft_gt,
            )?)
        }
    };

    info!(
        "Loaded {} sample(s) of shape {:?}.",
        dataset.len(),
        dataset.sample_shape()
    );
    Ok(dataset)
}

/// 一个配对的全部已打开体数据. 数据集构建的中间产物.
pub(crate) struct OpenedPair {
    /// 输入体数据, 按槽位顺序; 缺失槽位为 `None`.
    pub inputs: Vec<Option<MriVolume>>,

    /// 真值体数据, 与目标后缀一一对应.
    pub gts: Vec<MriVolume>,

    /// ROI 掩码体数据.
    pub roi: Option<MriVolume>,

    /// 公共形状, 规范布局 `(z, h, w)`.
    pub shape: Idx3d,

    /// 体素分辨率, 毫米, `[z, h, w]` 顺序.
    pub pix_dim: [f64; 3],
}

/// 打开配对的全部体数据并校验形状一致.
pub(crate) fn open_pair(pair: &FilenamePair) -> Result<OpenedPair, LoaderError> {
    let mut inputs = Vec::with_capacity(pair.inputs().len());
    for slot in pair.inputs() {
        inputs.push(match &slot.path {
            Some(p) => Some(MriVolume::open(p)?),
            None => None,
        });
    }

    // 配对的不变式保证至少有一个输入存在.
    let first = inputs.iter().flatten().next().unwrap();
    let shape = first.shape();
    let pix_dim = first.pix_dim();

    let check = |vol: &MriVolume, file: &Path| -> Result<(), LoaderError> {
        if vol.shape() != shape {
            return Err(LoaderError::ShapeMismatch {
                file: file.to_owned(),
                expected: shape,
                found: vol.shape(),
            });
        }
        Ok(())
    };

    for (slot, vol) in pair.inputs().iter().zip(&inputs) {
        if let (Some(p), Some(v)) = (&slot.path, vol) {
            check(v, p)?;
        }
    }

    let mut gts = Vec::with_capacity(pair.gt_filenames().len());
    for p in pair.gt_filenames() {
        let vol = MriVolume::open(p)?;
        check(&vol, p)?;
        gts.push(vol);
    }

    let roi = match &pair.meta().roi_filename {
        Some(p) => {
            let vol = MriVolume::open(p)?;
            check(&vol, p)?;
            Some(vol)
        }
        None => None,
    };

    Ok(OpenedPair {
        inputs,
        gts,
        roi,
        shape,
        pix_dim,
    })
}

/// 用户主目录下的默认数据集根目录 `~/mri-datasets`.
///
/// 当且仅当系统能正常返回用户主目录时, 该函数返回 `Some`.
pub fn home_dataset_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join("mri-datasets"))
}

/// 默认数据集根目录下名为 `name` 的数据集目录.
pub fn home_dataset_dir_with<P: AsRef<Path>>(name: P) -> Option<PathBuf> {
    home_dataset_dir().map(|d| d.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::tmp_dir;
    use crate::transform::NoTransform;
    use ndarray::Array2;

    /// 声明做 ROI 裁剪的哑变换.
    struct RoiCropper;

    impl SampleTransform for RoiCropper {
        fn apply(&self, slice: Array2<f32>, _meta: &SampleMeta) -> Array2<f32> {
            slice
        }
        fn undo(&self, slice: Array2<f32>, _meta: &SampleMeta) -> Array2<f32> {
            slice
        }
        fn crops_to_roi(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_effective_filter_forces_roi_off() {
        let mut opts = LoaderOptions::default();
        opts.roi.slice_filter_roi = Some(10);

        // 流水线不裁剪: 强制关闭.
        let f = effective_filter(&opts, &NoTransform);
        assert_eq!(f.filter_roi, None);

        // 流水线裁剪: 照常生效.
        let f = effective_filter(&opts, &RoiCropper);
        assert_eq!(f.filter_roi, Some(10));
    }

    fn synth_table(tag: &str) -> (FileTable, PathBuf) {
        let dir = tmp_dir(tag);
        let mut table = FileTable::default();

        let img = ndarray::Array3::from_shape_fn((6, 8, 8), |(z, h, w)| (z + h + w + 1) as f32);
        let gt = ndarray::Array3::from_elem((6, 8, 8), 1.0f32);
        let img_path = dir.join("sub-01_T1w.nii.gz");
        let gt_path = dir.join("sub-01_T1w_lesion-manual.nii.gz");
        MriVolume::fake(img, [1.0; 3]).save(&img_path).unwrap();
        MriVolume::fake(gt, [1.0; 3]).save(&gt_path).unwrap();

        table.push(FileRecord {
            subject: "sub-01".to_owned(),
            contrast: "T1w".to_owned(),
            suffix: None,
            path: img_path,
        });
        table.push(FileRecord {
            subject: "sub-01".to_owned(),
            contrast: "T1w".to_owned(),
            suffix: Some("_lesion-manual".to_owned()),
            path: gt_path,
        });
        (table, dir)
    }

    fn base_opts() -> LoaderOptions {
        LoaderOptions {
            target_suffixes: vec!["_lesion-manual".to_owned()],
            contrasts: ContrastParams {
                contrasts: vec!["T1w".to_owned()],
            },
            ..LoaderOptions::default()
        }
    }

    #[test]
    fn test_dispatch_slice2d() {
        crate::test_util::init_logger();
        let (table, _dir) = synth_table("dispatch-2d");
        let ds = load_dataset(
            &table,
            &["sub-01".to_owned()],
            ModelCapability::Slice2d,
            &base_opts(),
            Arc::new(NoTransform),
        )
        .unwrap();
        assert!(matches!(ds, SegDataset::Slice2d(_)));
        assert_eq!(ds.len(), 6);
        assert_eq!(ds.sample_shape(), vec![1, 8, 8]);
    }

    #[test]
    fn test_dispatch_volumetric() {
        let (table, _dir) = synth_table("dispatch-3d");
        let ds = load_dataset(
            &table,
            &["sub-01".to_owned()],
            ModelCapability::Volumetric {
                patch: (4, 4, 4),
                stride: (4, 4, 4),
            },
            &base_opts(),
            Arc::new(NoTransform),
        )
        .unwrap();
        assert!(matches!(ds, SegDataset::SubVolume(_)));
        // 每轴原点 [0, 4], z 轴 [0, 2]: 2 x 2 x 2.
        assert_eq!(ds.len(), 8);
        let s = ds.get(0);
        assert_eq!(s.input.shape(), &[1, 4, 4, 4]);
        assert!(s.meta.patch_origin.is_some());
    }

    #[test]
    fn test_dispatch_missing_modality() {
        let (table, _dir) = synth_table("dispatch-missing");
        let mut opts = base_opts();
        opts.contrasts.contrasts.push("T2w".to_owned());

        let ds = load_dataset(
            &table,
            &["sub-01".to_owned()],
            ModelCapability::MissingModality,
            &opts,
            Arc::new(NoTransform),
        )
        .unwrap();
        assert!(matches!(ds, SegDataset::MissingModality(_)));
        let s = ds.get(0);
        assert_eq!(s.missing_mask, vec![true, false]);
    }

    #[test]
    fn test_shape_mismatch_detected() {
        let dir = tmp_dir("shape-mismatch");
        let mut table = FileTable::default();

        let img = ndarray::Array3::from_elem((4, 4, 4), 1.0f32);
        let gt = ndarray::Array3::from_elem((4, 4, 5), 1.0f32);
        let img_path = dir.join("sub-01_T1w.nii.gz");
        let gt_path = dir.join("sub-01_T1w_lesion-manual.nii.gz");
        MriVolume::fake(img, [1.0; 3]).save(&img_path).unwrap();
        MriVolume::fake(gt, [1.0; 3]).save(&gt_path).unwrap();
        table.push(FileRecord {
            subject: "sub-01".to_owned(),
            contrast: "T1w".to_owned(),
            suffix: None,
            path: img_path,
        });
        table.push(FileRecord {
            subject: "sub-01".to_owned(),
            contrast: "T1w".to_owned(),
            suffix: Some("_lesion-manual".to_owned()),
            path: gt_path.clone(),
        });

        let result = load_dataset(
            &table,
            &["sub-01".to_owned()],
            ModelCapability::Slice2d,
            &base_opts(),
            Arc::new(NoTransform),
        );
        let Err(err) = result else {
            panic!("形状不一致的配对必须构建失败");
        };
        match err {
            LoaderError::ShapeMismatch {
                file,
                expected,
                found,
            } => {
                assert_eq!(file, gt_path);
                assert_eq!(expected, (4, 4, 4));
                assert_eq!(found, (4, 4, 5));
            }
            other => panic!("期望 ShapeMismatch, 实际 {other:?}"),
        }
    }
}
