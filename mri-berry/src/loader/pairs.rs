//! 文件名配对注册表.
//!
//! 从外部 BIDS 解析协作者给出的可用文件表出发, 为每个受试者构建
//! "输入对比度文件列表 <-> 真值文件列表" 的有序对应关系. 配对一经
//! 建立即只读, 被派生出的所有样本共享.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};

use super::LoaderError;

/// 一条可用文件记录, 由外部 BIDS 解析协作者生成.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// 受试者 ID, 如 `sub-01`.
    pub subject: String,

    /// 对比度 (采集序列) 名, 如 `T1w`, `T2w`.
    pub contrast: String,

    /// 派生文件后缀, 如 `_lesion-manual`. `None` 代表解剖像本身.
    pub suffix: Option<String>,

    /// 文件路径.
    pub path: PathBuf,
}

/// 可用文件表. 外部 dataframe 的极简只读对应物.
#[derive(Debug, Clone, Default)]
pub struct FileTable {
    records: Vec<FileRecord>,
}

impl FileTable {
    /// 从记录列表创建.
    pub fn new(records: Vec<FileRecord>) -> Self {
        Self { records }
    }

    /// 追加一条记录.
    pub fn push(&mut self, record: FileRecord) {
        self.records.push(record);
    }

    /// 记录总数.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 查找受试者某对比度的解剖像路径.
    pub fn image(&self, subject: &str, contrast: &str) -> Option<&Path> {
        self.find(subject, contrast, None)
    }

    /// 查找受试者某对比度的派生文件 (真值/ROI) 路径.
    pub fn derivative(&self, subject: &str, contrast: &str, suffix: &str) -> Option<&Path> {
        self.find(subject, contrast, Some(suffix))
    }

    fn find(&self, subject: &str, contrast: &str, suffix: Option<&str>) -> Option<&Path> {
        self.records
            .iter()
            .find(|r| {
                r.subject == subject && r.contrast == contrast && r.suffix.as_deref() == suffix
            })
            .map(|r| r.path.as_path())
    }
}

/// ROI 参数.
#[derive(Debug, Clone, Default)]
pub struct RoiParams {
    /// ROI 掩码文件后缀. `None` 代表不使用 ROI.
    pub suffix: Option<String>,

    /// 基于 ROI 的切片过滤阈值. 见 [`super::SliceFilter::filter_roi`].
    pub slice_filter_roi: Option<usize>,
}

/// 对比度参数.
#[derive(Debug, Clone)]
pub struct ContrastParams {
    /// 输入对比度的有序列表. 该顺序即多通道样本的通道顺序.
    pub contrasts: Vec<String>,
}

/// 目标检测 (裁剪框) 参数. 配对只记录其来源, 实际裁剪由变换流水线完成.
#[derive(Debug, Clone, Default)]
pub struct ObjectDetectionParams {
    /// 检测框文件路径.
    pub bbox_path: Option<PathBuf>,

    /// 检测框各轴安全放大系数.
    pub safety_factor: Option<[f64; 3]>,
}

/// 一个输入通道槽位: 对比度名与其文件路径. 缺失模态模式下路径可为空.
#[derive(Debug, Clone)]
pub struct ContrastSlot {
    /// 对比度名.
    pub contrast: String,

    /// 文件路径. `None` 表示该受试者缺失此模态.
    pub path: Option<PathBuf>,
}

/// 受试者级元数据, 随配对只读共享.
#[derive(Debug, Clone)]
pub struct PairMeta {
    /// 受试者 ID.
    pub subject: String,

    /// ROI 掩码文件路径.
    pub roi_filename: Option<PathBuf>,

    /// 目标检测框文件路径.
    pub bbox_filename: Option<PathBuf>,
}

/// 不可变的文件名配对: 一个样本的输入文件列表与真值文件列表.
///
/// # 不变式
///
/// 1. 输入槽位列表非空, 且至少有一个槽位存在文件.
/// 2. 真值列表长度等于配置的目标后缀数, 或在纯推理模式下为空.
#[derive(Debug, Clone)]
pub struct FilenamePair {
    inputs: Vec<ContrastSlot>,
    gt_filenames: Vec<PathBuf>,
    meta: PairMeta,
}

impl FilenamePair {
    fn new(inputs: Vec<ContrastSlot>, gt_filenames: Vec<PathBuf>, meta: PairMeta) -> Self {
        assert!(!inputs.is_empty(), "输入槽位列表不允许为空");
        assert!(
            inputs.iter().any(|s| s.path.is_some()),
            "受试者 {} 的全部输入模态均缺失",
            meta.subject
        );
        Self {
            inputs,
            gt_filenames,
            meta,
        }
    }

    /// 输入槽位 (含缺失槽位), 顺序为配置的对比度顺序.
    #[inline]
    pub fn inputs(&self) -> &[ContrastSlot] {
        &self.inputs
    }

    /// 实际存在的输入文件路径, 保持槽位顺序.
    pub fn present_inputs(&self) -> impl Iterator<Item = &Path> {
        self.inputs.iter().filter_map(|s| s.path.as_deref())
    }

    /// 各槽位是否存在文件 (缺失模态掩码的来源).
    pub fn presence_mask(&self) -> Vec<bool> {
        self.inputs.iter().map(|s| s.path.is_some()).collect()
    }

    /// 真值文件路径列表 (与目标后缀一一对应; 纯推理模式下为空).
    #[inline]
    pub fn gt_filenames(&self) -> &[PathBuf] {
        &self.gt_filenames
    }

    /// 受试者级元数据.
    #[inline]
    pub fn meta(&self) -> &PairMeta {
        &self.meta
    }
}

/// 文件名配对注册表. 拥有全部 [`FilenamePair`] 的生命周期.
#[derive(Debug, Clone)]
pub struct PairRegistry {
    pairs: Vec<Arc<FilenamePair>>,
}

/// 注册表构建参数.
#[derive(Debug, Clone)]
pub struct RegistryOptions<'a> {
    /// 目标真值后缀列表.
    pub target_suffixes: &'a [String],

    /// 对比度参数.
    pub contrasts: &'a ContrastParams,

    /// ROI 参数.
    pub roi: &'a RoiParams,

    /// 目标检测参数.
    pub object_detection: &'a ObjectDetectionParams,

    /// 为 `true` 时各对比度堆叠为多通道样本, 否则每个对比度独立成样本.
    pub multichannel: bool,

    /// 是否要求真值存在 (训练/评估要求, 纯推理不要求).
    pub require_gt: bool,

    /// 是否容忍缺失模态 (仅缺失模态数据集使用).
    pub tolerate_missing: bool,
}

impl PairRegistry {
    /// 从可用文件表为 `subjects` 构建注册表.
    ///
    /// 缺失必需文件的受试者被丢弃并记录日志, 不视为致命错误;
    /// 但若全部样本被丢弃, 返回 [`LoaderError::EmptyDataset`].
    pub fn build(
        table: &FileTable,
        subjects: &[String],
        opts: &RegistryOptions,
    ) -> Result<Self, LoaderError> {
        let mut pairs = Vec::with_capacity(subjects.len());

        for subject in subjects {
            if opts.multichannel || opts.tolerate_missing {
                if let Some(pair) = Self::build_stacked(table, subject, opts) {
                    pairs.push(Arc::new(pair));
                }
            } else {
                // 每个对比度独立成样本.
                for contrast in &opts.contrasts.contrasts {
                    if let Some(pair) = Self::build_single(table, subject, contrast, opts) {
                        pairs.push(Arc::new(pair));
                    }
                }
            }
        }

        if pairs.is_empty() {
            return Err(LoaderError::EmptyDataset);
        }
        info!("Registered {} filename pair(s).", pairs.len());
        Ok(Self { pairs })
    }

    /// 多通道 (或缺失模态) 模式: 一个受试者一个配对.
    fn build_stacked(
        table: &FileTable,
        subject: &str,
        opts: &RegistryOptions,
    ) -> Option<FilenamePair> {
        let mut inputs = Vec::with_capacity(opts.contrasts.contrasts.len());
        for contrast in &opts.contrasts.contrasts {
            let path = table.image(subject, contrast).map(Path::to_owned);
            if path.is_none() && !opts.tolerate_missing {
                warn!("Subject {subject}: missing contrast {contrast}, sample dropped.");
                return None;
            }
            inputs.push(ContrastSlot {
                contrast: contrast.clone(),
                path,
            });
        }
        if !inputs.iter().any(|s| s.path.is_some()) {
            warn!("Subject {subject}: all contrasts missing, sample dropped.");
            return None;
        }

        // 真值/ROI 从首个存在的对比度派生.
        let primary = inputs
            .iter()
            .find_map(|s| s.path.as_ref().map(|_| s.contrast.clone()))
            .unwrap();
        Self::attach_derivatives(table, subject, &primary, inputs, opts)
    }

    /// 单对比度模式: 一个 (受试者, 对比度) 一个配对.
    fn build_single(
        table: &FileTable,
        subject: &str,
        contrast: &str,
        opts: &RegistryOptions,
    ) -> Option<FilenamePair> {
        let Some(path) = table.image(subject, contrast) else {
            warn!("Subject {subject}: missing contrast {contrast}, sample dropped.");
            return None;
        };
        let inputs = vec![ContrastSlot {
            contrast: contrast.to_owned(),
            path: Some(path.to_owned()),
        }];
        Self::attach_derivatives(table, subject, contrast, inputs, opts)
    }

    fn attach_derivatives(
        table: &FileTable,
        subject: &str,
        primary_contrast: &str,
        inputs: Vec<ContrastSlot>,
        opts: &RegistryOptions,
    ) -> Option<FilenamePair> {
        let mut gt_filenames = Vec::with_capacity(opts.target_suffixes.len());
        for suffix in opts.target_suffixes {
            match table.derivative(subject, primary_contrast, suffix) {
                Some(p) => gt_filenames.push(p.to_owned()),
                None if opts.require_gt => {
                    warn!("Subject {subject}: missing ground truth {suffix}, sample dropped.");
                    return None;
                }
                None => {
                    // 纯推理模式: 真值列表保持为空.
                    gt_filenames.clear();
                    break;
                }
            }
        }

        let roi_filename = match &opts.roi.suffix {
            Some(suffix) => match table.derivative(subject, primary_contrast, suffix) {
                Some(p) => Some(p.to_owned()),
                None => {
                    warn!("Subject {subject}: missing ROI mask {suffix}, sample dropped.");
                    return None;
                }
            },
            None => None,
        };

        Some(FilenamePair::new(
            inputs,
            gt_filenames,
            PairMeta {
                subject: subject.to_owned(),
                roi_filename,
                bbox_filename: opts.object_detection.bbox_path.clone(),
            },
        ))
    }

    /// 全部配对, 只读共享.
    #[inline]
    pub fn pairs(&self) -> &[Arc<FilenamePair>] {
        &self.pairs
    }

    /// 配对个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// 是否为空. 构建成功的注册表恒非空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoaderError;

    fn record(subject: &str, contrast: &str, suffix: Option<&str>) -> FileRecord {
        let name = match suffix {
            Some(s) => format!("{subject}_{contrast}{s}.nii.gz"),
            None => format!("{subject}_{contrast}.nii.gz"),
        };
        FileRecord {
            subject: subject.to_owned(),
            contrast: contrast.to_owned(),
            suffix: suffix.map(str::to_owned),
            path: PathBuf::from(format!("/data/{name}")),
        }
    }

    fn demo_table() -> FileTable {
        FileTable::new(vec![
            record("sub-01", "T1w", None),
            record("sub-01", "T2w", None),
            record("sub-01", "T1w", Some("_lesion-manual")),
            // sub-02 缺 T2w.
            record("sub-02", "T1w", None),
            record("sub-02", "T1w", Some("_lesion-manual")),
        ])
    }

    fn base_opts<'a>(
        suffixes: &'a [String],
        contrasts: &'a ContrastParams,
        roi: &'a RoiParams,
        objd: &'a ObjectDetectionParams,
    ) -> RegistryOptions<'a> {
        RegistryOptions {
            target_suffixes: suffixes,
            contrasts,
            roi,
            object_detection: objd,
            multichannel: true,
            require_gt: true,
            tolerate_missing: false,
        }
    }

    #[test]
    fn test_multichannel_drops_incomplete_subject() {
        crate::test_util::init_logger();
        let table = demo_table();
        let suffixes = vec!["_lesion-manual".to_owned()];
        let contrasts = ContrastParams {
            contrasts: vec!["T1w".to_owned(), "T2w".to_owned()],
        };
        let (roi, objd) = (RoiParams::default(), ObjectDetectionParams::default());
        let opts = base_opts(&suffixes, &contrasts, &roi, &objd);

        let subjects = vec!["sub-01".to_owned(), "sub-02".to_owned()];
        let reg = PairRegistry::build(&table, &subjects, &opts).unwrap();
        // sub-02 缺 T2w, 被丢弃.
        assert_eq!(reg.len(), 1);
        let pair = &reg.pairs()[0];
        assert_eq!(pair.meta().subject, "sub-01");
        assert_eq!(pair.inputs().len(), 2);
        assert_eq!(pair.gt_filenames().len(), 1);
        assert_eq!(pair.presence_mask(), vec![true, true]);
    }

    #[test]
    fn test_single_contrast_independent_samples() {
        let table = demo_table();
        let suffixes: Vec<String> = vec![];
        let contrasts = ContrastParams {
            contrasts: vec!["T1w".to_owned(), "T2w".to_owned()],
        };
        let (roi, objd) = (RoiParams::default(), ObjectDetectionParams::default());
        let mut opts = base_opts(&suffixes, &contrasts, &roi, &objd);
        opts.multichannel = false;
        opts.require_gt = false;

        let subjects = vec!["sub-01".to_owned(), "sub-02".to_owned()];
        let reg = PairRegistry::build(&table, &subjects, &opts).unwrap();
        // sub-01 两个对比度 + sub-02 的 T1w.
        assert_eq!(reg.len(), 3);
        assert!(reg.pairs().iter().all(|p| p.inputs().len() == 1));
    }

    #[test]
    fn test_tolerate_missing_keeps_subject() {
        let table = demo_table();
        let suffixes = vec!["_lesion-manual".to_owned()];
        let contrasts = ContrastParams {
            contrasts: vec!["T1w".to_owned(), "T2w".to_owned()],
        };
        let (roi, objd) = (RoiParams::default(), ObjectDetectionParams::default());
        let mut opts = base_opts(&suffixes, &contrasts, &roi, &objd);
        opts.tolerate_missing = true;

        let subjects = vec!["sub-02".to_owned()];
        let reg = PairRegistry::build(&table, &subjects, &opts).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.pairs()[0].presence_mask(), vec![true, false]);
    }

    #[test]
    fn test_empty_dataset_fails_loudly() {
        let table = demo_table();
        let suffixes = vec!["_nonexistent".to_owned()];
        let contrasts = ContrastParams {
            contrasts: vec!["T1w".to_owned()],
        };
        let (roi, objd) = (RoiParams::default(), ObjectDetectionParams::default());
        let opts = base_opts(&suffixes, &contrasts, &roi, &objd);

        let subjects = vec!["sub-01".to_owned()];
        let err = PairRegistry::build(&table, &subjects, &opts).unwrap_err();
        assert!(matches!(err, LoaderError::EmptyDataset));
    }

    #[test]
    fn test_missing_roi_drops_subject() {
        let table = demo_table();
        let suffixes = vec!["_lesion-manual".to_owned()];
        let contrasts = ContrastParams {
            contrasts: vec!["T1w".to_owned()],
        };
        let roi = RoiParams {
            suffix: Some("_seg-manual".to_owned()),
            slice_filter_roi: Some(10),
        };
        let objd = ObjectDetectionParams::default();
        let opts = base_opts(&suffixes, &contrasts, &roi, &objd);

        let subjects = vec!["sub-01".to_owned()];
        let err = PairRegistry::build(&table, &subjects, &opts).unwrap_err();
        assert!(matches!(err, LoaderError::EmptyDataset));
    }
}
