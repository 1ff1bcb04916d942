//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx2d, Idx3d};

pub use crate::data::{save_rgb_volume, save_volume, save_volume4, MriVolume, SliceAxis, VolumeMeta};

pub use crate::consts::{DEFAULT_BIN_THRESHOLD, NII_GZ_EXT, PRED_MASKS_DIR, PRED_SUFFIX};

pub use crate::loader::{
    compute_patch_origins, dropout_input, home_dataset_dir, home_dataset_dir_with, load_dataset,
    ContrastParams, FileRecord, FileTable, FilenamePair, LoaderError, LoaderOptions,
    MissingModalityDataset, ModelCapability, PairRegistry, RoiParams, SampleMeta, SegDataset,
    SegSample, Slice2dDataset, SliceFilter, SubVolumeDataset, VolumeArchive,
};

pub use crate::metrics::{segmentation_metrics, MetricManager};

pub use crate::reconstruct::{
    run_uncertainty, save_volume_prediction, McPass, PatchAssembler, PredictedSlice,
    ReconstructError, ReconstructOptions, VolumeReconstructor,
};

pub use crate::transform::{NoTransform, SampleTransform};
