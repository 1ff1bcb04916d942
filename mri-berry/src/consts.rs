//! 通用常量.

/// 预测输出所在的子目录名.
pub const PRED_MASKS_DIR: &str = "pred_masks";

/// 预测文件名后缀 (不含扩展名).
pub const PRED_SUFFIX: &str = "_pred";

/// 压缩 nifti 文件扩展名.
pub const NII_GZ_EXT: &str = ".nii.gz";

/// 非压缩 nifti 文件扩展名.
pub const NII_EXT: &str = ".nii";

/// 默认二值化阈值. 软真值模式下不做二值化.
pub const DEFAULT_BIN_THRESHOLD: f32 = 0.5;

/// 多标签彩色合并.
pub mod palette {
    /// 标签通道颜色表. 通道数超过表长时循环使用.
    pub const LABEL_COLORS: [[u8; 3]; 6] = [
        [255, 0, 0],
        [0, 255, 0],
        [0, 0, 255],
        [255, 255, 0],
        [0, 255, 255],
        [255, 0, 255],
    ];

    /// 获取第 `i` 个标签通道对应的 RGB 颜色.
    #[inline]
    pub const fn label_color(i: usize) -> [u8; 3] {
        LABEL_COLORS[i % LABEL_COLORS.len()]
    }
}
