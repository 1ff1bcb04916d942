use std::path::Path;

use ndarray::{Array3, ArrayView, ArrayView2, ArrayView3, ArrayView4, ArrayViewMut, Ix3};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::{Idx2d, Idx3d};

mod axis;

pub use axis::SliceAxis;

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 将 (W, H, z) 转换成 (z, H, W). 以后均按照该模式访问.
#[inline]
fn get_shape_from_header(h: &NiftiHeader) -> Idx3d {
    // [W, H, z]. 体素个数数组.
    let [_, w, h, z, ..] = h.dim;
    (z as usize, h as usize, w as usize)
}

/// 3D nii 文件 header 的共用属性和部分通用操作.
pub trait VolumeMeta {
    /// 获取 header 部分.
    fn header(&self) -> &NiftiHeader;

    /// 获取数据形状大小, 规范布局 `(z, h, w)`.
    #[inline]
    fn shape(&self) -> Idx3d {
        get_shape_from_header(self.header())
    }

    /// 获取数据体素个数.
    #[inline]
    fn size(&self) -> usize {
        let (z, h, w) = self.shape();
        z * h * w
    }

    /// 检查索引是否合法.
    #[inline]
    fn check(&self, (z0, h0, w0): &Idx3d) -> bool {
        let (z, h, w) = self.shape();
        *z0 < z && *h0 < h && *w0 < w
    }

    /// 沿 `axis` 切片时的切片个数.
    #[inline]
    fn len_along(&self, axis: SliceAxis) -> usize {
        axis.len_along(self.shape())
    }

    /// 沿 `axis` 切片时单张切片的形状.
    #[inline]
    fn plane_shape(&self, axis: SliceAxis) -> Idx2d {
        axis.plane_shape(self.shape())
    }

    /// 获取单个体素分辨率. 该分辨率以毫米为单位, 分别代表空间 (相邻切片方向),
    /// 高 (自然图像的垂直方向), 宽 (自然图像的水平方向).
    #[inline]
    fn pix_dim(&self) -> [f64; 3] {
        let [_, w, h, z, ..] = self.header().pixdim;
        [z as f64, h as f64, w as f64]
    }

    /// 获取体素的实际体积值, 以立方毫米为单位.
    #[inline]
    fn voxel(&self) -> f64 {
        self.pix_dim().iter().product()
    }
}

/// nii 格式 3D MRI 体数据, 包括 header 和体素数组. 体素值以 `f32` 保存.
///
/// 该结构同时用于输入对比度像、真值掩码 (可为软真值) 和 ROI 掩码;
/// 真值不单独设类型, 以便软真值模式下保留连续取值.
#[derive(Debug, Clone)]
pub struct MriVolume {
    header: BoxedHeader,
    data: Array3<f32>,
}

impl VolumeMeta for MriVolume {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }
}

impl MriVolume {
    /// 打开 nii 文件格式的 3D 体数据. `path` 为 nii 文件的本地路径.
    /// 如果打开成功, 则返回 `Ok(Self)`, 否则返回 `Err`.
    pub fn open<P: AsRef<Path>>(path: P) -> nifti::Result<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let header = Box::new(obj.header().clone());

        // [W, H, z] -> [z, H, W].
        // hint: 原第一维向下增长, 原第二维向右增长.
        let data = obj
            .into_volume()
            .into_ndarray::<f32>()?
            .permuted_axes([2, 1, 0].as_slice());

        // The nature of nifti data field layout.
        debug_assert!(data.is_standard_layout());

        // 该操作不会生成 `Err`, 可直接 unwrap.
        let data =
            Array3::<f32>::from_shape_vec(get_shape_from_header(&header), data.into_raw_vec())
                .unwrap();

        Ok(Self { header, data })
    }

    /// 根据裸数据和体素分辨率直接创建 `MriVolume` 实体.
    ///
    /// # 参数
    ///
    /// 1. `data` 按照规范布局 \[z, h, w\] 存储.
    /// 2. `pix_dim` 按照 \[w, h, z\] 格式存储, 单位毫米.
    ///
    /// # 注意
    ///
    /// 该方法可能会创建不一致的实体, 因此你应仅将其用于实验目的.
    pub fn fake(data: Array3<f32>, pix_dim: [f32; 3]) -> Self {
        let (z, h, w) = data.dim();

        let mut header = Box::<NiftiHeader>::default();
        header.dim = [3, w as u16, h as u16, z as u16, 1, 1, 1, 1];
        let [_, pw, ph, pz, ..] = &mut header.pixdim;
        let [w_mm, h_mm, z_mm] = &pix_dim;
        (*pw, *ph, *pz) = (*w_mm, *h_mm, *z_mm);
        header.intent_name[..4].copy_from_slice(b"fake");

        Self { header, data }
    }

    /// 判断该结构是否是由 [`MriVolume::fake`] 手动拼接的.
    pub fn is_faked(&self) -> bool {
        self.header.intent_name.starts_with(b"fake")
    }

    /// 将体数据以 nii 格式写入 `path`, header 复用自身 header.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> nifti::Result<()> {
        save_volume(self.data.view(), &self.header, path)
    }

    /// 获取沿 `axis` 的第 `index` 张 2D 切片视图.
    ///
    /// 当 `index` 越界时 panic.
    #[inline]
    pub fn slice_at(&self, axis: SliceAxis, index: usize) -> ArrayView2<'_, f32> {
        self.data.index_axis(axis.canonical_axis(), index)
    }

    /// 获取能按切片索引升序迭代沿 `axis` 2D 切片的迭代器.
    #[inline]
    pub fn slice_iter(&self, axis: SliceAxis) -> impl ExactSizeIterator<Item = ArrayView2<f32>> {
        self.data.axis_iter(axis.canonical_axis())
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, f32, Ix3> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut<'_, f32, Ix3> {
        self.data.view_mut()
    }

    /// 消耗自身, 返回 (header, 规范布局数据).
    #[inline]
    pub fn into_parts(self) -> (Box<NiftiHeader>, Array3<f32>) {
        (self.header, self.data)
    }
}

/// 将规范布局 `(z, h, w)` 的 `f32` 体数据以 nii 格式写入 `path`.
///
/// 写入时换回磁盘布局 `(w, h, z)`, 方向信息从 `reference` header 复制,
/// 数据以 float32 落盘.
pub fn save_volume<P: AsRef<Path>>(
    data: ArrayView3<f32>,
    reference: &NiftiHeader,
    path: P,
) -> nifti::Result<()> {
    // (z, h, w) -> (w, h, z). 该视图的内存序恰为 nifti 的 x-fastest 序.
    let disk = data.permuted_axes([2, 1, 0]);
    nifti::writer::WriterOptions::new(path.as_ref())
        .reference_header(reference)
        .write_nifti(&disk)
}

/// 将 `(l, z, h, w)` 的多标签 `f32` 体数据以 4D nii 格式写入 `path`.
///
/// 磁盘布局为 `(w, h, z, l)`, 即标签通道作为第四维.
pub fn save_volume4<P: AsRef<Path>>(
    data: ArrayView4<f32>,
    reference: &NiftiHeader,
    path: P,
) -> nifti::Result<()> {
    let disk = data.permuted_axes([3, 2, 1, 0]);
    nifti::writer::WriterOptions::new(path.as_ref())
        .reference_header(reference)
        .write_nifti(&disk)
}

/// 将 `(z, h, w, 3)` 的 RGB `u8` 体数据以 4D nii 格式写入 `path`.
///
/// 用于多标签彩色合并输出; 磁盘布局为 `(w, h, z, 3)`.
pub fn save_rgb_volume<P: AsRef<Path>>(
    data: ArrayView4<u8>,
    reference: &NiftiHeader,
    path: P,
) -> nifti::Result<()> {
    assert_eq!(data.dim().3, 3, "RGB 体数据的最后一维必须为 3");
    let disk = data.permuted_axes([2, 1, 0, 3]);
    nifti::writer::WriterOptions::new(path.as_ref())
        .reference_header(reference)
        .write_nifti(&disk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::tmp_dir;
    use ndarray::Array3;

    fn ramp_volume(shape: Idx3d) -> Array3<f32> {
        let (z, h, w) = shape;
        Array3::from_shape_fn((z, h, w), |(a, b, c)| (a * h * w + b * w + c) as f32)
    }

    #[test]
    fn test_fake_volume_meta() {
        let vol = MriVolume::fake(ramp_volume((3, 4, 5)), [1.0, 1.0, 2.5]);
        assert!(vol.is_faked());
        assert_eq!(vol.shape(), (3, 4, 5));
        assert_eq!(vol.size(), 60);
        assert!(vol.check(&(2, 3, 4)));
        assert!(!vol.check(&(3, 0, 0)));
        assert_eq!(vol.pix_dim(), [2.5, 1.0, 1.0]);
        assert_eq!(vol.len_along(SliceAxis::Axial), 3);
        assert_eq!(vol.plane_shape(SliceAxis::Sagittal), (3, 4));
    }

    #[test]
    fn test_slice_at_matches_data() {
        let vol = MriVolume::fake(ramp_volume((3, 4, 5)), [1.0; 3]);
        let sli = vol.slice_at(SliceAxis::Axial, 1);
        assert_eq!(sli.dim(), (4, 5));
        assert_eq!(sli[(0, 0)], 20.0);

        let sag = vol.slice_at(SliceAxis::Sagittal, 2);
        assert_eq!(sag.dim(), (3, 4));
        assert_eq!(sag[(0, 0)], 2.0);
        assert_eq!(sag[(1, 0)], 22.0);
    }

    #[test]
    fn test_save_open_roundtrip() {
        let dir = tmp_dir("data-roundtrip");
        let path = dir.join("ramp.nii.gz");

        let vol = MriVolume::fake(ramp_volume((4, 3, 2)), [1.0; 3]);
        vol.save(&path).unwrap();

        let back = MriVolume::open(&path).unwrap();
        assert_eq!(back.shape(), (4, 3, 2));
        assert_eq!(back.data(), vol.data());
    }
}
