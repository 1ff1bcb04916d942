//! 切片的内存缓存表示.
//!
//! 数据集索引在构建时缓存全部切片像素. 对大数据集可选用压缩形态,
//! 以 zlib 压缩后的字节流保存, 取样时解压.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use ndarray::{Array2, ArrayView2};
use std::io::{Read, Write};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::Idx2d;

/// 拥有所有权的 `f32` 2D 切片.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug)]
pub struct OwnedSlice {
    data: Array2<f32>,
}

impl OwnedSlice {
    /// 从任意布局的视图复制创建. 复制结果为标准布局.
    pub fn copy_from(view: ArrayView2<f32>) -> Self {
        Self {
            data: view.to_owned(),
        }
    }

    /// 获得不可变视图.
    #[inline]
    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    /// 直接获得底层数据.
    #[inline]
    pub fn into_raw(self) -> Array2<f32> {
        self.data
    }

    /// 压缩数据.
    pub fn compress(&self) -> CompactSlice {
        debug_assert!(self.data.is_standard_layout());
        let mut e = ZlibEncoder::new(Vec::with_capacity(8), Compression::best());
        for &v in self.data.iter() {
            e.write_all(&v.to_le_bytes()).expect("Compression error");
        }
        CompactSlice {
            buf: e.finish().expect("Compression error"),
            sh: self.data.dim(),
        }
    }
}

/// 压缩存储的 [`OwnedSlice`]; 不透明类型.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct CompactSlice {
    /// 压缩的不透明字节流.
    buf: Vec<u8>,

    /// 形状.
    sh: Idx2d,
}

impl CompactSlice {
    /// 解压缩数据.
    pub fn decompress(&self) -> OwnedSlice {
        let (h, w) = self.sh;
        let mut d = ZlibDecoder::new(self.buf.as_slice());
        let mut bytes = Vec::with_capacity(h * w * 4);
        d.read_to_end(&mut bytes).expect("Decompression error");
        debug_assert_eq!(bytes.len(), h * w * 4);

        let data: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let data = Array2::from_shape_vec((h, w), data).unwrap();
        OwnedSlice { data }
    }
}

/// 切片载荷: 普通形态或压缩形态.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    /// 直接缓存.
    Plain(Vec<OwnedSlice>),

    /// 压缩缓存.
    Compact(Vec<CompactSlice>),
}

impl Payload {
    pub(crate) fn build<'a, I>(slices: I, compressed: bool) -> Self
    where
        I: IntoIterator<Item = ArrayView2<'a, f32>>,
    {
        let owned = slices.into_iter().map(OwnedSlice::copy_from);
        if compressed {
            Self::Compact(owned.map(|s| s.compress()).collect())
        } else {
            Self::Plain(owned.collect())
        }
    }

    /// 取出全部通道 (压缩形态会在此处解压).
    pub(crate) fn fetch(&self) -> Vec<Array2<f32>> {
        match self {
            Self::Plain(v) => v.iter().map(|s| s.data.clone()).collect(),
            Self::Compact(v) => v.iter().map(|s| s.decompress().into_raw()).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Plain(v) => v.len(),
            Self::Compact(v) => v.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::OwnedSlice;
    use ndarray::Array2;

    #[test]
    fn test_compress_roundtrip() {
        let data = Array2::from_shape_fn((7, 5), |(h, w)| (h * 5 + w) as f32 / 3.0);
        let owned = OwnedSlice::copy_from(data.view());
        let back = owned.compress().decompress();
        assert_eq!(back.view(), data.view());
    }

    #[test]
    fn test_compact_smaller_on_sparse() {
        // 稀疏切片压缩后显著小于原始字节数.
        let data = Array2::<f32>::zeros((64, 64));
        let compact = OwnedSlice::copy_from(data.view()).compress();
        assert!(compact.buf.len() < 64 * 64 * 4 / 8);
    }
}
