//! 多模态体数据 npz 档案.
//!
//! 缺失模态数据集的后备存储: BIDS 数据预先整理为单个 npz 档案,
//! 条目名形如 `{受试者}_{对比度}`, 内容为规范布局 `(z, h, w)` 的
//! `f32` 体数据. 某受试者缺失的模态直接没有对应条目.

use ndarray::{Array3, ArrayView3, Ix3, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, WriteNpzError};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// 打开 [`VolumeArchive`] 错误.
#[derive(Debug)]
pub enum OpenArchiveError {
    /// workers 太大. 最多支持 64.
    TooManyWorkers(u32),

    /// 打开 npz 文件错误.
    ReadNpzError(ReadNpzError),

    /// 其他底层 I/O 错误.
    IoError(std::io::Error),
}

/// 写入档案错误.
#[derive(Debug)]
pub enum WriteArchiveError {
    /// 创建档案文件错误.
    IoError(std::io::Error),

    /// 写入 npz 条目错误.
    WriteNpzError(WriteNpzError),
}

/// 档案条目名 (规范形式, 不带 `.npy`).
#[inline]
fn entry_name(subject: &str, contrast: &str) -> String {
    format!("{subject}_{contrast}")
}

/// 去掉 numpy savez 风格条目名的 `.npy` 尾缀.
#[inline]
fn normalize(name: &str) -> &str {
    name.strip_suffix(".npy").unwrap_or(name)
}

/// 多模态体数据 npz 档案.
///
/// 该结构可用于建模硬盘上已整理的多受试者、多对比度体数据压缩文件.
pub struct VolumeArchive {
    entries: Vec<Mutex<NpzReader<File>>>,
    names: HashSet<String>,
    turn: AtomicUsize,
}

impl VolumeArchive {
    /// 打开档案.
    ///
    /// `workers` 指定了底层工作通道的个数, 最大为 64. 系统会从路径 `p` 打开文件
    /// `workers` 次, 并为每个打开通道指定一个排他入口点 (以期获得更高的并行度).
    pub fn open<P: AsRef<Path>>(workers: NonZeroUsize, p: P) -> Result<Self, OpenArchiveError> {
        let workers = workers.get();
        if workers > 64 {
            return Err(OpenArchiveError::TooManyWorkers(64));
        }
        let mut v = Vec::with_capacity(workers);
        for _ in 0..workers {
            let file = OpenOptions::new()
                .read(true)
                .open(p.as_ref())
                .map_err(OpenArchiveError::IoError)?;
            v.push(Mutex::new(
                NpzReader::new(file).map_err(OpenArchiveError::ReadNpzError)?,
            ));
        }

        // 条目名集合只读取一次, 此后 `contains` 不再触碰文件.
        let names = v[0]
            .lock()
            .unwrap()
            .names()
            .map_err(OpenArchiveError::ReadNpzError)?
            .into_iter()
            .map(|n| normalize(&n).to_owned())
            .collect();

        Ok(Self {
            entries: v,
            names,
            turn: AtomicUsize::new(0),
        })
    }

    /// 档案中是否存在受试者 `subject` 的对比度 `contrast`.
    #[inline]
    pub fn contains(&self, subject: &str, contrast: &str) -> bool {
        self.names.contains(&entry_name(subject, contrast))
    }

    /// 读取受试者 `subject` 的对比度 `contrast` 体数据.
    pub fn volume(&self, subject: &str, contrast: &str) -> Result<Array3<f32>, ReadNpzError> {
        let slot = self.next_slot();
        let name = entry_name(subject, contrast);
        let mut file = self.entries[slot].lock().unwrap();

        // numpy savez 会给条目名追加 `.npy`, 手工生成的档案可能不带;
        // 两种形式都接受.
        match file.by_name::<OwnedRepr<f32>, Ix3>(name.as_str()) {
            Ok(data) => Ok(data),
            Err(_) => file.by_name::<OwnedRepr<f32>, Ix3>(format!("{name}.npy").as_str()),
        }
    }

    /// 获取档案包含的所有规范条目名.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// 工作通道个数.
    #[inline]
    pub fn worker_len(&self) -> usize {
        self.entries.len()
    }

    /// 档案条目个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// 档案是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn next_slot(&self) -> usize {
        self.turn.fetch_add(1, Ordering::Relaxed) % self.worker_len()
    }
}

/// 将多模态体数据写入 npz 档案. 主要用于数据准备与测试.
///
/// `volumes` 的每个元素为 (受试者, 对比度, 规范布局体数据).
pub fn write_archive<P: AsRef<Path>>(
    path: P,
    volumes: &[(String, String, ArrayView3<f32>)],
) -> Result<(), WriteArchiveError> {
    let file = File::create(path.as_ref()).map_err(WriteArchiveError::IoError)?;
    let mut npz = NpzWriter::new(file);
    for (subject, contrast, data) in volumes {
        npz.add_array(entry_name(subject, contrast), data)
            .map_err(WriteArchiveError::WriteNpzError)?;
    }
    npz.finish().map_err(WriteArchiveError::WriteNpzError)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::tmp_dir;
    use ndarray::Array3;

    #[test]
    fn test_archive_roundtrip_and_presence() {
        let dir = tmp_dir("npz-archive");
        let path = dir.join("volumes.npz");

        let t1 = Array3::from_shape_fn((2, 3, 4), |(a, b, c)| (a + b + c) as f32);
        let t2 = &t1 * 2.0;
        write_archive(
            &path,
            &[
                ("sub-01".to_owned(), "T1w".to_owned(), t1.view()),
                ("sub-01".to_owned(), "T2w".to_owned(), t2.view()),
                ("sub-02".to_owned(), "T1w".to_owned(), t1.view()),
            ],
        )
        .unwrap();

        let archive = VolumeArchive::open(NonZeroUsize::new(2).unwrap(), &path).unwrap();
        assert_eq!(archive.worker_len(), 2);
        assert_eq!(archive.len(), 3);

        assert!(archive.contains("sub-01", "T2w"));
        assert!(!archive.contains("sub-02", "T2w"));

        let back = archive.volume("sub-01", "T2w").unwrap();
        assert_eq!(back, t2);
    }

    #[test]
    fn test_too_many_workers() {
        let dir = tmp_dir("npz-workers");
        let path = dir.join("volumes.npz");
        let t1 = Array3::<f32>::zeros((1, 1, 1));
        write_archive(&path, &[("s".to_owned(), "c".to_owned(), t1.view())]).unwrap();

        let Err(err) = VolumeArchive::open(NonZeroUsize::new(65).unwrap(), &path) else {
            panic!("超过 64 个工作通道必须被拒绝");
        };
        assert!(matches!(err, OpenArchiveError::TooManyWorkers(64)));
    }
}
