#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 提供 BIDS 组织的多模态 MRI 分割数据集的构建逻辑,
//! 以及推理阶段逐切片预测结果的 3D 重建与持久化.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 该 crate 假设数据按 BIDS 模式组织 (解剖像子树 + `derivatives/labels`
//!   真值子树), 文件可用性表由外部 BIDS 解析协作者提供.
//! 2. 在非期望情况下, 程序会直接 panic, 而不会导致内存错误. As what Rust promises.
//! 3. 模型结构、损失函数、训练循环、超参数搜索等均不在本 crate 范围内;
//!   本 crate 消费外部协作者给出的变换流水线与模型预测张量.
//!
//! # 开发计划
//!
//! ### 2D 切片过滤器 ✅
//!
//! 在索引构建时一次性判定切片是否可用 (空输入/空真值/ROI 阈值).
//!
//! 实现位于 `mri-berry/src/loader/filter.rs`.
//!
//! ### 3D 子体块索引器 ✅
//!
//! 给定体数据形状、patch 边长与步长, 计算确定性的行优先 patch
//! 原点序列. 末端原点回拉 (overlap-adjust), 保证全覆盖且不越界.
//!
//! 实现位于 `mri-berry/src/loader/patch.rs`.
//!
//! ### 文件名配对注册表 ✅
//!
//! 每个受试者的输入对比度文件与真值文件的有序对应关系.
//! 缺失文件的受试者被丢弃 (记录日志), 全部丢弃则构建失败.
//!
//! 实现位于 `mri-berry/src/loader/pairs.rs`.
//!
//! ### 数据集分派器 ✅
//!
//! 在配置验证阶段选定 {2D 切片, 3D 子体块, 缺失模态} 三者之一,
//! 之后的代码对封闭变体做穷尽匹配, 不再比较模型名字符串.
//!
//! 实现位于 `mri-berry/src/loader`.
//!
//! ### 输入通道 dropout ✅
//!
//! 随机清零 0 到 `n_channels - 1` 个输入通道, 永远保留至少一个非空通道;
//! 已为常值的通道优先计入配额.
//!
//! 实现位于 `mri-berry/src/loader/dropout.rs`.
//!
//! ### 体数据重建器 ✅
//!
//! 显式的 accumulate/flush 状态机. 按源文件 key 聚集逐切片预测,
//! key 变化或流结束时重组并保存完整体数据; 支持 Monte-Carlo
//! 多次推理与多标签彩色合并.
//!
//! 实现位于 `mri-berry/src/reconstruct`.
//!
//! ### 不确定性图 ✅
//!
//! 读取同一受试者的全部 MC 预测文件, 输出体素级均值/方差/熵.
//!
//! 实现位于 `mri-berry/src/reconstruct/uncertainty.rs`.

/// 二维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx2d = (usize, usize);

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 3D MRI nii 文件基础数据结构.
mod data;

pub use data::{save_rgb_volume, save_volume, save_volume4, MriVolume, SliceAxis, VolumeMeta};

pub mod consts;

pub mod loader;
pub mod metrics;
pub mod reconstruct;
pub mod transform;

pub mod prelude;

#[cfg(test)]
pub(crate) mod test_util;
