//! Monte-Carlo 预测的不确定性图.
//!
//! 读取 `pred_masks` 目录内同一受试者的全部 MC 趟预测文件
//! (`*_pred_NN.nii.gz`), 输出体素级均值、方差与熵.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{info, warn};
use ndarray::{stack, Array3, Axis};

use super::ReconstructError;
use crate::consts::NII_GZ_EXT;
use crate::data::{save_volume, MriVolume, VolumeMeta};

/// 若 `name` 形如 `{base}_pred_NN.nii.gz`, 返回 `base`.
fn mc_base(name: &str) -> Option<&str> {
    let stem = name.strip_suffix(NII_GZ_EXT)?;
    let (base, pass) = stem.rsplit_once("_pred_")?;
    (pass.len() == 2 && pass.bytes().all(|b| b.is_ascii_digit())).then_some(base)
}

/// 二值分布的熵, 自然对数.
#[inline]
fn binary_entropy(p: f32) -> f32 {
    let term = |q: f32| if q > 0.0 { q * q.ln() } else { 0.0 };
    -(term(p) + term(1.0 - p))
}

/// 计算 `pred_dir` 内全部受试者的不确定性图.
///
/// 每组至少 2 趟 MC 预测才有意义, 不足的组被跳过并记录日志.
/// 对每组写出三个文件: `{base}_soft.nii.gz` (体素均值),
/// `{base}_unc-vox.nii.gz` (体素方差), `{base}_unc-entropy.nii.gz`
/// (由均值导出的二值熵). 返回成功处理的组数.
pub fn run_uncertainty(pred_dir: &Path) -> Result<usize, ReconstructError> {
    // BTreeMap 保证处理顺序确定.
    let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for entry in std::fs::read_dir(pred_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if let Some(base) = mc_base(&name) {
            groups.entry(base.to_owned()).or_default().push(path);
        }
    }

    let mut processed = 0usize;
    for (base, mut paths) in groups {
        if paths.len() < 2 {
            warn!("Subject {base}: only {} MC pass(es), uncertainty skipped.", paths.len());
            continue;
        }
        paths.sort();

        let mut passes: Vec<MriVolume> = Vec::with_capacity(paths.len());
        let mut skip = false;
        for p in &paths {
            let vol = MriVolume::open(p)?;
            if vol.header().dim[0] != 3 {
                warn!("File {} is not a 3D volume, group {base} skipped.", p.display());
                skip = true;
                break;
            }
            if let Some(first) = passes.first() {
                if vol.shape() != first.shape() {
                    warn!("MC pass shapes differ for {base}, group skipped.");
                    skip = true;
                    break;
                }
            }
            passes.push(vol);
        }
        if skip {
            continue;
        }

        let header = passes[0].header().clone();
        let views: Vec<_> = passes.iter().map(|v| v.data()).collect();
        let stacked = stack(Axis(0), &views).expect("MC 趟形状必须一致");
        let n = stacked.dim().0 as f32;

        let mean = stacked.mean_axis(Axis(0)).unwrap();
        // 总体方差: E[x^2] - E[x]^2.
        let mean_sq = stacked.map_axis(Axis(0), |lane| {
            lane.iter().map(|&v| v * v).sum::<f32>() / n
        });
        let variance = &mean_sq - &(&mean * &mean);
        let entropy: Array3<f32> = mean.mapv(binary_entropy);

        save_volume(mean.view(), &header, pred_dir.join(format!("{base}_soft{NII_GZ_EXT}")))?;
        save_volume(
            variance.view(),
            &header,
            pred_dir.join(format!("{base}_unc-vox{NII_GZ_EXT}")),
        )?;
        save_volume(
            entropy.view(),
            &header,
            pred_dir.join(format!("{base}_unc-entropy{NII_GZ_EXT}")),
        )?;
        info!("Uncertainty maps written for {base} ({} passes).", paths.len());
        processed += 1;
    }
    Ok(processed)
}
