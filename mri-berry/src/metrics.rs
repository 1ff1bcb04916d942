//! 评估指标的逐样本累积.
//!
//! 指标函数是纯函数 `(预测, 真值) -> f64`; [`MetricManager`] 逐样本
//! 累积各指标取值, 最终给出各指标的均值. 无定义的取值 (如空真值上的
//! Dice) 以 `NaN` 表示, 求均值时被跳过.

use std::collections::HashMap;

use ndarray::ArrayViewD;

/// 指标函数: 预测与真值取值均在 \[0, 1\], 形状一致.
pub type MetricFn = fn(&ArrayViewD<f32>, &ArrayViewD<f32>) -> f64;

/// 以 0.5 为界的四格计数 (tp, fp, fn, tn).
fn confusion(pred: &ArrayViewD<f32>, gt: &ArrayViewD<f32>) -> (f64, f64, f64, f64) {
    assert_eq!(pred.shape(), gt.shape(), "预测与真值形状必须一致");
    let (mut tp, mut fp, mut fal, mut tn) = (0.0, 0.0, 0.0, 0.0);
    for (&p, &g) in pred.iter().zip(gt.iter()) {
        match (p > 0.5, g > 0.5) {
            (true, true) => tp += 1.0,
            (true, false) => fp += 1.0,
            (false, true) => fal += 1.0,
            (false, false) => tn += 1.0,
        }
    }
    (tp, fp, fal, tn)
}

/// Dice 系数. 预测与真值均为空时无定义, 返回 `NaN`.
pub fn dice_score(pred: &ArrayViewD<f32>, gt: &ArrayViewD<f32>) -> f64 {
    let (tp, fp, fal, _) = confusion(pred, gt);
    let denom = 2.0 * tp + fp + fal;
    if denom == 0.0 {
        f64::NAN
    } else {
        2.0 * tp / denom
    }
}

/// 精确率. 无正预测时返回 `NaN`.
pub fn precision_score(pred: &ArrayViewD<f32>, gt: &ArrayViewD<f32>) -> f64 {
    let (tp, fp, ..) = confusion(pred, gt);
    if tp + fp == 0.0 {
        f64::NAN
    } else {
        tp / (tp + fp)
    }
}

/// 召回率. 真值为空时返回 `NaN`.
pub fn recall_score(pred: &ArrayViewD<f32>, gt: &ArrayViewD<f32>) -> f64 {
    let (tp, _, fal, _) = confusion(pred, gt);
    if tp + fal == 0.0 {
        f64::NAN
    } else {
        tp / (tp + fal)
    }
}

/// 特异度. 真值全为前景时返回 `NaN`.
pub fn specificity_score(pred: &ArrayViewD<f32>, gt: &ArrayViewD<f32>) -> f64 {
    let (_, fp, _, tn) = confusion(pred, gt);
    if tn + fp == 0.0 {
        f64::NAN
    } else {
        tn / (tn + fp)
    }
}

/// 体素级均方误差.
pub fn mse_score(pred: &ArrayViewD<f32>, gt: &ArrayViewD<f32>) -> f64 {
    assert_eq!(pred.shape(), gt.shape(), "预测与真值形状必须一致");
    let n = pred.len() as f64;
    pred.iter()
        .zip(gt.iter())
        .map(|(&p, &g)| (f64::from(p) - f64::from(g)).powi(2))
        .sum::<f64>()
        / n
}

/// 常用分割指标全家桶.
pub fn segmentation_metrics() -> Vec<(String, MetricFn)> {
    vec![
        ("dice".to_owned(), dice_score as MetricFn),
        ("precision".to_owned(), precision_score),
        ("recall".to_owned(), recall_score),
        ("specificity".to_owned(), specificity_score),
        ("mse".to_owned(), mse_score),
    ]
}

/// 指标累积器.
pub struct MetricManager {
    metrics: Vec<(String, MetricFn)>,
    values: Vec<Vec<f64>>,
}

impl MetricManager {
    /// 以一组命名指标函数创建.
    pub fn new(metrics: Vec<(String, MetricFn)>) -> Self {
        let values = vec![Vec::new(); metrics.len()];
        Self { metrics, values }
    }

    /// 累积一个 (预测, 真值) 样本对.
    pub fn accumulate(&mut self, pred: &ArrayViewD<f32>, gt: &ArrayViewD<f32>) {
        for ((_, f), values) in self.metrics.iter().zip(&mut self.values) {
            values.push(f(pred, gt));
        }
    }

    /// 累积一批样本对. 指标函数是纯函数, 逐样本取值可安全并行求出;
    /// 追加顺序与 `batch` 一致.
    pub fn accumulate_batch(&mut self, batch: &[(ArrayViewD<f32>, ArrayViewD<f32>)]) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "rayon")] {
                use rayon::prelude::*;
                let rows: Vec<Vec<f64>> = batch
                    .par_iter()
                    .map(|(pred, gt)| self.metrics.iter().map(|(_, f)| f(pred, gt)).collect())
                    .collect();
            } else {
                let rows: Vec<Vec<f64>> = batch
                    .iter()
                    .map(|(pred, gt)| self.metrics.iter().map(|(_, f)| f(pred, gt)).collect())
                    .collect();
            }
        }
        for row in rows {
            for (values, v) in self.values.iter_mut().zip(row) {
                values.push(v);
            }
        }
    }

    /// 已累积的样本个数.
    pub fn len(&self) -> usize {
        self.values.first().map_or(0, Vec::len)
    }

    /// 是否尚未累积任何样本.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 各指标在全部已累积样本上的均值. `NaN` 取值不计入均值;
    /// 全为 `NaN` 的指标结果为 `NaN`.
    pub fn results(&self) -> HashMap<String, f64> {
        self.metrics
            .iter()
            .zip(&self.values)
            .map(|((name, _), values)| {
                let finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
                let mean = if finite.is_empty() {
                    f64::NAN
                } else {
                    finite.iter().sum::<f64>() / finite.len() as f64
                };
                (name.clone(), mean)
            })
            .collect()
    }

    /// 清空已累积的取值, 保留指标表.
    pub fn reset(&mut self) {
        for values in &mut self.values {
            values.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn arr(values: &[f32]) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap()
    }

    #[test]
    fn test_dice_perfect_and_disjoint() {
        let a = arr(&[1.0, 1.0, 0.0, 0.0]);
        let b = arr(&[0.0, 0.0, 1.0, 1.0]);
        assert_eq!(dice_score(&a.view(), &a.view()), 1.0);
        assert_eq!(dice_score(&a.view(), &b.view()), 0.0);

        // 双空时无定义.
        let z = arr(&[0.0, 0.0]);
        assert!(dice_score(&z.view(), &z.view()).is_nan());
    }

    #[test]
    fn test_precision_recall() {
        let pred = arr(&[1.0, 1.0, 0.0, 0.0]);
        let gt = arr(&[1.0, 0.0, 1.0, 0.0]);
        assert_eq!(precision_score(&pred.view(), &gt.view()), 0.5);
        assert_eq!(recall_score(&pred.view(), &gt.view()), 0.5);
        assert_eq!(specificity_score(&pred.view(), &gt.view()), 0.5);
    }

    #[test]
    fn test_manager_skips_nan() {
        let mut m = MetricManager::new(vec![("dice".to_owned(), dice_score as MetricFn)]);

        let a = arr(&[1.0, 0.0]);
        let z = arr(&[0.0, 0.0]);
        m.accumulate(&a.view(), &a.view());
        // 该样本 Dice 无定义, 不计入均值.
        m.accumulate(&z.view(), &z.view());
        m.accumulate(&a.view(), &z.view());

        assert_eq!(m.len(), 3);
        let res = m.results();
        assert_eq!(res["dice"], 0.5);

        m.reset();
        assert!(m.is_empty());
        assert!(m.results()["dice"].is_nan());
    }

    #[test]
    fn test_mse() {
        let pred = arr(&[0.5, 0.0]);
        let gt = arr(&[1.0, 0.0]);
        assert_eq!(mse_score(&pred.view(), &gt.view()), 0.125);
    }

    #[test]
    fn test_batch_matches_serial() {
        let pred = arr(&[1.0, 1.0, 0.0, 0.0]);
        let gt = arr(&[1.0, 0.0, 1.0, 0.0]);

        let mut serial = MetricManager::new(segmentation_metrics());
        serial.accumulate(&pred.view(), &gt.view());
        serial.accumulate(&gt.view(), &gt.view());

        let mut parallel = MetricManager::new(segmentation_metrics());
        parallel.accumulate_batch(&[
            (pred.view().into_dyn(), gt.view().into_dyn()),
            (gt.view().into_dyn(), gt.view().into_dyn()),
        ]);

        assert_eq!(serial.results(), parallel.results());
    }
}
