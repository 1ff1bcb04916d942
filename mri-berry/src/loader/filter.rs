//! 2D 切片过滤器.

use ndarray::ArrayView2;

/// 切片保留/丢弃判定. 纯谓词, 无副作用.
///
/// 在数据集索引构建时对每个候选切片求值一次 (而不是取 batch 时),
/// 使过滤代价只支付一次.
#[derive(Debug, Clone, Copy)]
pub struct SliceFilter {
    /// 任一输入通道全空时丢弃切片.
    pub filter_empty_input: bool,

    /// 真值掩码全为背景时丢弃切片.
    pub filter_empty_mask: bool,

    /// ROI 掩码非零像素数不超过该阈值时丢弃切片. `None` 关闭 ROI 过滤.
    ///
    /// 仅当变换流水线确实做 ROI 裁剪时才应开启, 分派器负责强制这一点.
    pub filter_roi: Option<usize>,
}

impl Default for SliceFilter {
    fn default() -> Self {
        Self {
            filter_empty_input: true,
            filter_empty_mask: false,
            filter_roi: None,
        }
    }
}

#[inline]
fn is_empty(slice: &ArrayView2<f32>) -> bool {
    slice.iter().all(|&v| v == 0.0)
}

impl SliceFilter {
    /// 判定一个候选切片是否保留.
    ///
    /// `inputs` 为该切片所有输入通道; `gt` 为真值通道 (推理模式下可为空);
    /// `roi` 为已注册的 ROI 掩码切片 (未配置 ROI 时为 `None`).
    pub fn keep(
        &self,
        inputs: &[ArrayView2<f32>],
        gt: &[ArrayView2<f32>],
        roi: Option<&ArrayView2<f32>>,
    ) -> bool {
        if self.filter_empty_mask && !gt.is_empty() && gt.iter().all(is_empty) {
            return false;
        }

        if self.filter_empty_input && inputs.iter().any(is_empty) {
            return false;
        }

        if let Some(threshold) = self.filter_roi {
            match roi {
                Some(r) => {
                    let nonzero = r.iter().filter(|&&v| v != 0.0).count();
                    if nonzero <= threshold {
                        return false;
                    }
                }
                // 配置了 ROI 过滤却没有 ROI 切片, 属于上游接线错误.
                None => panic!("开启了 ROI 过滤但切片没有 ROI 掩码"),
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::SliceFilter;
    use ndarray::Array2;

    fn zeros() -> Array2<f32> {
        Array2::zeros((4, 4))
    }

    fn ones() -> Array2<f32> {
        Array2::from_elem((4, 4), 1.0)
    }

    #[test]
    fn test_empty_mask_never_kept() {
        let f = SliceFilter {
            filter_empty_mask: true,
            filter_empty_input: false,
            filter_roi: None,
        };
        let (im, gt) = (ones(), zeros());
        assert!(!f.keep(&[im.view()], &[gt.view()], None));

        // 真值非空则保留.
        let gt = ones();
        assert!(f.keep(&[im.view()], &[gt.view()], None));

        // 推理模式 (无真值) 不受 filter_empty_mask 影响.
        assert!(f.keep(&[im.view()], &[], None));
    }

    #[test]
    fn test_empty_input_any_channel() {
        let f = SliceFilter::default();
        let (a, b) = (ones(), zeros());
        // 任一通道全空即丢弃.
        assert!(!f.keep(&[a.view(), b.view()], &[], None));
        assert!(f.keep(&[a.view()], &[], None));
    }

    #[test]
    fn test_roi_threshold() {
        let f = SliceFilter {
            filter_empty_input: false,
            filter_empty_mask: false,
            filter_roi: Some(3),
        };
        let im = ones();
        let mut roi = zeros();
        roi[(0, 0)] = 1.0;
        roi[(0, 1)] = 1.0;
        roi[(0, 2)] = 1.0;
        // 非零数 3 <= 阈值 3: 丢弃.
        assert!(!f.keep(&[im.view()], &[], Some(&roi.view())));
        roi[(0, 3)] = 1.0;
        assert!(f.keep(&[im.view()], &[], Some(&roi.view())));
    }

    #[test]
    #[should_panic]
    fn test_roi_filter_without_roi() {
        let f = SliceFilter {
            filter_empty_input: false,
            filter_empty_mask: false,
            filter_roi: Some(0),
        };
        let im = ones();
        f.keep(&[im.view()], &[], None);
    }
}
