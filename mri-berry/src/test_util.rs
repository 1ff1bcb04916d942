//! 测试公用小工具.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Once;

static SEQ: AtomicU32 = AtomicU32::new(0);
static LOG_INIT: Once = Once::new();

/// 初始化测试日志, 多次调用安全.
pub fn init_logger() {
    LOG_INIT.call_once(|| {
        simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Debug)
            .init()
            .unwrap();
    });
}

/// 创建并返回一个本测试进程独有的临时目录.
pub fn tmp_dir(tag: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!(
        "mri-berry-test-{}-{}-{}",
        tag,
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&p).unwrap();
    p
}
