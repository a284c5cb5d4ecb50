//! 记忆窗口
//!
//! `slice(log, window)` 是纯函数：window ≤ 0（约定用 -1）返回完整日志，
//! window = N > 0 返回最后 N 条，顺序为旧到新。

use crate::memory::Message;

/// 不限窗口
pub const UNLIMITED: i64 = -1;

/// 按窗口截取历史
pub fn slice(log: &[Message], window: i64) -> Vec<Message> {
    log[start_index(log.len(), window)..].to_vec()
}

/// 借用版本，避免在调度打分时复制整段历史
pub fn slice_ref(log: &[Message], window: i64) -> &[Message] {
    &log[start_index(log.len(), window)..]
}

/// 多个角色共享一次快照时需要读取的最大窗口：任一角色不限则不限
pub fn widest(windows: impl IntoIterator<Item = i64>) -> i64 {
    let mut widest = 0;
    for w in windows {
        if w <= 0 {
            return UNLIMITED;
        }
        widest = widest.max(w);
    }
    if widest == 0 {
        UNLIMITED
    } else {
        widest
    }
}

fn start_index(len: usize, window: i64) -> usize {
    if window <= 0 {
        return 0;
    }
    len.saturating_sub(window as usize)
}
