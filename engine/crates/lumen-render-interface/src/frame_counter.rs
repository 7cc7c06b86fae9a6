use std::{fmt::Display, ops::Deref};

/// history 的深度：当前帧写一份，上一帧读一份
pub const HISTORY_DEPTH: usize = 2;

pub struct FrameCounter {
    /// 当前的帧序号，一直累加
    frame_id: u64,
}
// new & init
impl FrameCounter {
    pub fn new(init_frame_id: u64) -> Self {
        Self { frame_id: init_frame_id }
    }
}
impl Default for FrameCounter {
    fn default() -> Self {
        Self::new(0)
    }
}
// update
impl FrameCounter {
    #[inline]
    pub fn next_frame(&mut self) {
        self.frame_id = self.frame_id.wrapping_add(1);
    }
}
// getters
impl FrameCounter {
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }
    #[inline]
    pub const fn frame_labels() -> [FrameLabel; HISTORY_DEPTH] {
        [FrameLabel::A, FrameLabel::B]
    }
    /// 当前帧写入的 slot
    #[inline]
    pub fn frame_label(&self) -> FrameLabel {
        FrameLabel::from_usize(self.frame_id as usize % HISTORY_DEPTH)
    }
    /// 上一帧写入的 slot，本帧只读
    #[inline]
    pub fn previous_label(&self) -> FrameLabel {
        FrameLabel::from_usize((self.frame_id as usize + HISTORY_DEPTH - 1) % HISTORY_DEPTH)
    }
    #[inline]
    pub fn frame_name(&self) -> String {
        format!("[F{}{}]", self.frame_id, self.frame_label())
    }
}

/// 帧标签（A/B）
///
/// 表示当前帧使用哪一组 history 资源，通过 `Deref` 转换为索引 0/1。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameLabel {
    A,
    B,
}
impl Deref for FrameLabel {
    type Target = usize;
    #[inline]
    fn deref(&self) -> &Self::Target {
        match self {
            Self::A => &Self::INDEX[0],
            Self::B => &Self::INDEX[1],
        }
    }
}
impl Display for FrameLabel {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}
impl FrameLabel {
    const INDEX: [usize; HISTORY_DEPTH] = [0, 1];

    /// 超出范围的索引按 `HISTORY_DEPTH` 取模
    #[inline]
    pub fn from_usize(idx: usize) -> Self {
        match idx % HISTORY_DEPTH {
            0 => Self::A,
            _ => Self::B,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_alternate() {
        let mut counter = FrameCounter::new(0);
        assert_eq!(counter.frame_label(), FrameLabel::A);
        assert_eq!(counter.previous_label(), FrameLabel::B);

        counter.next_frame();
        assert_eq!(counter.frame_label(), FrameLabel::B);
        assert_eq!(counter.previous_label(), FrameLabel::A);
        assert_eq!(*counter.frame_label(), 1);
        assert_eq!(counter.frame_name(), "[F1B]");
    }
}
