pub mod console;

pub use console::ConsoleSink;

use crate::progress::{LogEntry, ProgressChange, ProgressValue};

/// 進捗の表示先
///
/// ControlLoop は状態が変わるたびにここへ通知する。
/// 描画方法は実装側の責任。
pub trait ProgressSink {
    /// 全体の進捗
    fn set_primary_progress(&mut self, value: ProgressValue);
    /// 実行中テストの進捗
    fn set_secondary_progress(&mut self, value: ProgressValue);
    /// ログ1行追加
    fn append_log(&mut self, entry: &LogEntry);

    /// 変更を対応するメソッドに振り分け
    fn publish(&mut self, change: &ProgressChange) {
        match change {
            ProgressChange::Primary(value) => self.set_primary_progress(*value),
            ProgressChange::Secondary(value) => self.set_secondary_progress(*value),
            ProgressChange::Log(entry) => self.append_log(entry),
        }
    }
}

impl<S: ProgressSink + ?Sized> ProgressSink for &mut S {
    fn set_primary_progress(&mut self, value: ProgressValue) {
        (**self).set_primary_progress(value)
    }

    fn set_secondary_progress(&mut self, value: ProgressValue) {
        (**self).set_secondary_progress(value)
    }

    fn append_log(&mut self, entry: &LogEntry) {
        (**self).append_log(entry)
    }
}

/// 変更を記録するだけの表示先（テスト・リプレイ用）
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub changes: Vec<ProgressChange>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 記録されたログ行のテキスト
    pub fn log_texts(&self) -> Vec<&str> {
        self.changes
            .iter()
            .filter_map(|change| match change {
                ProgressChange::Log(entry) => Some(entry.text.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn set_primary_progress(&mut self, value: ProgressValue) {
        self.changes.push(ProgressChange::Primary(value));
    }

    fn set_secondary_progress(&mut self, value: ProgressValue) {
        self.changes.push(ProgressChange::Secondary(value));
    }

    fn append_log(&mut self, entry: &LogEntry) {
        self.changes.push(ProgressChange::Log(entry.clone()));
    }
}
