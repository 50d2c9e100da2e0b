use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// オペレーターからの要求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// テスト開始（実行中なら再起動）
    Start,
    /// テスト停止（アプリは継続）
    Stop,
    /// 中断して終了
    Cancel,
    /// 終了
    Exit,
}

/// キー入力から要求に変換
pub fn intent_for_key(key: KeyEvent) -> Option<Intent> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    match (key.code, key.modifiers) {
        (KeyCode::Char('c'), KeyModifiers::CONTROL) => Some(Intent::Cancel),
        (KeyCode::Esc, _) => Some(Intent::Cancel),
        (KeyCode::Char('r') | KeyCode::Enter, _) => Some(Intent::Start),
        (KeyCode::Char('s'), _) => Some(Intent::Stop),
        (KeyCode::Char('q'), _) => Some(Intent::Exit),
        _ => None,
    }
}

/// 要求の供給元
///
/// `timeout` まで待って要求がなければ `None` を返す。
/// `Duration::ZERO` の場合は待たずに確認だけする。
pub trait IntentSource {
    fn next_intent(&mut self, timeout: Duration) -> std::io::Result<Option<Intent>>;
}

/// ターミナルのキー入力
#[derive(Debug, Default)]
pub struct TerminalIntents;

impl TerminalIntents {
    pub fn new() -> Self {
        Self
    }
}

impl IntentSource for TerminalIntents {
    fn next_intent(&mut self, timeout: Duration) -> std::io::Result<Option<Intent>> {
        if event::poll(timeout)? {
            match event::read()? {
                Event::Key(key) => Ok(intent_for_key(key)),
                _ => Ok(None),
            }
        } else {
            Ok(None)
        }
    }
}

/// キーボードなしの実行
///
/// 最初に一度だけ Start を出す。
/// 以後は Ctrl-C のフラグを見て Cancel を出す。
#[derive(Debug)]
pub struct HeadlessIntents {
    started: bool,
    cancel: Arc<AtomicBool>,
}

impl HeadlessIntents {
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self {
            started: false,
            cancel,
        }
    }
}

impl IntentSource for HeadlessIntents {
    fn next_intent(&mut self, timeout: Duration) -> std::io::Result<Option<Intent>> {
        if !self.started {
            self.started = true;
            return Ok(Some(Intent::Start));
        }
        if self.cancel.load(Ordering::SeqCst) {
            return Ok(Some(Intent::Cancel));
        }
        if !timeout.is_zero() {
            std::thread::sleep(timeout);
        }
        Ok(None)
    }
}
