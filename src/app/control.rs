use std::io;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::app::config::MonitorConfig;
use crate::app::events::{Intent, IntentSource};
use crate::process::{ExitInfo, ProcessSession, ReadError, SpawnError};
use crate::progress::{LineAssembler, MarkerParser, ProgressModel};
use crate::ui::ProgressSink;

/// ループの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// テスト未実行
    Idle,
    /// テスト実行中、出力をポーリング
    Polling,
    /// 終了（Cancel/Exit 後）
    Finished,
}

/// ループを止めるエラー
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("failed to read operator input: {0}")]
    Input(#[from] io::Error),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

/// テストツールの出力を監視して進捗を更新する
///
/// プロセス、行の組み立て、モデルをすべて単独で所有する。
pub struct ControlLoop<S: ProgressSink> {
    session: ProcessSession,
    assembler: LineAssembler,
    parser: MarkerParser,
    model: ProgressModel,
    sink: S,
    state: LoopState,
    tick_interval: Duration,
    /// tick 中に届いた要求（次の周回で最優先に処理）
    pending: Option<Intent>,
    exit_when_done: bool,
    clear_log_on_start: bool,
}

impl<S: ProgressSink> ControlLoop<S> {
    pub fn new(session: ProcessSession, sink: S) -> Self {
        let defaults = MonitorConfig::default();
        Self {
            session,
            assembler: LineAssembler::with_max_line_len(defaults.max_line_len),
            parser: MarkerParser::new(),
            model: ProgressModel::with_max_log_lines(defaults.max_log_lines),
            sink,
            state: LoopState::Idle,
            tick_interval: defaults.tick_interval(),
            pending: None,
            exit_when_done: defaults.exit_when_done,
            clear_log_on_start: defaults.clear_log_on_start,
        }
    }

    /// 設定から組み立て
    pub fn from_config(config: &MonitorConfig, sink: S) -> Self {
        let session = ProcessSession::new(config.command_spec())
            .with_read_chunk_size(config.read_chunk_size)
            .with_terminate_grace(config.terminate_grace());
        Self {
            assembler: LineAssembler::with_max_line_len(config.max_line_len),
            model: ProgressModel::with_max_log_lines(config.max_log_lines),
            tick_interval: config.tick_interval(),
            exit_when_done: config.exit_when_done,
            clear_log_on_start: config.clear_log_on_start,
            ..Self::new(session, sink)
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// テスト終了でループも終える
    pub fn exit_when_done(mut self, exit_when_done: bool) -> Self {
        self.exit_when_done = exit_when_done;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn model(&self) -> &ProgressModel {
        &self.model
    }

    pub fn session(&self) -> &ProcessSession {
        &self.session
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// 最後に終了したテストの結果
    pub fn last_exit(&self) -> Option<&ExitInfo> {
        self.session.exit_info()
    }

    /// Cancel/Exit まで回し続ける
    ///
    /// `exit_when_done` が有効な場合はテスト終了でも戻り、
    /// 起動失敗はエラーとして返す。
    pub fn run(&mut self, intents: &mut impl IntentSource) -> Result<(), LoopError> {
        info!("Control loop started (tick {:?})", self.tick_interval);
        while self.state != LoopState::Finished {
            let intent = match self.pending.take() {
                Some(intent) => Some(intent),
                None => intents.next_intent(self.tick_interval)?,
            };

            if let Some(intent) = intent {
                if let Err(err) = self.handle(intent) {
                    if self.exit_when_done {
                        self.state = LoopState::Finished;
                        return Err(err.into());
                    }
                    warn!("Start failed, waiting for the operator: {}", err);
                }
            }

            self.tick(intents)?;
        }
        info!("Control loop finished");
        Ok(())
    }

    /// 要求を1つ処理
    pub fn handle(&mut self, intent: Intent) -> Result<(), SpawnError> {
        debug!("Intent {:?} in state {:?}", intent, self.state);
        match intent {
            Intent::Start => self.start(),
            Intent::Stop => {
                self.stop();
                Ok(())
            }
            Intent::Cancel | Intent::Exit => {
                self.shutdown();
                Ok(())
            }
        }
    }

    /// テスト開始（実行中なら止めてから再起動）
    pub fn start(&mut self) -> Result<(), SpawnError> {
        if self.state == LoopState::Finished {
            return Ok(());
        }
        if self.session.is_running() {
            self.note("Restarting test");
        }
        if self.clear_log_on_start {
            self.model.clear_log();
        }
        self.assembler.reset();
        self.reset_progress();

        match self.session.start() {
            Ok(()) => {
                self.state = LoopState::Polling;
                let command = self.session.spec().command.clone();
                self.note(format!("Started: {}", command));
                Ok(())
            }
            Err(err) => {
                error!("Failed to start test: {}", err);
                self.state = LoopState::Idle;
                if err.is_missing_program() {
                    self.note(format!("Test tool not found or not executable: {}", err));
                } else {
                    self.note(format!("Failed to start test: {}", err));
                }
                Err(err)
            }
        }
    }

    /// テスト停止、進捗をリセットして待機
    ///
    /// 子プロセスが SIGTERM を無視すると猶予時間いっぱいまで戻らない。
    pub fn stop(&mut self) {
        if self.state == LoopState::Finished {
            return;
        }
        if self.session.is_running() {
            self.session.terminate();
            self.note("Test stopped");
        }
        self.assembler.reset();
        self.reset_progress();
        self.state = LoopState::Idle;
    }

    /// テストを止めてループを終了状態にする（何度呼んでもよい）
    ///
    /// `stop` と同じく猶予時間ぶん待つことがある。
    pub fn shutdown(&mut self) {
        self.session.terminate();
        self.assembler.reset();
        self.pending = None;
        self.state = LoopState::Finished;
    }

    /// 1回分のポーリング
    ///
    /// 出力が空になるか閉じられるまで読み続ける。
    /// 読み込みの合間に要求を確認し、
    /// 届いていれば読み込みをやめて次の周回に回す。
    pub fn tick(&mut self, intents: &mut impl IntentSource) -> io::Result<()> {
        while self.state == LoopState::Polling {
            if let Some(intent) = intents.next_intent(Duration::ZERO)? {
                self.pending = Some(intent);
                return Ok(());
            }

            match self.session.try_read_chunk() {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => self.ingest(&chunk),
                Err(ReadError::Closed) => self.session_finished(),
                Err(ReadError::NotRunning) => {
                    warn!("Polling without a running session");
                    self.state = LoopState::Idle;
                }
                Err(ReadError::Io(err)) => {
                    error!("Failed to read test output: {}", err);
                    self.session.terminate();
                    self.assembler.reset();
                    self.note(format!("Lost test output: {}", err));
                    self.state = LoopState::Idle;
                }
            }
        }
        Ok(())
    }

    /// 出力チャンクを行に分けてモデルに反映
    pub fn ingest(&mut self, chunk: &[u8]) {
        for line in self.assembler.feed(chunk) {
            match line {
                Ok(raw) => {
                    let event = self.parser.classify(&raw);
                    if let Some(change) = self.model.apply(event) {
                        self.sink.publish(&change);
                    }
                }
                Err(err) => warn!("Dropping output line: {}", err),
            }
        }
    }

    fn session_finished(&mut self) {
        if !self.assembler.is_empty() {
            debug!(
                "Discarding {} bytes of unterminated output",
                self.assembler.pending_len()
            );
        }
        self.assembler.reset();

        let message = match self.session.finish() {
            Some(info) => format!("Test {}", info),
            None => "Test finished".to_string(),
        };
        info!("{}", message);
        self.note(message);

        self.state = if self.exit_when_done {
            LoopState::Finished
        } else {
            LoopState::Idle
        };
    }

    fn reset_progress(&mut self) {
        for change in self.model.reset_progress() {
            self.sink.publish(&change);
        }
    }

    fn note(&mut self, text: impl Into<String>) {
        let change = self.model.note(text);
        self.sink.publish(&change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandSpec;
    use crate::progress::{ProgressChange, ProgressValue};
    use crate::ui::RecordingSink;
    use std::collections::VecDeque;
    use std::os::unix::io::AsRawFd;
    use std::time::Instant;

    /// 決められた順に要求を返す
    struct ScriptedIntents {
        script: VecDeque<Intent>,
        calls: usize,
    }

    impl ScriptedIntents {
        fn new(script: impl IntoIterator<Item = Intent>) -> Self {
            Self {
                script: script.into_iter().collect(),
                calls: 0,
            }
        }

        fn quiet() -> Self {
            Self::new(Vec::<Intent>::new())
        }
    }

    impl IntentSource for ScriptedIntents {
        fn next_intent(&mut self, timeout: Duration) -> io::Result<Option<Intent>> {
            self.calls += 1;
            match self.script.pop_front() {
                Some(intent) => Ok(Some(intent)),
                None => {
                    std::thread::sleep(timeout);
                    Ok(None)
                }
            }
        }
    }

    const MISSING_TOOL: &str = "/nonexistent/tpm2_algtest -s perf";

    fn control(command: &str) -> ControlLoop<RecordingSink> {
        let session = ProcessSession::new(CommandSpec::new(command))
            .with_terminate_grace(Duration::from_millis(200));
        ControlLoop::new(session, RecordingSink::new())
            .with_tick_interval(Duration::from_millis(5))
    }

    /// `sh -c` で実行
    fn scripted(script: &str) -> ControlLoop<RecordingSink> {
        control(&shell_words::join(["sh", "-c", script]))
    }

    fn tick_until_idle(control: &mut ControlLoop<RecordingSink>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut quiet = ScriptedIntents::quiet();
        while control.state() == LoopState::Polling {
            assert!(Instant::now() < deadline, "session did not finish");
            control.tick(&mut quiet).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_markers_in_separate_chunks() {
        let mut control = control("true");
        control.ingest(b"*10/100!\n");
        control.ingest(b"|3/100!\n");

        assert_eq!(control.model().primary().get(), 10);
        assert_eq!(control.model().secondary().get(), 3);
        assert_eq!(
            control.sink().changes,
            vec![
                ProgressChange::Primary(ProgressValue::new(10)),
                ProgressChange::Secondary(ProgressValue::new(3)),
            ]
        );
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let mut control = control("true");
        control.ingest(b"*50");
        assert_eq!(control.model().primary().get(), 0);
        control.ingest(b"/100!\n");
        assert_eq!(control.model().primary().get(), 50);
    }

    #[test]
    fn test_noise_and_malformed_lines() {
        let mut control = control("true");
        control.ingest(b"*5/0!\nabc\n*x/10!\n");
        assert_eq!(control.model().primary(), ProgressValue::MIN);
        assert!(control.model().log().is_empty());
        assert!(control.sink().changes.is_empty());
    }

    #[test]
    fn test_tick_while_idle_is_a_no_op() {
        let mut control = control("true");
        let mut intents = ScriptedIntents::quiet();
        control.tick(&mut intents).unwrap();

        assert_eq!(control.state(), LoopState::Idle);
        assert_eq!(intents.calls, 0);
        assert!(control.sink().changes.is_empty());
    }

    #[test]
    fn test_full_session() {
        let mut control = control("printf '*10/100!\\n|3/100!\\nRunning keygen\\n'");
        control.handle(Intent::Start).unwrap();
        assert_eq!(control.state(), LoopState::Polling);

        tick_until_idle(&mut control);

        assert_eq!(control.state(), LoopState::Idle);
        assert_eq!(control.model().primary().get(), 10);
        assert_eq!(control.model().secondary().get(), 3);
        let texts = control.sink().log_texts();
        assert!(texts[0].starts_with("Started: printf"));
        assert!(texts.contains(&"Running keygen"));
        assert_eq!(texts.last().copied(), Some("Test exited with code 0"));
        assert!(control.last_exit().unwrap().success());
    }

    #[test]
    fn test_partial_line_discarded_on_close() {
        let mut control = control("printf 'hello'");
        control.handle(Intent::Start).unwrap();
        tick_until_idle(&mut control);

        assert_eq!(control.state(), LoopState::Idle);
        assert!(!control.sink().log_texts().contains(&"hello"));
        assert!(!control.session().is_running());
    }

    #[test]
    fn test_cancel_mid_tick() {
        let mut control = scripted("while :; do echo '*1/2!'; sleep 0.01; done");
        let mut intents = ScriptedIntents::new([Intent::Start, Intent::Cancel]);

        let started = Instant::now();
        control.run(&mut intents).unwrap();

        assert_eq!(control.state(), LoopState::Finished);
        assert_eq!(control.last_exit(), Some(&ExitInfo::Stopped));
        assert!(started.elapsed() < Duration::from_secs(3));
        // Start, then the Cancel picked up inside the tick; nothing polled afterwards
        assert_eq!(intents.calls, 2);

        // further intents are ignored once finished
        control.handle(Intent::Start).unwrap();
        assert_eq!(control.state(), LoopState::Finished);
        assert!(!control.session().is_running());
    }

    #[test]
    fn test_exit_while_idle() {
        let mut control = control("true");
        control.run(&mut ScriptedIntents::new([Intent::Exit])).unwrap();
        assert_eq!(control.state(), LoopState::Finished);
        assert!(control.last_exit().is_none());
    }

    #[test]
    fn test_stop_resets_progress() {
        let mut control = control("sleep 5");
        control.handle(Intent::Start).unwrap();
        control.ingest(b"*40/100!\n|90/100!\n");
        assert_eq!(control.model().primary().get(), 40);

        control.handle(Intent::Stop).unwrap();
        assert_eq!(control.state(), LoopState::Idle);
        assert_eq!(control.model().primary(), ProgressValue::MIN);
        assert_eq!(control.model().secondary(), ProgressValue::MIN);
        assert_eq!(control.last_exit(), Some(&ExitInfo::Stopped));
        assert_eq!(control.sink().log_texts().last().copied(), Some("Test stopped"));
        assert!(control
            .sink()
            .changes
            .ends_with(&[
                ProgressChange::Primary(ProgressValue::MIN),
                ProgressChange::Secondary(ProgressValue::MIN)
            ]));
    }

    #[test]
    fn test_start_while_running_restarts() {
        let mut control = control("sleep 5");
        control.handle(Intent::Start).unwrap();
        let first = control.session().session_id().cloned().unwrap();

        control.handle(Intent::Start).unwrap();
        let second = control.session().session_id().cloned().unwrap();

        assert_ne!(first, second);
        assert_eq!(control.state(), LoopState::Polling);
        assert!(control.sink().log_texts().contains(&"Restarting test"));
    }

    #[test]
    fn test_missing_tool_stays_idle() {
        let mut control = control(MISSING_TOOL);

        let err = control.handle(Intent::Start).unwrap_err();
        assert!(matches!(err, SpawnError::Spawn { .. }));
        assert!(err.is_missing_program());
        assert_eq!(control.state(), LoopState::Idle);
        assert!(!control.session().is_running());
        assert!(control.sink().log_texts()[0].starts_with("Test tool not found"));

        // the loop keeps going and can still exit normally
        control
            .run(&mut ScriptedIntents::new([Intent::Start, Intent::Exit]))
            .unwrap();
        assert_eq!(control.state(), LoopState::Finished);
    }

    #[test]
    fn test_missing_tool_is_fatal_when_exiting_when_done() {
        let mut control = control(MISSING_TOOL).exit_when_done(true);

        let err = control
            .run(&mut ScriptedIntents::new([Intent::Start]))
            .unwrap_err();
        assert!(matches!(err, LoopError::Spawn(_)));
        assert_eq!(control.state(), LoopState::Finished);
        assert!(control.last_exit().is_none());
    }

    #[test]
    fn test_unparsable_command_reports_failure() {
        let mut control = control("tpm2_algtest 'unterminated");

        let err = control.handle(Intent::Start).unwrap_err();
        assert!(matches!(err, SpawnError::InvalidCommand { .. }));
        assert_eq!(control.state(), LoopState::Idle);
        assert!(control.sink().log_texts()[0].starts_with("Failed to start test"));
    }

    #[test]
    fn test_read_failure_returns_to_idle() {
        let mut control = control("sleep 5");
        control.handle(Intent::Start).unwrap();
        control.ingest(b"*40/");

        // 読み込み側を書き込み専用の fd に差し替えて read を失敗させる
        let fd = control.session().output_fd().unwrap();
        let null = std::fs::OpenOptions::new()
            .write(true)
            .open("/dev/null")
            .unwrap();
        nix::unistd::dup2(null.as_raw_fd(), fd).unwrap();

        control.tick(&mut ScriptedIntents::quiet()).unwrap();

        assert_eq!(control.state(), LoopState::Idle);
        assert!(!control.session().is_running());
        assert_eq!(control.last_exit(), Some(&ExitInfo::Stopped));
        let texts = control.sink().log_texts();
        assert!(texts.last().unwrap().starts_with("Lost test output"));

        // 途中の断片は次の実行に持ち越さない
        control.ingest(b"100!\n");
        assert_eq!(control.model().primary(), ProgressValue::MIN);
    }

    #[test]
    fn test_exit_when_done() {
        let mut control = scripted("printf '*100/100!\\n'; exit 2").exit_when_done(true);
        control.run(&mut ScriptedIntents::new([Intent::Start])).unwrap();

        assert_eq!(control.state(), LoopState::Finished);
        assert_eq!(control.model().primary(), ProgressValue::MAX);
        assert_eq!(control.last_exit().and_then(|info| info.code()), Some(2));
    }

    #[test]
    fn test_from_config() {
        let config = MonitorConfig {
            command: "printf 'one line of text\\n'".to_string(),
            max_log_lines: 1,
            clear_log_on_start: true,
            exit_when_done: true,
            tick_interval_ms: 5,
            ..MonitorConfig::default()
        };
        let mut control = ControlLoop::from_config(&config, RecordingSink::new());
        control.run(&mut ScriptedIntents::new([Intent::Start])).unwrap();

        // capped at one line: only the exit notice survives
        let log: Vec<_> = control.model().log().iter().map(|e| e.text.clone()).collect();
        assert_eq!(log, vec!["Test exited with code 0".to_string()]);
        assert_eq!(control.model().log().dropped(), 2);
    }
}
