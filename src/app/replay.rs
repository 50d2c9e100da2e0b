use std::io::{self, Read};

use tracing::{debug, warn};

use crate::app::config::MonitorConfig;
use crate::progress::{LineAssembler, MarkerParser, ProgressModel};
use crate::ui::ProgressSink;

/// 保存済みの出力をプロセスなしで流し込む
///
/// 末尾の改行なしの行は実行時と同じく捨てる。
pub fn replay(
    mut input: impl Read,
    config: &MonitorConfig,
    sink: &mut impl ProgressSink,
) -> io::Result<ProgressModel> {
    let mut assembler = LineAssembler::with_max_line_len(config.max_line_len);
    let parser = MarkerParser::new();
    let mut model = ProgressModel::with_max_log_lines(config.max_log_lines);
    let mut buf = vec![0; config.read_chunk_size.max(1)];

    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        for line in assembler.feed(&buf[..n]) {
            match line {
                Ok(raw) => {
                    if let Some(change) = model.apply(parser.classify(&raw)) {
                        sink.publish(&change);
                    }
                }
                Err(err) => warn!("Dropping output line: {}", err),
            }
        }
    }

    if !assembler.is_empty() {
        debug!("Discarding {} bytes of unterminated output", assembler.pending_len());
    }
    Ok(model)
}
