use tracing::Level;

/// Maps a `chat.log_level` value to a tracing level. Unknown names mean `INFO`.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Install the fmt subscriber at `level`, writing to stderr.
///
/// stdout belongs to the chat console. Later calls are ignored, so tests and
/// both CLI subcommands can call this freely.
pub fn init(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
