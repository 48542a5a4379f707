use std::fs;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event;
use crossterm::terminal;
use directories::ProjectDirs;
use serde::Deserialize;
use tracing::{debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};
use wordflow_api::HttpWordService;
use wordflow_core::{
    DocumentWords, ProgressSink, ReaderSession, SessionEvent, SessionOptions, DEFAULT_FONT_SIZE,
    DEFAULT_MAX_WPM, DEFAULT_MIN_WPM, DEFAULT_WPM,
};
use wordflow_tty::{EventMapper, PreviewPane, ReaderScreen, UiEvent};

const DEFAULT_SERVER: &str = "http://127.0.0.1:5000";
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(
    name = "wordflow",
    version,
    about = "word-by-word terminal reader with paced playback"
)]
struct Args {
    /// Document id to read
    doc_id: String,

    /// Base URL of the word/progress API
    #[arg(short = 's', long = "server")]
    server: Option<String>,

    /// Word index to resume from (overrides the saved position)
    #[arg(short = 'r', long = "resume")]
    resume: Option<usize>,

    /// Initial playback rate in words per minute
    #[arg(long = "wpm")]
    wpm: Option<u16>,

    /// Initial display scale in points
    #[arg(long = "font-size")]
    font_size: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    server: Option<String>,
    wpm: Option<u16>,
    font_size: Option<u16>,
    min_wpm: Option<u16>,
    max_wpm: Option<u16>,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, event::DisableFocusChange, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "wordflow", "wordflow")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = load_config(&project_dirs)?;

    let server = args
        .server
        .or(config.server)
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());
    let service = Arc::new(HttpWordService::new(&server)?);
    let sink: Arc<dyn ProgressSink> = service.clone();

    let mut options = SessionOptions::new(args.doc_id.clone());
    options.initial_index = args.resume.unwrap_or(0);
    options.wpm = args.wpm.or(config.wpm).unwrap_or(DEFAULT_WPM);
    options.font_size = args
        .font_size
        .or(config.font_size)
        .unwrap_or(DEFAULT_FONT_SIZE);
    options.min_wpm = config.min_wpm.unwrap_or(DEFAULT_MIN_WPM);
    options.max_wpm = config.max_wpm.unwrap_or(DEFAULT_MAX_WPM);

    let started = Instant::now();
    let (mut session, load_failed) =
        match ReaderSession::load_with(service.as_ref(), sink.clone(), options.clone(), started)
            .await
        {
            Ok(session) => (session, false),
            Err(err) => {
                // The session stays up with zero words so the failure is
                // visible inline; playback cannot start from it.
                warn!(error = ?err, doc = %args.doc_id, "word load failed");
                let inert =
                    ReaderSession::from_document(DocumentWords::default(), sink, options, started);
                (inert, true)
            }
        };

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide, event::EnableFocusChange)?;
    let mut screen = ReaderScreen::new(stdout);
    let mut mapper = EventMapper::new();
    let mut pane = PreviewPane::new();
    let mut dirty = true;
    screen.clear()?;

    loop {
        if dirty {
            let (cols, rows) = terminal::size()?;
            if load_failed {
                screen.draw_error("error loading document", cols, rows)?;
            } else {
                screen.draw(
                    &session.view(),
                    session.words(),
                    session.pagination(),
                    &mut pane,
                    cols,
                    rows,
                    mapper.pending_input().as_deref(),
                )?;
            }
            dirty = false;
        }

        if event::poll(poll_timeout(session.next_deadline(), Instant::now()))? {
            match mapper.map_event(event::read()?) {
                UiEvent::Command(cmd) => {
                    session.apply(cmd, Instant::now());
                    // A clamped command queues no redraw event but still
                    // consumed any digit prefix on the status line.
                    dirty = true;
                }
                UiEvent::Redraw | UiEvent::None => dirty = true,
                UiEvent::Quit => break,
            }
        }
        session.tick(Instant::now()).await;

        for ev in session.take_events() {
            match ev {
                SessionEvent::Redraw => dirty = true,
                SessionEvent::PageChanged { page } => {
                    debug!(page, "active page changed");
                    pane.reset();
                    dirty = true;
                }
                SessionEvent::PlaybackEnded => {
                    debug!("reached the end of the document");
                    dirty = true;
                }
            }
        }
    }

    session.shutdown().await;
    screen.clear()?;
    screen.writer().flush()?;
    Ok(())
}

/// Sleep until the next pacing or autosave deadline, capped so input
/// stays responsive.
fn poll_timeout(deadline: Option<Instant>, now: Instant) -> Duration {
    match deadline {
        Some(deadline) => deadline.saturating_duration_since(now).min(IDLE_POLL),
        None => IDLE_POLL,
    }
}

fn load_config(project_dirs: &ProjectDirs) -> Result<FileConfig> {
    let path = project_dirs.config_dir().join("config.toml");
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {:?}", path))?;
    parse_config(&raw).with_context(|| format!("failed to parse config file {:?}", path))
}

fn parse_config(raw: &str) -> Result<FileConfig> {
    Ok(toml::from_str(raw)?)
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "wordflow.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // File only: stdout belongs to the reader screen.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_fields_are_optional() {
        let config = parse_config("").unwrap();
        assert!(config.server.is_none());

        let config = parse_config(
            r#"
server = "http://reader.local:8000"
wpm = 240
min_wpm = 80
"#,
        )
        .unwrap();
        assert_eq!(config.server.as_deref(), Some("http://reader.local:8000"));
        assert_eq!(config.wpm, Some(240));
        assert_eq!(config.min_wpm, Some(80));
        assert_eq!(config.max_wpm, None);
    }

    #[test]
    fn rejected_command_still_consumes_the_digit_prefix() {
        use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyEventState, KeyModifiers};
        use wordflow_core::Command;

        let mut mapper = EventMapper::new();
        mapper.map_event(Event::Key(KeyEvent {
            code: KeyCode::Char('4'),
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        }));
        assert_eq!(mapper.pending_input().as_deref(), Some("4"));

        let event = mapper.map_event(Event::Key(KeyEvent {
            code: KeyCode::Left,
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        }));
        assert!(matches!(event, UiEvent::Command(Command::StepBack)));
        assert!(mapper.pending_input().is_none());

        // At index 0 the step is rejected and queues no redraw event, so
        // the loop must repaint on its own to drop the stale prefix.
        let mut session = ReaderSession::from_document(
            DocumentWords {
                words: vec!["only".to_string()],
                pages: Vec::new(),
            },
            Arc::new(wordflow_core::MemoryProgressSink::new()),
            SessionOptions::new("doc-1"),
            Instant::now(),
        );
        session.apply(Command::StepBack, Instant::now());
        assert!(session.take_events().is_empty());
    }

    #[test]
    fn poll_timeout_tracks_the_nearest_deadline() {
        let now = Instant::now();
        assert_eq!(poll_timeout(None, now), IDLE_POLL);
        assert_eq!(
            poll_timeout(Some(now + Duration::from_millis(30)), now),
            Duration::from_millis(30)
        );
        // Deadlines further out are capped for input responsiveness.
        assert_eq!(poll_timeout(Some(now + Duration::from_secs(5)), now), IDLE_POLL);
        // An overdue deadline polls without blocking.
        assert_eq!(poll_timeout(Some(now), now), Duration::ZERO);
    }
}
