use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use tracing_subscriber::fmt::MakeWriter;

use crate::app::{Operation, ProgressEvent, ProgressSink};
use crate::error::CampaignError;

const EVENTS_MAX: usize = 8;
const LOGS_MAX: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Progress,
    Logs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Build,
    Store,
    Catalog,
    Tracking,
    Download,
    Merge,
    Report,
}

const PHASES: [Phase; 7] = [
    Phase::Build,
    Phase::Store,
    Phase::Catalog,
    Phase::Tracking,
    Phase::Download,
    Phase::Merge,
    Phase::Report,
];

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Build => "Build",
            Phase::Store => "Store",
            Phase::Catalog => "Catalog",
            Phase::Tracking => "Tracking",
            Phase::Download => "Download",
            Phase::Merge => "Merge",
            Phase::Report => "Report",
        }
    }

    fn index(self) -> usize {
        PHASES
            .iter()
            .position(|phase| *phase == self)
            .unwrap_or_default()
    }
}

#[derive(Debug)]
struct AppState {
    status: String,
    phase: Phase,
    submitters_seen: usize,
    events: VecDeque<String>,
    logs: VecDeque<String>,
    view: View,
    started: Instant,
    active: bool,
    last_elapsed: Option<Duration>,
    deferred: Vec<String>,
}

/// Progress screen shown while one campaign operation runs.
pub struct Tui {
    operation: Operation,
    campaign: String,
    state: Arc<Mutex<AppState>>,
    log_scroll: u16,
    router: LogRouter,
}

/// `MakeWriter` for the tracing subscriber. Lines go to stderr, or to the
/// log pane while a progress screen owns the terminal; those are written to
/// stderr once the screen closes.
#[derive(Clone, Default)]
pub struct LogRouter {
    pane: Arc<Mutex<Option<Arc<Mutex<AppState>>>>>,
}

impl LogRouter {
    fn attach(&self, state: Arc<Mutex<AppState>>) {
        if let Ok(mut pane) = self.pane.lock() {
            *pane = Some(state);
        }
    }

    fn detach(&self) -> Option<Arc<Mutex<AppState>>> {
        self.pane.lock().ok().and_then(|mut pane| pane.take())
    }

    fn route(&self, text: &str) {
        let pane = self.pane.lock().ok().and_then(|pane| pane.clone());
        let Some(state) = pane else {
            let _ = io::stderr().write_all(text.as_bytes());
            return;
        };
        if let Ok(mut state) = state.lock() {
            for line in text.lines().map(str::trim_end).filter(|line| !line.is_empty()) {
                push_bounded(
                    &mut state.logs,
                    format!("[{}] {line}", timestamp()),
                    LOGS_MAX,
                );
                state.deferred.push(line.to_string());
            }
        }
    }
}

/// One formatted log event, routed when dropped.
pub struct LogLine {
    router: LogRouter,
    buffer: Vec<u8>,
}

impl Write for LogLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogLine {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            self.router.route(&String::from_utf8_lossy(&self.buffer));
        }
    }
}

impl<'a> MakeWriter<'a> for LogRouter {
    type Writer = LogLine;

    fn make_writer(&'a self) -> Self::Writer {
        LogLine {
            router: self.clone(),
            buffer: Vec::new(),
        }
    }
}

struct TuiProgress {
    state: Arc<Mutex<AppState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            let message = event.message.trim().to_string();
            if let Some((phase, payload)) = parse_phase(&message) {
                if phase != state.phase && payload.contains(" of ") {
                    state.submitters_seen = 0;
                }
                if payload.contains(" of ") || payload.starts_with("checking ") {
                    state.submitters_seen = state.submitters_seen.saturating_add(1);
                }
                state.phase = phase;
                state.status = payload.to_string();
            } else {
                state.status = message.clone();
            }
            if let Some(elapsed) = event.elapsed {
                state.last_elapsed = Some(elapsed);
            }
            push_bounded(&mut state.events, message.clone(), EVENTS_MAX);
            push_bounded(
                &mut state.logs,
                format!("[{}] {message}", timestamp()),
                LOGS_MAX,
            );
        }
    }
}

impl Tui {
    pub fn new(operation: Operation, campaign: &str) -> Self {
        Self {
            operation,
            campaign: campaign.to_string(),
            state: Arc::new(Mutex::new(AppState {
                status: "starting".to_string(),
                phase: Phase::Build,
                submitters_seen: 0,
                events: VecDeque::new(),
                logs: VecDeque::new(),
                view: View::Progress,
                started: Instant::now(),
                active: false,
                last_elapsed: None,
                deferred: Vec::new(),
            })),
            log_scroll: 0,
            router: LogRouter::default(),
        }
    }

    /// Capture tracing output written through `router` while the screen is up.
    pub fn with_log_router(mut self, router: LogRouter) -> Self {
        self.router = router;
        self
    }

    /// Run `f` on a worker thread while drawing its progress events.
    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, CampaignError> + Send + 'static,
        R: Send + 'static,
    {
        self.set_active(true);

        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        self.router.attach(self.state.clone());
        let (tx, rx) = std::sync::mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        loop {
            if let Ok(state) = self.state.lock() {
                terminal
                    .draw(|frame| draw_ui(frame, self, &state, tick))
                    .into_diagnostic()?;
            }

            if let Ok(result) = rx.try_recv() {
                self.close()?;
                handle.join().ok();
                return result.map_err(miette::Report::new);
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if self.handle_key(key) {
                        break;
                    }
                }
            }

            tick = tick.wrapping_add(1);
        }

        self.close()?;
        Err(miette::Report::msg("aborted"))
    }

    fn close(&self) -> miette::Result<()> {
        self.set_active(false);
        let pane = self.router.detach();
        restore_terminal()?;
        if let Some(state) = pane {
            let deferred = state
                .lock()
                .map(|mut state| std::mem::take(&mut state.deferred))
                .unwrap_or_default();
            let mut stderr = io::stderr();
            for line in deferred {
                let _ = writeln!(stderr, "{line}");
            }
        }
        Ok(())
    }

    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        match key.code {
            KeyCode::Esc | KeyCode::Char('q') => return true,
            KeyCode::F(4) | KeyCode::Char('l') => self.toggle_logs(),
            KeyCode::PageUp => self.log_scroll = self.log_scroll.saturating_sub(5),
            KeyCode::PageDown => self.log_scroll = self.log_scroll.saturating_add(5),
            _ => {}
        }
        false
    }

    fn toggle_logs(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.view = match state.view {
                View::Progress => View::Logs,
                View::Logs => View::Progress,
            };
        }
    }

    fn set_active(&self, active: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.active = active;
            if active {
                state.started = Instant::now();
            }
        }
    }
}

fn restore_terminal() -> miette::Result<()> {
    disable_raw_mode().into_diagnostic()?;
    let mut stdout = io::stdout();
    stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
    Ok(())
}

fn draw_ui(frame: &mut ratatui::Frame, tui: &Tui, state: &AppState, tick: usize) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(1),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(tui, tick), chunks[0]);
    match state.view {
        View::Progress => frame.render_widget(draw_status_panel(state), chunks[1]),
        View::Logs => frame.render_widget(draw_logs_view(state, tui.log_scroll), chunks[1]),
    }
    let footer = Paragraph::new(Line::from(Span::styled(
        "q/Esc abort · l/F4 logs · PgUp/PgDn scroll",
        Style::default().fg(Color::Gray),
    )));
    frame.render_widget(footer, chunks[2]);
}

fn draw_header(tui: &Tui, tick: usize) -> Paragraph<'static> {
    let pulse = if tick % 2 == 0 { "*" } else { " " };
    let line = Line::from(vec![
        Span::styled(
            "GCM",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw(format!("   Campaign: {}   Op: ", tui.campaign)),
        Span::styled(tui.operation.label(), Style::default().fg(Color::Cyan)),
        Span::raw("   "),
        Span::styled(pulse, Style::default().fg(Color::Green)),
    ]);
    Paragraph::new(vec![line])
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_status_panel(state: &AppState) -> Paragraph<'static> {
    let phase_color = if state.active {
        Color::Cyan
    } else {
        Color::Green
    };
    let elapsed = state
        .last_elapsed
        .unwrap_or_else(|| state.started.elapsed());
    let mut lines = vec![
        Line::from(Span::styled(
            "STATUS / PROGRESS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(vec![
            Span::styled("Phase: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!("{:<9}", state.phase.label()),
                Style::default().fg(phase_color),
            ),
            Span::raw(progress_bar(state.phase)),
        ]),
        Line::from(vec![
            Span::styled("Now: ", Style::default().fg(Color::Gray)),
            Span::raw(state.status.clone()),
        ]),
        Line::from(vec![
            Span::styled("Submitters in phase: ", Style::default().fg(Color::Gray)),
            Span::raw(state.submitters_seen.to_string()),
            Span::styled("   Elapsed: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{:.1}s", elapsed.as_secs_f64())),
            Span::styled("   Log lines: ", Style::default().fg(Color::Gray)),
            Span::raw(state.deferred.len().to_string()),
        ]),
        Line::from(Span::styled(
            "Recent events:",
            Style::default().fg(Color::Gray),
        )),
    ];
    for event in state.events.iter().rev() {
        lines.push(Line::from(format!("- {event}")));
    }
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::NONE))
        .wrap(Wrap { trim: true })
}

fn draw_logs_view(state: &AppState, scroll: u16) -> Paragraph<'static> {
    let lines = state
        .logs
        .iter()
        .map(|line| Line::from(line.clone()))
        .collect::<Vec<_>>();
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Logs"))
        .scroll((scroll, 0))
        .wrap(Wrap { trim: false })
}

fn progress_bar(phase: Phase) -> String {
    let mut out = String::from("[");
    for (i, step) in PHASES.iter().enumerate() {
        out.push(if i <= phase.index() { '#' } else { '.' });
        if *step == Phase::Report {
            break;
        }
    }
    out.push(']');
    out
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (label, payload) = rest.split_once(';')?;
    let phase = PHASES.iter().copied().find(|phase| phase.label() == label)?;
    Some((phase, payload.trim()))
}

fn push_bounded(buffer: &mut VecDeque<String>, item: String, max: usize) {
    buffer.push_back(item);
    while buffer.len() > max {
        buffer.pop_front();
    }
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}
