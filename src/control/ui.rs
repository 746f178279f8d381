use std::collections::VecDeque;
use std::error::Error;
use std::io::stdout;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use crossbeam_channel::unbounded;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Clear, Gauge, Paragraph, Row, Table, Wrap};

use crate::control::api::{self, ConsoleStatus};
use crate::processor::StreamStatus;

const TICK_RATE: Duration = Duration::from_millis(100);
const MESSAGE_LINES: usize = 4;

#[derive(Default)]
struct AppState {
    status: Option<ConsoleStatus>,
    selected: usize,
    mode: Mode,
    messages: VecDeque<String>,
    last_update: Option<Instant>,
}

impl AppState {
    fn message(&mut self, line: impl Into<String>) {
        self.messages.push_back(line.into());
        while self.messages.len() > MESSAGE_LINES {
            self.messages.pop_front();
        }
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    #[default]
    Normal,
    DurationInput,
}

struct DurationEditor {
    buffer: String,
}

/// Run the ratatui-based developer console against the registered processor.
pub fn run() -> Result<(), Box<dyn Error>> {
    setup_terminal()?;

    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let (status_tx, status_rx) = unbounded();
    std::thread::spawn(move || {
        loop {
            let status = api::get_status();
            if status_tx.send(status).is_err() {
                break;
            }
            std::thread::sleep(TICK_RATE);
        }
    });

    let mut app = AppState::default();
    let mut duration_editor: Option<DurationEditor> = None;

    let result = loop {
        if let Err(err) = terminal.draw(|frame| draw(frame, &app, duration_editor.as_ref())) {
            break Err(err.into());
        }

        if let Some(status) = try_recv_latest(&status_rx) {
            app.status = status;
            app.last_update = Some(Instant::now());
            let stream_len = app.status.as_ref().map(|s| s.streams.len()).unwrap_or(0);
            app.selected = app.selected.min(stream_len.saturating_sub(1));
        }
        for line in api::drain_messages() {
            app.message(line);
        }

        match event::poll(Duration::from_millis(10)) {
            Ok(true) => match event::read() {
                Ok(CEvent::Key(key)) => {
                    if handle_key(&mut app, &mut duration_editor, key) {
                        break Ok(());
                    }
                }
                Ok(_) => {}
                Err(err) => break Err(err.into()),
            },
            Ok(false) => {}
            Err(err) => break Err(err.into()),
        }
    };

    restore_terminal()?;
    result
}

fn setup_terminal() -> Result<(), Box<dyn Error>> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    Ok(())
}

fn restore_terminal() -> Result<(), Box<dyn Error>> {
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    Ok(())
}

fn try_recv_latest<T>(rx: &Receiver<T>) -> Option<T> {
    let mut last = None;
    while let Ok(value) = rx.try_recv() {
        last = Some(value);
    }
    last
}

/// Returns `true` when the console should exit.
fn handle_key(
    app: &mut AppState,
    duration_editor: &mut Option<DurationEditor>,
    key: KeyEvent,
) -> bool {
    match app.mode {
        Mode::Normal => match key.code {
            KeyCode::Char('q') => return true,
            KeyCode::Up => {
                if app.selected > 0 {
                    app.selected -= 1;
                    select_current(app);
                }
            }
            KeyCode::Down => {
                if let Some(status) = &app.status {
                    if app.selected + 1 < status.streams.len() {
                        app.selected += 1;
                        select_current(app);
                    }
                }
            }
            KeyCode::Char('t') => {
                if let Some(stream) = current_stream(app) {
                    if api::start_training(stream.id) {
                        app.message(format!("Training started on {}", stream.name));
                    }
                }
            }
            KeyCode::Char('c') => {
                if api::cancel_training() {
                    app.message("Cancel requested");
                }
            }
            KeyCode::Char('r') => {
                if let Some(stream) = current_stream(app) {
                    if api::reset(stream.id) {
                        app.message(format!("{} reset to pass-through", stream.name));
                    }
                }
            }
            KeyCode::Char('a') => {
                if let Some(stream) = current_stream(app) {
                    api::keep_all(stream.id);
                }
            }
            KeyCode::Char('n') => {
                if let Some(stream) = current_stream(app) {
                    api::reject_all(stream.id);
                }
            }
            KeyCode::Char('i') => {
                if let Some(stream) = current_stream(app) {
                    api::invert(stream.id);
                }
            }
            KeyCode::Char(c @ '1'..='9') => {
                if let Some(stream) = current_stream(app) {
                    let component = c as usize - '1' as usize;
                    api::toggle_component(stream.id, component);
                }
            }
            KeyCode::Char('d') => {
                let seconds = app
                    .status
                    .as_ref()
                    .map(|s| s.training_duration_secs)
                    .unwrap_or_default();
                duration_editor.replace(DurationEditor {
                    buffer: format!("{seconds:.0}"),
                });
                app.mode = Mode::DurationInput;
            }
            _ => {}
        },
        Mode::DurationInput => match key.code {
            KeyCode::Esc => {
                duration_editor.take();
                app.mode = Mode::Normal;
            }
            KeyCode::Enter => {
                if let Some(editor) = duration_editor.take() {
                    if let Ok(value) = editor.buffer.trim().parse::<f32>() {
                        if api::set_training_duration(value) {
                            app.message(format!("Training duration set to {value:.0} s"));
                        }
                    }
                }
                app.mode = Mode::Normal;
            }
            KeyCode::Backspace => {
                if let Some(editor) = duration_editor.as_mut() {
                    editor.buffer.pop();
                }
            }
            KeyCode::Char(c) => {
                if let Some(editor) = duration_editor.as_mut() {
                    if c.is_ascii_digit() || c == '.' {
                        editor.buffer.push(c);
                    }
                }
            }
            _ => {}
        },
    }
    false
}

fn current_stream(app: &AppState) -> Option<StreamStatus> {
    app.status.as_ref()?.streams.get(app.selected).cloned()
}

fn select_current(app: &AppState) {
    if let Some(stream) = current_stream(app) {
        api::select_stream(stream.id);
    }
}

fn draw(frame: &mut ratatui::Frame<'_>, app: &AppState, duration_editor: Option<&DurationEditor>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(3),
            Constraint::Length(8),
            Constraint::Length(4 + MESSAGE_LINES as u16),
        ])
        .split(frame.size());

    draw_header(frame, chunks[0], app);
    draw_streams(frame, chunks[1], app);
    draw_progress(frame, chunks[2], app);
    draw_components(frame, chunks[3], app);
    draw_footer(frame, chunks[4], app);

    if let Some(editor) = duration_editor {
        let area = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(0), Constraint::Length(3)])
            .split(frame.size())[1];

        let block = Block::default()
            .title("Training duration (s): Enter to apply, Esc to cancel")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow));

        let paragraph = Paragraph::new(editor.buffer.clone())
            .block(block)
            .wrap(Wrap { trim: false });

        frame.render_widget(Clear, area);
        frame.render_widget(paragraph, area);
    }
}

fn draw_header(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("ICA Console").borders(Borders::ALL);

    let content = if let Some(status) = &app.status {
        let state = if status.training { "training" } else { "idle" };
        let stats = format!(
            "Backend: {}    Duration: {:.0} s    State: {}    {}",
            status.backend, status.training_duration_secs, state, status.last_status,
        );
        Paragraph::new(stats)
    } else {
        Paragraph::new(Line::from(vec![Span::styled(
            "No active processor",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )]))
    };

    frame.render_widget(content.block(block), area);
}

fn draw_streams(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Streams").borders(Borders::ALL);

    let Some(status) = &app.status else {
        frame.render_widget(Paragraph::new("").block(block), area);
        return;
    };

    let header = Row::new(vec![
        Cell::from(""),
        Cell::from("Id"),
        Cell::from("Name"),
        Cell::from("Channels"),
        Cell::from("Fill %"),
        Cell::from("Components"),
        Cell::from("Rejected"),
        Cell::from("Decomposition"),
    ])
    .style(
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    );

    let rows = status.streams.iter().enumerate().map(|(idx, stream)| {
        let indicator = if idx == app.selected { ">" } else { "" };
        let rejected = if stream.dimension == 0 {
            "-".to_string()
        } else {
            one_based(&stream.rejected_components)
        };
        let dir = stream
            .decomposition_dir
            .as_ref()
            .and_then(|d| d.file_name())
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_else(|| "none".into());
        let mut row = Row::new(vec![
            Cell::from(indicator.to_string()),
            Cell::from(stream.id.to_string()),
            Cell::from(stream.name.clone()),
            Cell::from(stream.channels.to_string()),
            Cell::from(stream.percent_full.to_string()),
            Cell::from(stream.dimension.to_string()),
            Cell::from(rejected),
            Cell::from(dir),
        ]);
        if idx == app.selected {
            row = row.style(Style::default().fg(Color::Yellow));
        }
        row
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(2),
            Constraint::Length(6),
            Constraint::Length(20),
            Constraint::Length(10),
            Constraint::Length(8),
            Constraint::Length(12),
            Constraint::Length(16),
            Constraint::Min(20),
        ],
    )
    .header(header)
    .block(block)
    .column_spacing(2);

    frame.render_widget(table, area);
}

fn draw_progress(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let percent = current_stream(app).map(|s| s.percent_full).unwrap_or(0);
    let gauge = Gauge::default()
        .block(Block::default().title("Training data").borders(Borders::ALL))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(u16::from(percent.min(100)));
    frame.render_widget(gauge, area);
}

fn draw_components(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Components").borders(Borders::ALL);
    let (Some(status), Some(stream)) = (&app.status, current_stream(app)) else {
        frame.render_widget(Paragraph::new("").block(block), area);
        return;
    };
    if stream.dimension == 0 {
        frame.render_widget(Paragraph::new("No decomposition (pass-through)").block(block), area);
        return;
    }

    let spans: Vec<Span> = (0..stream.dimension)
        .flat_map(|component| {
            let rejected = stream.rejected_components.contains(&component);
            let norm = status.current_norms.get(component).copied().unwrap_or(0.0);
            let style = if rejected {
                Style::default().fg(Color::Red).add_modifier(Modifier::CROSSED_OUT)
            } else {
                Style::default().fg(Color::Green)
            };
            [
                Span::styled(format!("{} ({norm:.2})", component + 1), style),
                Span::raw("  "),
            ]
        })
        .collect();
    let enabled = format!("Channels: {}", one_based(&stream.enabled_channels));
    let paragraph = Paragraph::new(vec![Line::from(enabled), Line::from(spans)])
        .block(block)
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}

fn one_based(indices: &[usize]) -> String {
    if indices.is_empty() {
        return "none".into();
    }
    indices
        .iter()
        .map(|i| (i + 1).to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn draw_footer(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let info = "Up/Down: Select  •  t: Train  •  c: Cancel  •  r: Reset  •  1-9: Toggle  •  a/n/i: Keep all/None/Invert  •  d: Duration  •  q: Quit";
    let mut lines = vec![Line::from(info)];
    for message in &app.messages {
        lines.push(Line::from(Span::styled(
            message.clone(),
            Style::default().fg(Color::Green),
        )));
    }
    if let Some(updated) = app.last_update {
        let ago = updated.elapsed().as_secs_f32();
        lines.push(Line::from(Span::styled(
            format!("Last update {:.1}s ago", ago),
            Style::default().fg(Color::DarkGray),
        )));
    }

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}
