//! TUI dashboard for real-time progress monitoring, rendered from the same
//! `Epic` list and `RunnerResult` the CLI's plain-text `status`/`run`
//! commands use.

use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Wrap},
    Frame, Terminal,
};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use std::io;
use std::time::Duration;
use anyhow::Result;

use crate::runner::RunnerResult;
use crate::types::{Epic, EpicStatus};

/// Dashboard for displaying real-time progress across every tracked epic.
pub struct Dashboard {
    terminal: Terminal<CrosstermBackend<io::Stdout>>,
}

impl Dashboard {
    /// Create a new dashboard
    pub fn new() -> Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend)?;

        Ok(Self { terminal })
    }

    /// Update the dashboard with the current epic list and, once the run has
    /// finished, its final result.
    pub fn update(&mut self, epics: &[Epic], result: Option<&RunnerResult>) -> Result<()> {
        self.terminal.draw(|f| {
            Self::render(f, epics, result);
        })?;

        // Check for quit event
        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.code == KeyCode::Char('q') {
                    std::process::exit(0);
                }
            }
        }

        Ok(())
    }

    fn render(f: &mut Frame, epics: &[Epic], result: Option<&RunnerResult>) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(2)
            .constraints([
                Constraint::Length(3),  // Header
                Constraint::Length(3),  // Progress bar
                Constraint::Length(10), // Stats
                Constraint::Min(0),     // Epic list
            ])
            .split(f.area());

        let header = vec![Line::from(vec![
            Span::styled("\u{23f1} ", Style::default().fg(Color::Yellow)),
            Span::styled(
                "Ticker",
                Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
            ),
            Span::styled(" - driving epics to completion", Style::default().fg(Color::Gray)),
        ])];
        let header = Paragraph::new(header).alignment(Alignment::Center);
        f.render_widget(header, chunks[0]);

        let total = epics.len();
        let closed = epics.iter().filter(|e| e.status == EpicStatus::Closed).count();
        let progress = if total == 0 {
            0.0
        } else {
            closed as f32 / total as f32 * 100.0
        };

        let progress_label = format!("{:.1}% ({}/{})", progress, closed, total);
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).add_modifier(Modifier::BOLD))
            .percent(progress as u16)
            .label(progress_label);
        f.render_widget(gauge, chunks[1]);

        let open = epics.iter().filter(|e| e.status == EpicStatus::Open).count();
        let archived = epics.iter().filter(|e| e.status == EpicStatus::Archived).count();
        let (cost, tokens) = result.map_or((0.0, 0), |r| (r.total_cost, r.total_tokens));

        let stats = vec![
            Line::from(vec![
                Span::styled("Total:    ", Style::default().fg(Color::Gray)),
                Span::styled(format!("{total}"), Style::default().fg(Color::White)),
            ]),
            Line::from(vec![
                Span::styled("Open:     ", Style::default().fg(Color::Gray)),
                Span::styled(format!("{open}"), Style::default().fg(Color::Cyan)),
            ]),
            Line::from(vec![
                Span::styled("Archived: ", Style::default().fg(Color::Gray)),
                Span::styled(format!("{archived}"), Style::default().fg(Color::Yellow)),
            ]),
            Line::from(vec![
                Span::styled("Cost:     ", Style::default().fg(Color::Gray)),
                Span::styled(format!("${cost:.2} ({tokens} tokens)"), Style::default().fg(Color::White)),
            ]),
        ];

        let stats_block =
            Paragraph::new(stats).block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(stats_block, chunks[2]);

        let epics_text: Vec<Line> = epics
            .iter()
            .map(|epic| {
                let symbol = match epic.status {
                    EpicStatus::Closed => "\u{2713}",
                    EpicStatus::Archived => "\u{2205}",
                    EpicStatus::Open => "\u{25cb}",
                };
                Line::from(vec![
                    Span::styled(symbol, Style::default().fg(Color::Green)),
                    Span::raw(" "),
                    Span::styled(&epic.title, Style::default().fg(Color::White)),
                ])
            })
            .collect();

        let epics_block = Paragraph::new(epics_text)
            .block(Block::default().borders(Borders::ALL).title("Epics"))
            .wrap(Wrap { trim: true });
        f.render_widget(epics_block, chunks[3]);
    }

    /// Clean up the terminal
    pub fn cleanup(&mut self) -> Result<()> {
        disable_raw_mode()?;
        execute!(self.terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
        self.terminal.show_cursor()?;
        Ok(())
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

/// Simple non-TUI status printer, used by `ticker status --watch` when the
/// `dashboard` feature isn't compiled in.
pub fn print_status(epics: &[Epic]) {
    let total = epics.len();
    let closed = epics.iter().filter(|e| e.status == EpicStatus::Closed).count();
    let progress = if total == 0 { 0.0 } else { closed as f32 / total as f32 * 100.0 };

    let bar_len = 40;
    let filled = (progress / 100.0 * bar_len as f32) as usize;
    let empty = bar_len - filled;

    print!("\x1b[2J\x1b[H");

    println!("ticker - driving {total} epic(s)\n");
    println!(
        "[{}{}] {:.1}% ({}/{})",
        "\u{2588}".repeat(filled),
        "\u{2591}".repeat(empty),
        progress,
        closed,
        total
    );

    if !epics.is_empty() {
        println!("\nEpics:");
        for epic in epics {
            let symbol = match epic.status {
                EpicStatus::Closed => "\u{2713}",
                EpicStatus::Archived => "\u{2205}",
                EpicStatus::Open => "\u{25cb}",
            };
            println!("  {symbol} {}", epic.title);
        }
    }
}
