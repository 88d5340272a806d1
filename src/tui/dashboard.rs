//! Live progress view of a fetch or tidy run

use crate::progress::{Progress, ProgressSnapshot, Stage};
use crate::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Renders a shared [`Progress`] until the run it belongs to finishes
///
/// Pressing `q` or `Esc` cancels the run; the dashboard keeps drawing until
/// the run has wound down so the final counters stay visible on exit.
pub struct ProgressDashboard {
    title: String,
    progress: Arc<Progress>,
    cancel: CancellationToken,
}

impl ProgressDashboard {
    pub fn new(title: impl Into<String>, progress: Arc<Progress>, cancel: CancellationToken) -> Self {
        Self {
            title: title.into(),
            progress,
            cancel,
        }
    }

    /// Draw until `run` completes and return its output
    pub async fn run<T>(&self, run: JoinHandle<T>) -> Result<T> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal, run).await;

        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    async fn run_app<B: Backend, T>(
        &self,
        terminal: &mut Terminal<B>,
        mut run: JoinHandle<T>,
    ) -> Result<T> {
        loop {
            self.draw(terminal)?;

            if event::poll(Duration::ZERO)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code);
                    }
                }
            }

            tokio::select! {
                joined = &mut run => return Ok(joined?),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    fn draw<B: Backend>(&self, terminal: &mut Terminal<B>) -> Result<()> {
        let snapshot = self.progress.snapshot();
        let sources = self.progress.finished_sources();
        terminal.draw(|f| self.ui(f, &snapshot, &sources))?;
        Ok(())
    }

    fn handle_input(&self, key: KeyCode) {
        if matches!(key, KeyCode::Char('q') | KeyCode::Esc) {
            self.cancel.cancel();
        }
    }

    fn ui(&self, f: &mut Frame, snapshot: &ProgressSnapshot, sources: &[String]) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3),
                Constraint::Length(3),
                Constraint::Min(0),
                Constraint::Length(3),
            ])
            .split(f.size());

        let title = Paragraph::new(self.title.as_str())
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let percent = (snapshot.ratio() * 100.0) as u16;
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(percent)
            .label(format!("{}/{} ({}%)", snapshot.completed, snapshot.total, percent));
        f.render_widget(gauge, chunks[1]);

        let body = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[2]);
        Self::render_counters(f, body[0], snapshot);
        Self::render_sources(f, body[1], snapshot, sources);

        let stage = snapshot.stage.unwrap_or(Stage::Idle);
        let status = if self.cancel.is_cancelled() && stage != Stage::Done {
            "Cancelling, waiting for workers...".to_string()
        } else {
            format!(
                "Stage: {} | Elapsed: {}s | Press 'q' to stop",
                stage,
                snapshot.elapsed.as_secs()
            )
        };
        let status = Paragraph::new(status)
            .style(if stage == Stage::Done {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Yellow)
            })
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[3]);
    }

    fn render_counters(f: &mut Frame, area: Rect, snapshot: &ProgressSnapshot) {
        let rows = [
            ("Invalid", snapshot.invalid, Color::DarkGray),
            ("Failed", snapshot.failed, Color::Red),
            ("Created", snapshot.created, Color::Green),
            ("Duplicate", snapshot.duplicate, Color::Blue),
            ("Succeeded", snapshot.succeeded, Color::Green),
            ("Removed", snapshot.removed, Color::Red),
            ("With country", snapshot.country_set, Color::Cyan),
            ("Without country", snapshot.country_empty, Color::DarkGray),
        ];
        let lines: Vec<Line> = rows
            .iter()
            .map(|(label, value, color)| {
                Line::from(Span::styled(
                    format!("{label:<16} {value}"),
                    Style::default().fg(*color),
                ))
            })
            .collect();

        let counters = Paragraph::new(lines)
            .block(Block::default().borders(Borders::ALL).title("Counters"));
        f.render_widget(counters, area);
    }

    fn render_sources(f: &mut Frame, area: Rect, snapshot: &ProgressSnapshot, sources: &[String]) {
        let items: Vec<ListItem> = sources
            .iter()
            .rev()
            .map(|name| ListItem::new(name.as_str()).style(Style::default().fg(Color::Green)))
            .collect();

        let title = format!(
            "Sources done ({}/{})",
            snapshot.sources_done, snapshot.sources_total
        );
        let list = List::new(items).block(
            Block::default()
                .borders(Borders::ALL)
                .title(title)
                .border_style(Style::default().add_modifier(Modifier::BOLD)),
        );
        f.render_widget(list, area);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Counter;
    use ratatui::backend::TestBackend;

    #[test]
    fn test_quit_key_cancels_run() {
        let cancel = CancellationToken::new();
        let dashboard = ProgressDashboard::new("fetch", Arc::new(Progress::new()), cancel.clone());

        dashboard.handle_input(KeyCode::Char('x'));
        assert!(!cancel.is_cancelled());
        dashboard.handle_input(KeyCode::Char('q'));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_draws_counters_and_sources() {
        let progress = Arc::new(Progress::new());
        progress.add(Counter::Total, 4);
        progress.add(Counter::Completed, 2);
        progress.source_done("cfmem");
        let dashboard = ProgressDashboard::new("tidy", progress, CancellationToken::new());

        let mut terminal = Terminal::new(TestBackend::new(80, 24)).unwrap();
        dashboard.draw(&mut terminal).unwrap();

        let buffer = terminal.backend().buffer().clone();
        let text: String = buffer.content().iter().map(|c| c.symbol.as_str()).collect();
        assert!(text.contains("2/4"));
        assert!(text.contains("cfmem"));
    }
}
