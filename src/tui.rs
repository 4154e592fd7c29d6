use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
};
use std::io::stdout;

use crate::models::{ApplicationRecord, JobStatus};

struct AppState {
    records: Vec<ApplicationRecord>,
    filter: Option<JobStatus>,
    visible: Vec<usize>,
    selected: usize,
    scroll_offset: u16,
}

impl AppState {
    fn new(records: Vec<ApplicationRecord>, filter: Option<JobStatus>) -> Self {
        let mut state = Self {
            records,
            filter,
            visible: Vec::new(),
            selected: 0,
            scroll_offset: 0,
        };
        state.refilter();
        state
    }

    fn refilter(&mut self) {
        self.visible = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| self.filter.is_none_or(|s| r.status == s))
            .map(|(i, _)| i)
            .collect();
        self.selected = 0;
        self.scroll_offset = 0;
    }

    /// All, then each board column in order, then back to all.
    fn cycle_filter(&mut self) {
        self.filter = match self.filter {
            None => Some(JobStatus::BOARD[0]),
            Some(current) => JobStatus::BOARD
                .iter()
                .position(|s| *s == current)
                .and_then(|i| JobStatus::BOARD.get(i + 1))
                .copied(),
        };
        self.refilter();
    }

    fn current(&self) -> Option<&ApplicationRecord> {
        self.visible.get(self.selected).map(|&i| &self.records[i])
    }

    fn next(&mut self) {
        if !self.visible.is_empty() && self.selected < self.visible.len() - 1 {
            self.selected += 1;
            self.scroll_offset = 0;
        }
    }

    fn prev(&mut self) {
        if self.selected > 0 {
            self.selected -= 1;
            self.scroll_offset = 0;
        }
    }

    fn scroll_down(&mut self) {
        self.scroll_offset = self.scroll_offset.saturating_add(3);
    }

    fn scroll_up(&mut self) {
        self.scroll_offset = self.scroll_offset.saturating_sub(3);
    }
}

pub fn run_browse(records: Vec<ApplicationRecord>, filter: Option<JobStatus>) -> Result<()> {
    if records.is_empty() {
        println!("No applications tracked yet. Run 'jobtrail sync' first.");
        return Ok(());
    }

    let mut state = AppState::new(records, filter);

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let result = run_loop(&mut terminal, &mut state);

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    state: &mut AppState,
) -> Result<()> {
    let mut list_state = ListState::default();
    list_state.select(Some(0));

    loop {
        terminal.draw(|frame| draw(frame, state, &mut list_state))?;

        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => break,
                KeyCode::Down | KeyCode::Char('j') => state.next(),
                KeyCode::Up | KeyCode::Char('k') => state.prev(),
                KeyCode::Char('J') | KeyCode::PageDown => state.scroll_down(),
                KeyCode::Char('K') | KeyCode::PageUp => state.scroll_up(),
                KeyCode::Tab | KeyCode::Char('f') => state.cycle_filter(),
                _ => {}
            }
            list_state.select(if state.visible.is_empty() {
                None
            } else {
                Some(state.selected)
            });
        }
    }
    Ok(())
}

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Applied => Style::default().fg(Color::Cyan),
        JobStatus::OaReceived => Style::default().fg(Color::Yellow),
        JobStatus::Interviewing => Style::default().fg(Color::Magenta),
        JobStatus::Offer => Style::default().fg(Color::Green),
        JobStatus::Rejected => Style::default().fg(Color::Red),
        JobStatus::Unknown => Style::default().fg(Color::DarkGray),
    }
}

fn draw(frame: &mut Frame, state: &AppState, list_state: &mut ListState) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
        .split(frame.area());

    let items: Vec<ListItem> = state
        .visible
        .iter()
        .map(|&i| {
            let record = &state.records[i];
            let company: String = record.company.chars().take(28).collect();
            ListItem::new(Line::from(vec![
                Span::styled(format!("{:<15}", record.status.label()), status_style(record.status)),
                Span::raw(company),
            ]))
        })
        .collect();

    let filter_label = state.filter.map(|s| s.label()).unwrap_or("all");
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(format!(
            " Applications ({}, {}) ",
            state.visible.len(),
            filter_label
        )))
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
        .highlight_symbol("> ");

    frame.render_stateful_widget(list, chunks[0], list_state);

    let detail = build_detail(state);
    let detail_widget = Paragraph::new(detail)
        .block(Block::default().borders(Borders::ALL).title(" Detail "))
        .wrap(Wrap { trim: false })
        .scroll((state.scroll_offset, 0));

    frame.render_widget(detail_widget, chunks[1]);

    let help_area = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(frame.area());

    let help = Paragraph::new(" j/k:navigate  J/K:scroll  f:filter by status  q:quit")
        .style(Style::default().fg(Color::DarkGray));
    frame.render_widget(help, help_area[1]);
}

fn heading(text: &str) -> Line<'static> {
    Line::from(Span::styled(
        text.to_string(),
        Style::default().add_modifier(Modifier::BOLD),
    ))
}

fn build_detail(state: &AppState) -> Text<'_> {
    let Some(record) = state.current() else {
        return Text::raw("No application selected");
    };

    let mut lines: Vec<Line> = Vec::new();

    lines.push(Line::from(Span::styled(
        &record.company,
        Style::default().add_modifier(Modifier::BOLD),
    )));
    if let Some(role) = &record.role {
        lines.push(Line::from(format!("Role: {}", role)));
    }
    lines.push(Line::from(Span::styled(
        format!("Status: {}", record.status),
        status_style(record.status),
    )));
    lines.push(Line::from(format!(
        "Last updated: {}",
        record.last_updated.format("%Y-%m-%d %H:%M")
    )));
    lines.push(Line::from(Span::styled(
        format!("id {}", record.id),
        Style::default().fg(Color::DarkGray),
    )));
    lines.push(Line::from(""));

    if let Some(notes) = &record.notes {
        lines.push(heading("Notes"));
        for line in textwrap::fill(notes, 70).lines() {
            lines.push(Line::from(format!("  {}", line)));
        }
        lines.push(Line::from(""));
    }

    lines.push(heading(&format!("Emails ({})", record.emails.len())));
    for email in &record.emails {
        lines.push(Line::from(vec![
            Span::styled(
                format!("  {} ", email.date.format("%Y-%m-%d")),
                Style::default().fg(Color::DarkGray),
            ),
            Span::raw(email.subject.clone()),
        ]));
        lines.push(Line::from(Span::styled(
            format!("    from {}", email.sender),
            Style::default().fg(Color::DarkGray),
        )));
        for line in textwrap::fill(&email.snippet, 66).lines() {
            lines.push(Line::from(format!("    {}", line)));
        }
    }
    lines.push(Line::from(""));

    if record.contacts.is_empty() {
        lines.push(Line::from(Span::styled(
            "(No recruiter contacts)",
            Style::default().fg(Color::DarkGray),
        )));
    } else {
        lines.push(heading("Contacts"));
        for contact in &record.contacts {
            let role = if contact.role.is_empty() {
                String::new()
            } else {
                format!(", {}", contact.role)
            };
            lines.push(Line::from(format!("  {}{} <{}>", contact.name, role, contact.email)));
            if let Some(linked_in) = &contact.linked_in {
                lines.push(Line::from(format!("    {}", linked_in)));
            }
        }
    }

    Text::from(lines)
}
