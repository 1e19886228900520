//! Terminal UI backend: a ratatui renderer and a crossterm key reader.

use std::io::{stdout, Stdout};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph};
use ratatui::{Frame, Terminal};

use crate::config::UiMode;
use crate::menu::Menu;
use crate::ui::{Action, InputSource, Renderer};

/// Poll interval while no autoboot timeout is armed.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Terminal renderer. Owns the alternate screen for its lifetime.
#[derive(Debug)]
pub struct Tui {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl Tui {
    /// Initialize the backend the settings select. Only the text backend
    /// exists; a graphics selection is a configuration error.
    pub fn init_for(mode: UiMode) -> Result<Self> {
        match mode {
            UiMode::Text => Self::init(),
            UiMode::Graphics => {
                bail!("no graphics UI backend is available, set ui = \"text\"")
            }
        }
    }

    pub fn init() -> Result<Self> {
        enable_raw_mode().context("Failed to enable raw terminal mode")?;
        stdout()
            .execute(EnterAlternateScreen)
            .context("Failed to enter the alternate screen")?;
        let terminal = Terminal::new(CrosstermBackend::new(stdout()))
            .context("Failed to initialize the terminal backend")?;
        Ok(Self { terminal })
    }
}

impl Drop for Tui {
    fn drop(&mut self) {
        // Leave the console usable for whatever runs next.
        let _ = disable_raw_mode();
        let _ = stdout().execute(LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}

impl Renderer for Tui {
    fn show_menu(&mut self, menu: &Menu) -> Result<()> {
        self.terminal.draw(|frame| draw_menu(frame, menu))?;
        Ok(())
    }

    fn show_text(&mut self, lines: &[String], top: usize) -> Result<()> {
        self.terminal.draw(|frame| draw_text(frame, lines, top))?;
        Ok(())
    }

    fn show_message(&mut self, message: &str) -> Result<()> {
        self.terminal.draw(|frame| draw_message(frame, message))?;
        Ok(())
    }
}

fn chrome(frame: &Frame) -> (Rect, Rect, Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Min(1),
            Constraint::Length(2),
        ])
        .split(frame.size());
    (chunks[0], chunks[1], chunks[2])
}

fn header(frame: &mut Frame, area: Rect, title: &str) {
    let header = Paragraph::new(format!("  RavenLinux Boot Menu - {}", title))
        .block(Block::default().borders(Borders::BOTTOM));
    frame.render_widget(header, area);
}

fn footer(frame: &mut Frame, area: Rect, text: &str) {
    let footer = Paragraph::new(text.to_string())
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::TOP));
    frame.render_widget(footer, area);
}

fn draw_menu(frame: &mut Frame, menu: &Menu) {
    let (top, content, bottom) = chrome(frame);

    let level = menu.current_level();
    let title = if level.parent.is_some() { "System" } else { "Select a system to boot" };
    header(frame, top, title);

    let items: Vec<ListItem> = level
        .items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let line = match item.tag {
                Some(tag) => format!("{}. [{}] {}", i, tag, item.label),
                None => format!("{}. {}", i, item.label),
            };
            ListItem::new(line)
        })
        .collect();

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .highlight_symbol("> ");

    let mut state = ListState::default();
    state.select(Some(level.current));
    frame.render_stateful_widget(list, content, &mut state);

    let hint = match level.items.get(level.current).and_then(|i| i.description.as_deref()) {
        Some(desc) => format!("  {}", desc),
        None => "  [Up/Down] Navigate  [Enter] Select  [0-9] Quick select".to_string(),
    };
    footer(frame, bottom, &hint);
}

fn draw_text(frame: &mut Frame, lines: &[String], top: usize) {
    let (top_area, content, bottom) = chrome(frame);

    header(frame, top_area, "Debug log");

    let visible = lines
        .iter()
        .skip(top)
        .map(|line| line.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let text = Paragraph::new(visible).block(Block::default().borders(Borders::ALL));
    frame.render_widget(text, content);

    footer(frame, bottom, "  [Up/Down] Scroll  [Enter] Back");
}

fn draw_message(frame: &mut Frame, message: &str) {
    let text = Paragraph::new(message.to_string())
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::ALL));
    frame.render_widget(text, frame.size());
}

/// Keyboard input mapped onto abstract actions.
pub struct Keys;

impl InputSource for Keys {
    fn next_action(&mut self, timeout: Option<Duration>) -> Result<Action> {
        let wait = timeout.unwrap_or(IDLE_POLL);
        if !event::poll(wait).context("Failed to poll terminal events")? {
            // With a timeout armed this is the autoboot trigger;
            // otherwise the loop just idles.
            return Ok(if timeout.is_some() { Action::Timeout } else { Action::None });
        }

        let event = event::read().context("Failed to read terminal event")?;
        let Event::Key(key) = event else {
            return Ok(Action::None);
        };
        if key.kind != KeyEventKind::Press {
            return Ok(Action::None);
        }

        Ok(match key.code {
            KeyCode::Up | KeyCode::Char('k') => Action::Up,
            KeyCode::Down | KeyCode::Char('j') => Action::Down,
            KeyCode::Enter | KeyCode::Right | KeyCode::Char(' ') => Action::Select,
            KeyCode::Char('r') => Action::Rescan,
            KeyCode::Char('d') => Action::Debug,
            KeyCode::Char('q') | KeyCode::Esc => Action::Exit,
            KeyCode::Char(c) if c.is_ascii_digit() => {
                Action::Digit(c.to_digit(10).unwrap_or(0) as u8)
            }
            _ => Action::None,
        })
    }
}
