use std::io::Write;

use anyhow::Result;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers},
    style::{Attribute, Print, SetAttribute},
    terminal::{Clear, ClearType},
};
use wordflow_core::{
    line_scroll_target, Command, PaginationIndex, PlaybackState, ReaderView, WORDS_PER_LINE,
};

#[derive(Debug, Clone)]
pub enum UiEvent {
    Command(Command),
    Redraw,
    Quit,
    None,
}

/// Maps terminal input to playback commands. Digits form a page-number
/// prefix consumed by `g`.
#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                code, modifiers, ..
            }) => match (code, modifiers) {
                (KeyCode::Char('c'), m) if m.contains(KeyModifiers::CONTROL) => {
                    self.reset_count();
                    UiEvent::Quit
                }
                (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                    if let Some(digit) = c.to_digit(10) {
                        self.push_digit(digit as usize);
                    }
                    UiEvent::None
                }
                (KeyCode::Char(' '), _) => {
                    self.reset_count();
                    UiEvent::Command(Command::TogglePlay)
                }
                (KeyCode::Right, _) | (KeyCode::Char('l'), KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::Command(Command::StepForward)
                }
                (KeyCode::Left, _) | (KeyCode::Char('h'), KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::Command(Command::StepBack)
                }
                (KeyCode::Up, _) | (KeyCode::Char('k'), KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::Command(Command::AdjustRate { steps: 1 })
                }
                (KeyCode::Down, _) | (KeyCode::Char('j'), KeyModifiers::NONE) => {
                    self.reset_count();
                    UiEvent::Command(Command::AdjustRate { steps: -1 })
                }
                (KeyCode::Char('+'), _) | (KeyCode::Char('='), _) => {
                    self.reset_count();
                    UiEvent::Command(Command::AdjustFontSize { steps: 1 })
                }
                (KeyCode::Char('-'), _) => {
                    self.reset_count();
                    UiEvent::Command(Command::AdjustFontSize { steps: -1 })
                }
                (KeyCode::Char('n'), KeyModifiers::NONE) | (KeyCode::PageDown, _) => {
                    self.reset_count();
                    UiEvent::Command(Command::NextPage)
                }
                (KeyCode::Char('p'), KeyModifiers::NONE) | (KeyCode::PageUp, _) => {
                    self.reset_count();
                    UiEvent::Command(Command::PrevPage)
                }
                // `12g` jumps to page 12 (1-based, as printed in the footer).
                (KeyCode::Char('g'), KeyModifiers::NONE) => {
                    let page = self.take_count().saturating_sub(1);
                    UiEvent::Command(Command::JumpToPage { page })
                }
                (KeyCode::Char('q'), _) | (KeyCode::Esc, _) => {
                    self.reset_count();
                    UiEvent::Quit
                }
                _ => {
                    self.reset_count();
                    UiEvent::None
                }
            },
            Event::FocusLost => UiEvent::Command(Command::VisibilityLost),
            Event::FocusGained => UiEvent::Command(Command::VisibilityGained),
            Event::Resize(..) => UiEvent::Redraw,
            _ => UiEvent::None,
        }
    }

    pub fn pending_input(&self) -> Option<String> {
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        self.pending_count = Some(current.saturating_mul(10).saturating_add(digit));
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }
}

/// Scroll state for the page preview pane. One preview line occupies one
/// terminal row.
#[derive(Debug, Default)]
pub struct PreviewPane {
    scroll_top: usize,
}

impl PreviewPane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scroll_top(&self) -> usize {
        self.scroll_top
    }

    /// Called when the active page changes; a fresh page starts at its top.
    pub fn reset(&mut self) {
        self.scroll_top = 0;
    }

    /// Scrolls so the active line sits about a third of the way down the
    /// pane whenever it has left the visible region.
    pub fn ensure_visible(&mut self, active_line: usize, viewport_rows: usize) {
        if let Some(target) =
            line_scroll_target(active_line, 1, viewport_rows.max(1), self.scroll_top)
        {
            self.scroll_top = target;
        }
    }
}

pub fn line_text(words: &[String], start: usize, end: usize) -> String {
    words
        .get(start..=end.min(words.len().saturating_sub(1)))
        .unwrap_or(&[])
        .join(" ")
}

pub fn format_status(view: &ReaderView, pending_input: Option<&str>) -> String {
    let state = match view.state {
        PlaybackState::Playing => "playing",
        PlaybackState::Paused => "paused",
        PlaybackState::Idle => "ready",
    };
    let mut status = format!(
        "word {}/{} — {}% — {} left — {} wpm — {}pt — page {}/{} — {}",
        view.words_read,
        view.total,
        view.percent,
        view.time_left,
        view.wpm,
        view.font_size,
        view.page + 1,
        view.page_count.max(1),
        state
    );
    if let Some(pending) = pending_input.filter(|p| !p.is_empty()) {
        status.push_str(" | ");
        status.push_str(pending);
    }
    status
}

/// Draws the word display, page preview pane, and status line.
pub struct ReaderScreen<W: Write> {
    writer: W,
}

impl<W: Write> ReaderScreen<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn clear(&mut self) -> Result<()> {
        crossterm::queue!(self.writer, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn draw(
        &mut self,
        view: &ReaderView,
        words: &[String],
        pagination: &PaginationIndex,
        pane: &mut PreviewPane,
        cols: u16,
        rows: u16,
        pending_input: Option<&str>,
    ) -> Result<()> {
        crossterm::queue!(self.writer, Clear(ClearType::All))?;

        let cols_usize = usize::from(cols.max(1));
        let word_row = rows / 4;
        let word = view.word.as_deref().unwrap_or("—");
        self.print_centered(word_row, cols_usize, word, Some(Attribute::Bold))?;

        let marker_row = word_row.saturating_add(2);
        self.print_centered(marker_row, cols_usize, &progress_marker(view.percent), None)?;

        let preview_top = marker_row.saturating_add(2);
        let status_row = rows.saturating_sub(1);
        let preview_rows = usize::from(status_row.saturating_sub(preview_top).max(1));
        self.draw_preview(view, words, pagination, pane, preview_top, preview_rows, cols_usize)?;

        crossterm::queue!(
            self.writer,
            cursor::MoveTo(0, status_row),
            Clear(ClearType::CurrentLine),
            Print(truncate(&format_status(view, pending_input), cols_usize)),
        )?;
        self.writer.flush()?;
        Ok(())
    }

    /// Inline error state shown when the word load fails; playback never
    /// starts from here.
    pub fn draw_error(&mut self, message: &str, cols: u16, rows: u16) -> Result<()> {
        crossterm::queue!(self.writer, Clear(ClearType::All))?;
        self.print_centered(
            rows / 2,
            usize::from(cols.max(1)),
            message,
            Some(Attribute::Reverse),
        )?;
        self.writer.flush()?;
        Ok(())
    }

    fn draw_preview(
        &mut self,
        view: &ReaderView,
        words: &[String],
        pagination: &PaginationIndex,
        pane: &mut PreviewPane,
        top: u16,
        viewport_rows: usize,
        cols: usize,
    ) -> Result<()> {
        if view.page_count == 0 {
            return Ok(());
        }
        let header_label = view
            .page_label
            .map(|label| format!("— page {} —", label))
            .unwrap_or_default();
        self.print_centered(top, cols, &header_label, Some(Attribute::Dim))?;

        let lines: Vec<_> = pagination.line_ranges(view.page, WORDS_PER_LINE).collect();
        let body_rows = viewport_rows.saturating_sub(1).max(1);
        if let Some(active) = lines.iter().position(|l| l.contains(view.index)) {
            pane.ensure_visible(active, body_rows);
        }

        for (row, line) in lines
            .iter()
            .enumerate()
            .skip(pane.scroll_top())
            .take(body_rows)
        {
            let screen_row = top + 1 + (row - pane.scroll_top()) as u16;
            let text = truncate(&line_text(words, line.start, line.end), cols);
            crossterm::queue!(self.writer, cursor::MoveTo(0, screen_row))?;
            if line.contains(view.index) {
                crossterm::queue!(
                    self.writer,
                    SetAttribute(Attribute::Reverse),
                    Print(text),
                    SetAttribute(Attribute::Reset),
                )?;
            } else if line.is_read(view.index) {
                crossterm::queue!(
                    self.writer,
                    SetAttribute(Attribute::Dim),
                    Print(text),
                    SetAttribute(Attribute::Reset),
                )?;
            } else {
                crossterm::queue!(self.writer, Print(text))?;
            }
        }
        Ok(())
    }

    fn print_centered(
        &mut self,
        row: u16,
        cols: usize,
        text: &str,
        attribute: Option<Attribute>,
    ) -> Result<()> {
        let text = truncate(text, cols);
        let col = cols.saturating_sub(text.chars().count()) / 2;
        crossterm::queue!(self.writer, cursor::MoveTo(col as u16, row))?;
        if let Some(attribute) = attribute {
            crossterm::queue!(
                self.writer,
                SetAttribute(attribute),
                Print(text),
                SetAttribute(Attribute::Reset),
            )?;
        } else {
            crossterm::queue!(self.writer, Print(text))?;
        }
        Ok(())
    }
}

fn progress_marker(percent: u8) -> String {
    const WIDTH: usize = 20;
    let filled = (usize::from(percent.min(100)) * WIDTH) / 100;
    format!(
        "[{}{}] {:>3}%",
        "#".repeat(filled),
        "-".repeat(WIDTH - filled),
        percent
    )
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    if width <= 3 {
        return text.chars().take(width).collect();
    }
    let mut truncated: String = text.chars().take(width - 3).collect();
    truncated.push_str("...");
    truncated
}
