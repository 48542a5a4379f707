//! Playback controller for word-by-word reading sessions.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub type DocumentId = String;

pub const DEFAULT_WPM: u16 = 200;
pub const DEFAULT_MIN_WPM: u16 = 60;
pub const DEFAULT_MAX_WPM: u16 = 600;
pub const WPM_STEP: u16 = 10;

pub const DEFAULT_FONT_SIZE: u16 = 48;
pub const MIN_FONT_SIZE: u16 = 24;
pub const MAX_FONT_SIZE: u16 = 120;
pub const FONT_SIZE_STEP: u16 = 4;

pub const WORDS_PER_LINE: usize = 10;
pub const LINES_PER_PAGE: usize = 15;
pub const WORDS_PER_PAGE: usize = WORDS_PER_LINE * LINES_PER_PAGE;

pub const AUTOSAVE_PERIOD: Duration = Duration::from_secs(5);

/// One page of the source document, as a span of word indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageBoundary {
    /// Page number as printed in the source document (1-based).
    pub page: u32,
    pub start: usize,
    pub end: usize,
}

/// Payload of the word read endpoint: the tokenized document plus
/// optional page metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentWords {
    pub words: Vec<String>,
    #[serde(default)]
    pub pages: Vec<PageBoundary>,
}

/// The persisted projection of session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_word_index: usize,
    pub wpm: u16,
    pub font_size: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageMetadataError {
    #[error("no pages supplied")]
    Empty,
    #[error("page {page} covers {start}..={end}, outside the {total}-word sequence")]
    OutOfBounds {
        page: u32,
        start: usize,
        end: usize,
        total: usize,
    },
    #[error("page {page} starts at {start}, expected {expected}")]
    Gap {
        page: u32,
        start: usize,
        expected: usize,
    },
    #[error("last page ends at {end}, expected {expected}")]
    Truncated { end: usize, expected: usize },
}

/// Checks that a supplied page list partitions `[0, total)` with no
/// gaps or overlaps.
pub fn validate_page_list(
    pages: &[PageBoundary],
    total_words: usize,
) -> Result<(), PageMetadataError> {
    if pages.is_empty() {
        return Err(PageMetadataError::Empty);
    }
    let mut expected = 0usize;
    for boundary in pages {
        if boundary.start > boundary.end || boundary.end >= total_words {
            return Err(PageMetadataError::OutOfBounds {
                page: boundary.page,
                start: boundary.start,
                end: boundary.end,
                total: total_words,
            });
        }
        if boundary.start != expected {
            return Err(PageMetadataError::Gap {
                page: boundary.page,
                start: boundary.start,
                expected,
            });
        }
        expected = boundary.end + 1;
    }
    if expected != total_words {
        return Err(PageMetadataError::Truncated {
            end: expected - 1,
            expected: total_words - 1,
        });
    }
    Ok(())
}

/// A contiguous sub-range of a page, one preview line wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn contains(&self, index: usize) -> bool {
        self.start <= index && index <= self.end
    }

    /// A line is read once the position has moved past its last word.
    pub fn is_read(&self, current: usize) -> bool {
        self.end < current
    }
}

#[derive(Debug, Clone)]
pub struct LineRanges {
    next: usize,
    end: usize,
    step: usize,
    exhausted: bool,
}

impl Iterator for LineRanges {
    type Item = LineRange;

    fn next(&mut self) -> Option<LineRange> {
        if self.exhausted || self.next > self.end {
            return None;
        }
        let start = self.next;
        let end = (start + self.step - 1).min(self.end);
        match end.checked_add(1) {
            Some(next) => self.next = next,
            None => self.exhausted = true,
        }
        Some(LineRange { start, end })
    }
}

/// Maps word indices to pages. Built once per session from supplied
/// metadata, with a synthesized fixed-size fallback.
#[derive(Debug, Clone)]
pub struct PaginationIndex {
    pages: Vec<PageBoundary>,
}

impl PaginationIndex {
    /// Uses `supplied` if it validates, otherwise synthesizes pages of
    /// [`WORDS_PER_PAGE`] words.
    pub fn build(supplied: Vec<PageBoundary>, total_words: usize) -> Self {
        match validate_page_list(&supplied, total_words) {
            Ok(()) => Self { pages: supplied },
            Err(err) => {
                if !supplied.is_empty() {
                    warn!(error = %err, "rejected page metadata, synthesizing pages");
                }
                Self::synthesized(total_words)
            }
        }
    }

    pub fn synthesized(total_words: usize) -> Self {
        let mut pages = Vec::new();
        let mut start = 0usize;
        while start < total_words {
            let end = (start + WORDS_PER_PAGE - 1).min(total_words - 1);
            pages.push(PageBoundary {
                page: pages.len() as u32 + 1,
                start,
                end,
            });
            start = end + 1;
        }
        Self { pages }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[PageBoundary] {
        &self.pages
    }

    /// Index of the page containing `index`. Out-of-range input maps to
    /// page 0 rather than failing.
    pub fn page_containing(&self, index: usize) -> usize {
        self.pages
            .iter()
            .position(|p| p.start <= index && index <= p.end)
            .unwrap_or(0)
    }

    pub fn range_for_page(&self, page: usize) -> Option<(usize, usize)> {
        self.pages.get(page).map(|p| (p.start, p.end))
    }

    /// Lazy, restartable sequence of line spans covering `page`, each at
    /// most `words_per_line` wide.
    pub fn line_ranges(&self, page: usize, words_per_line: usize) -> LineRanges {
        match self.range_for_page(page) {
            Some((start, end)) => LineRanges {
                next: start,
                end,
                step: words_per_line.max(1),
                exhausted: false,
            },
            None => LineRanges {
                next: 1,
                end: 0,
                step: 1,
                exhausted: true,
            },
        }
    }
}

/// Scroll offset that puts a line roughly one third down the viewport,
/// or `None` when the line is already fully visible.
pub fn line_scroll_target(
    line_top: usize,
    line_height: usize,
    viewport_height: usize,
    scroll_top: usize,
) -> Option<usize> {
    if line_top >= scroll_top && line_top + line_height <= scroll_top + viewport_height {
        return None;
    }
    Some(line_top.saturating_sub(viewport_height / 3))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Moved,
    AtEnd,
}

/// The current word index. Single source of truth for every other
/// component; all mutation clamps to `[0, total)`.
#[derive(Debug, Clone, Copy)]
pub struct Position {
    index: usize,
    total: usize,
}

impl Position {
    pub fn new(initial: usize, total: usize) -> Self {
        let mut position = Self { index: 0, total };
        position.set(initial);
        position
    }

    /// Clamps and stores `index`; reports whether the stored value
    /// changed so redundant redraws can be suppressed.
    pub fn set(&mut self, index: usize) -> bool {
        let clamped = index.min(self.total.saturating_sub(1));
        let changed = clamped != self.index;
        self.index = clamped;
        changed
    }

    pub fn advance(&mut self) -> Advance {
        if self.index + 1 < self.total {
            self.index += 1;
            Advance::Moved
        } else {
            Advance::AtEnd
        }
    }

    pub fn retreat(&mut self) -> bool {
        if self.index > 0 {
            self.index -= 1;
            true
        } else {
            false
        }
    }

    pub fn current(&self) -> usize {
        self.index
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn remaining(&self) -> usize {
        if self.total == 0 {
            0
        } else {
            self.total - self.index - 1
        }
    }

    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            (((self.index + 1) as f64 / self.total as f64) * 100.0).round() as u8
        }
    }

    pub fn at_end(&self) -> bool {
        self.total > 0 && self.index == self.total - 1
    }
}

/// Converts a words-per-minute rate into tick deadlines. At most one
/// deadline is armed at a time; `start` cancels any prior one.
#[derive(Debug)]
pub struct PacingClock {
    wpm: u16,
    min_wpm: u16,
    max_wpm: u16,
    next_fire: Option<Instant>,
}

impl PacingClock {
    pub fn new(wpm: u16, min_wpm: u16, max_wpm: u16) -> Self {
        Self {
            wpm: wpm.max(min_wpm).min(max_wpm),
            min_wpm,
            max_wpm,
            next_fire: None,
        }
    }

    pub fn wpm(&self) -> u16 {
        self.wpm
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(60_000 / u64::from(self.wpm.max(1)))
    }

    /// Clamps the rate into bounds and, if running, rearms the deadline
    /// at the new interval. Returns the applied rate.
    pub fn set_rate(&mut self, wpm: u16, now: Instant) -> u16 {
        self.wpm = wpm.max(self.min_wpm).min(self.max_wpm);
        if self.next_fire.is_some() {
            self.next_fire = Some(now + self.interval());
        }
        self.wpm
    }

    pub fn start(&mut self, now: Instant) {
        self.next_fire = Some(now + self.interval());
    }

    pub fn stop(&mut self) {
        self.next_fire = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_fire.is_some()
    }

    /// Fires if the deadline has passed, rearming for the next tick.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next_fire {
            Some(deadline) if deadline <= now => {
                self.next_fire = Some(now + self.interval());
                true
            }
            _ => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_fire
    }
}

/// Fixed-period repeating deadline for checkpoint writes.
#[derive(Debug)]
pub struct AutosaveTimer {
    period: Duration,
    next_fire: Option<Instant>,
}

impl AutosaveTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_fire: None,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.next_fire = Some(now + self.period);
    }

    pub fn stop(&mut self) {
        self.next_fire = None;
    }

    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next_fire {
            Some(deadline) if deadline <= now => {
                self.next_fire = Some(now + self.period);
                true
            }
            _ => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_fire
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    TogglePlay,
    Play,
    Pause,
    StepForward,
    StepBack,
    SetRate { wpm: u16 },
    AdjustRate { steps: i16 },
    AdjustFontSize { steps: i16 },
    JumpToPage { page: usize },
    NextPage,
    PrevPage,
    VisibilityLost,
    VisibilityGained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Redraw,
    /// The active page changed; the renderer should scroll it into view.
    PageChanged { page: usize },
    PlaybackEnded,
}

/// Remaining-time estimate at the current rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeLeft {
    Done,
    HoursMinutes { hours: u64, minutes: u64 },
    MinutesSeconds { minutes: u64, seconds: u64 },
}

impl TimeLeft {
    pub fn estimate(words_left: usize, wpm: u16) -> Self {
        if words_left == 0 {
            return TimeLeft::Done;
        }
        let minutes_left = words_left as f64 / f64::from(wpm.max(1));
        let minutes = minutes_left.floor() as u64;
        let seconds = ((minutes_left - minutes as f64) * 60.0).round() as u64;
        if minutes > 60 {
            TimeLeft::HoursMinutes {
                hours: minutes / 60,
                minutes: minutes % 60,
            }
        } else {
            TimeLeft::MinutesSeconds { minutes, seconds }
        }
    }
}

impl fmt::Display for TimeLeft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeLeft::Done => write!(f, "done"),
            TimeLeft::HoursMinutes { hours, minutes } => write!(f, "{}h {}m", hours, minutes),
            TimeLeft::MinutesSeconds { minutes, seconds } => {
                write!(f, "{}:{:02}", minutes, seconds)
            }
        }
    }
}

/// UI-facing projection of the session. Pure view, no owned state.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderView {
    pub word: Option<String>,
    pub index: usize,
    pub total: usize,
    pub percent: u8,
    pub words_read: usize,
    pub words_left: usize,
    pub time_left: TimeLeft,
    pub wpm: u16,
    pub font_size: u16,
    pub state: PlaybackState,
    pub page: usize,
    pub page_count: usize,
    pub page_label: Option<u32>,
    pub line: Option<LineRange>,
}

#[async_trait]
pub trait WordSource: Send + Sync {
    async fn fetch(&self, doc: &DocumentId) -> Result<DocumentWords>;
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn save(&self, doc: &DocumentId, checkpoint: Checkpoint) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryProgressSink {
    saved: Mutex<Vec<Checkpoint>>,
}

impl MemoryProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<Checkpoint> {
        self.saved.lock().clone()
    }

    pub fn last(&self) -> Option<Checkpoint> {
        self.saved.lock().last().copied()
    }
}

#[async_trait]
impl ProgressSink for MemoryProgressSink {
    async fn save(&self, _doc: &DocumentId, checkpoint: Checkpoint) -> Result<()> {
        self.saved.lock().push(checkpoint);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub doc_id: DocumentId,
    pub initial_index: usize,
    pub wpm: u16,
    pub font_size: u16,
    pub min_wpm: u16,
    pub max_wpm: u16,
}

impl SessionOptions {
    pub fn new(doc_id: impl Into<DocumentId>) -> Self {
        Self {
            doc_id: doc_id.into(),
            initial_index: 0,
            wpm: DEFAULT_WPM,
            font_size: DEFAULT_FONT_SIZE,
            min_wpm: DEFAULT_MIN_WPM,
            max_wpm: DEFAULT_MAX_WPM,
        }
    }
}

fn clamp_font(points: u16) -> u16 {
    points.max(MIN_FONT_SIZE).min(MAX_FONT_SIZE)
}

/// A single reading session: word sequence, playback state, and the
/// checkpoint schedule. Single-threaded; the owner funnels every input
/// through [`ReaderSession::apply`] and drives timers via
/// [`ReaderSession::tick`].
pub struct ReaderSession {
    doc_id: DocumentId,
    words: Vec<String>,
    pagination: PaginationIndex,
    position: Position,
    clock: PacingClock,
    autosave: AutosaveTimer,
    state: PlaybackState,
    font_size: u16,
    last_saved_index: usize,
    pending_flush: bool,
    active_page: usize,
    sink: Arc<dyn ProgressSink>,
    events: Vec<SessionEvent>,
}

impl ReaderSession {
    pub async fn load_with<S: WordSource + ?Sized>(
        source: &S,
        sink: Arc<dyn ProgressSink>,
        options: SessionOptions,
        now: Instant,
    ) -> Result<Self> {
        let doc = source
            .fetch(&options.doc_id)
            .await
            .with_context(|| format!("failed to load words for document {}", options.doc_id))?;
        Ok(Self::from_document(doc, sink, options, now))
    }

    pub fn from_document(
        doc: DocumentWords,
        sink: Arc<dyn ProgressSink>,
        options: SessionOptions,
        now: Instant,
    ) -> Self {
        let total = doc.words.len();
        let pagination = PaginationIndex::build(doc.pages, total);
        let position = Position::new(options.initial_index, total);
        let clock = PacingClock::new(options.wpm, options.min_wpm, options.max_wpm);
        let mut autosave = AutosaveTimer::new(AUTOSAVE_PERIOD);
        autosave.start(now);
        let active_page = pagination.page_containing(position.current());
        Self {
            doc_id: options.doc_id,
            words: doc.words,
            pagination,
            position,
            clock,
            autosave,
            state: PlaybackState::Idle,
            font_size: clamp_font(options.font_size),
            last_saved_index: position.current(),
            pending_flush: false,
            active_page,
            sink,
            events: Vec::new(),
        }
    }

    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn pagination(&self) -> &PaginationIndex {
        &self.pagination
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn wpm(&self) -> u16 {
        self.clock.wpm()
    }

    pub fn font_size(&self) -> u16 {
        self.font_size
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn apply(&mut self, command: Command, now: Instant) {
        match command {
            Command::TogglePlay => match self.state {
                PlaybackState::Playing => self.pause(),
                _ => self.play(now),
            },
            Command::Play => self.play(now),
            Command::Pause => self.pause(),
            Command::StepForward => {
                if let Advance::Moved = self.position.advance() {
                    if self.state == PlaybackState::Playing {
                        self.clock.start(now);
                    }
                    self.sync_presentation();
                }
            }
            Command::StepBack => {
                if self.position.retreat() {
                    if self.state == PlaybackState::Playing {
                        self.clock.start(now);
                    }
                    self.sync_presentation();
                }
            }
            Command::SetRate { wpm } => {
                self.clock.set_rate(wpm, now);
                self.request_redraw();
            }
            Command::AdjustRate { steps } => {
                let delta = i32::from(steps) * i32::from(WPM_STEP);
                let target = (i32::from(self.clock.wpm()) + delta).clamp(0, i32::from(u16::MAX));
                self.clock.set_rate(target as u16, now);
                self.request_redraw();
            }
            Command::AdjustFontSize { steps } => {
                let delta = i32::from(steps) * i32::from(FONT_SIZE_STEP);
                let target = (i32::from(self.font_size) + delta).clamp(0, i32::from(u16::MAX));
                self.font_size = clamp_font(target as u16);
                self.request_redraw();
            }
            Command::JumpToPage { page } => self.jump_to_page(page, now),
            Command::NextPage => {
                if self.active_page + 1 < self.pagination.page_count() {
                    self.jump_to_page(self.active_page + 1, now);
                }
            }
            Command::PrevPage => {
                if self.active_page > 0 {
                    self.jump_to_page(self.active_page - 1, now);
                }
            }
            Command::VisibilityLost => {
                if self.state == PlaybackState::Playing {
                    self.pause();
                }
            }
            // Regaining visibility never auto-resumes.
            Command::VisibilityGained => {}
        }
    }

    /// Fires any due pacing or autosave deadline and performs requested
    /// checkpoint flushes. The owner awaits this once per loop turn,
    /// after `apply`.
    pub async fn tick(&mut self, now: Instant) {
        if self.state == PlaybackState::Playing && self.clock.poll(now) {
            match self.position.advance() {
                Advance::Moved => self.sync_presentation(),
                Advance::AtEnd => {
                    self.pause();
                    self.events.push(SessionEvent::PlaybackEnded);
                }
            }
        }
        // Requested flushes run before the periodic check so a pause that
        // coincides with a due autosave writes one checkpoint, not two.
        if self.pending_flush {
            self.pending_flush = false;
            self.flush_progress().await;
        }
        if self.autosave.poll(now) && self.position.current() != self.last_saved_index {
            self.flush_progress().await;
        }
    }

    /// Earliest armed deadline, for the owner's poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.clock.next_deadline(), self.autosave.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Cancels both timers and writes a final checkpoint.
    pub async fn shutdown(&mut self) {
        self.clock.stop();
        self.autosave.stop();
        if self.state == PlaybackState::Playing {
            self.state = PlaybackState::Paused;
        }
        self.pending_flush = false;
        self.flush_progress().await;
    }

    pub fn view(&self) -> ReaderView {
        let total = self.position.total();
        let index = self.position.current();
        let words_left = self.position.remaining();
        let page = self.active_page;
        ReaderView {
            word: self.words.get(index).cloned(),
            index,
            total,
            percent: self.position.percent(),
            words_read: if total == 0 { 0 } else { index + 1 },
            words_left,
            time_left: TimeLeft::estimate(words_left, self.clock.wpm()),
            wpm: self.clock.wpm(),
            font_size: self.font_size,
            state: self.state,
            page,
            page_count: self.pagination.page_count(),
            page_label: self.pagination.pages().get(page).map(|p| p.page),
            line: self
                .pagination
                .line_ranges(page, WORDS_PER_LINE)
                .find(|l| l.contains(index)),
        }
    }

    fn play(&mut self, now: Instant) {
        if self.words.is_empty() {
            debug!(doc = %self.doc_id, "ignoring play with no words loaded");
            return;
        }
        if self.position.at_end() {
            self.position.set(0);
        }
        self.state = PlaybackState::Playing;
        self.clock.start(now);
        self.sync_presentation();
    }

    fn pause(&mut self) {
        self.clock.stop();
        self.state = PlaybackState::Paused;
        self.pending_flush = true;
        self.request_redraw();
    }

    fn jump_to_page(&mut self, page: usize, now: Instant) {
        let Some((start, _)) = self.pagination.range_for_page(page) else {
            return;
        };
        self.position.set(start);
        if self.state == PlaybackState::Playing {
            self.clock.start(now);
        }
        self.sync_presentation();
    }

    fn sync_presentation(&mut self) {
        let page = self.pagination.page_containing(self.position.current());
        if page != self.active_page {
            self.active_page = page;
            self.events.push(SessionEvent::PageChanged { page });
        }
        self.request_redraw();
    }

    fn request_redraw(&mut self) {
        if self.events.last() != Some(&SessionEvent::Redraw) {
            self.events.push(SessionEvent::Redraw);
        }
    }

    async fn flush_progress(&mut self) {
        let checkpoint = Checkpoint {
            last_word_index: self.position.current(),
            wpm: self.clock.wpm(),
            font_size: self.font_size,
        };
        // Bookkeeping updates when the write is issued, not when it is
        // confirmed; a failed write is retried only after the position
        // moves again.
        self.last_saved_index = checkpoint.last_word_index;
        if let Err(err) = self.sink.save(&self.doc_id, checkpoint).await {
            warn!(error = %err, doc = %self.doc_id, "failed to save reading progress");
        }
    }
}
