//! The story aggregate.
//!
//! A `Story` carries the reader's immutable configuration, the progression
//! state (chapter, stage, pending choices), the append-only choice history
//! and the archived page snapshots. Only the narrator mutates it; the
//! methods here enforce the local invariants (exactly three pending options,
//! append-only history, de-duplicated pages).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Last chapter of every story.
pub const CHAPTER_LIMIT: u32 = 10;

/// Number of options offered at each pause.
pub const CHOICES_PER_PAUSE: usize = 3;

const TITLE_MAX: usize = 80;
const PREMISE_MAX: usize = 2000;
const NUCLEI_MAX: usize = 600;
const TONE_MAX: usize = 40;
const AGE_RATING_MAX: usize = 10;

const DEFAULT_TITLE: &str = "História sem título";
const DEFAULT_TONE: &str = "Aventura";
const DEFAULT_AGE_RATING: &str = "14+";

/// Unique identifier for a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoryId(Uuid);

impl StoryId {
    /// Create a new unique story ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for StoryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Unique identifier for an archived page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(Uuid);

impl PageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for PageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Position within a chapter's generation cycle.
///
/// Persisted as its percentage (0, 50, 90, 100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Stage {
    /// Nothing generated yet for this chapter.
    #[default]
    Start,
    /// First half written; pause 1 follows.
    Middle,
    /// Written up to the conclusion; pause 2 follows.
    PreConclusion,
    /// Chapter concluded.
    Concluded,
}

impl Stage {
    /// Progress through the chapter, in percent.
    pub fn percent(self) -> u8 {
        match self {
            Stage::Start => 0,
            Stage::Middle => 50,
            Stage::PreConclusion => 90,
            Stage::Concluded => 100,
        }
    }

    /// The stage reached after generating from this one.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Start => Some(Stage::Middle),
            Stage::Middle => Some(Stage::PreConclusion),
            Stage::PreConclusion => Some(Stage::Concluded),
            Stage::Concluded => None,
        }
    }

    /// The pause that is answered at this stage, if any.
    pub fn pause(self) -> Option<u8> {
        match self {
            Stage::Middle => Some(1),
            Stage::PreConclusion => Some(2),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Stage {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Stage::Start),
            50 => Ok(Stage::Middle),
            90 => Ok(Stage::PreConclusion),
            100 => Ok(Stage::Concluded),
            other => Err(format!("invalid stage {other}, expected 0, 50, 90 or 100")),
        }
    }
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> Self {
        stage.percent()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.percent())
    }
}

/// Lifecycle state of a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryStatus {
    #[default]
    Active,
    /// All chapters concluded.
    Completed,
    /// Terminated early (protagonist died).
    Ended,
}

impl StoryStatus {
    pub fn name(&self) -> &'static str {
        match self {
            StoryStatus::Active => "active",
            StoryStatus::Completed => "completed",
            StoryStatus::Ended => "ended",
        }
    }
}

/// The reader-supplied premise of a story.
///
/// Two active stories may not share the same normalised configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoryConfig {
    pub title: String,
    pub premise: String,
    pub nuclei: String,
    pub tone: String,
    pub age_rating: String,
    pub first_person: bool,
}

impl StoryConfig {
    /// Create a configuration with the given premise and default everything else.
    pub fn new(premise: impl Into<String>) -> Self {
        Self {
            premise: premise.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_nuclei(mut self, nuclei: impl Into<String>) -> Self {
        self.nuclei = nuclei.into();
        self
    }

    pub fn with_tone(mut self, tone: impl Into<String>) -> Self {
        self.tone = tone.into();
        self
    }

    pub fn with_age_rating(mut self, rating: impl Into<String>) -> Self {
        self.age_rating = rating.into();
        self
    }

    pub fn with_first_person(mut self, first_person: bool) -> Self {
        self.first_person = first_person;
        self
    }

    /// Apply defaults and length bounds. Idempotent.
    pub fn normalized(&self) -> Self {
        Self {
            title: clip(&self.title, TITLE_MAX, DEFAULT_TITLE),
            premise: clip(&self.premise, PREMISE_MAX, ""),
            nuclei: clip(&self.nuclei, NUCLEI_MAX, ""),
            tone: clip(&self.tone, TONE_MAX, DEFAULT_TONE),
            age_rating: clip(&self.age_rating, AGE_RATING_MAX, DEFAULT_AGE_RATING),
            first_person: self.first_person,
        }
    }

    /// Check the fields a story cannot be created without.
    pub fn validate(&self) -> Result<(), String> {
        if self.premise.trim().is_empty() {
            return Err("premise must not be empty".to_string());
        }
        Ok(())
    }
}

/// Trim, fall back when empty, and cut to `max` characters.
fn clip(value: &str, max: usize, fallback: &str) -> String {
    let trimmed = value.trim();
    let source = if trimmed.is_empty() { fallback } else { trimmed };
    source.chars().take(max).collect()
}

/// One irreversible reader decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceRecord {
    pub chapter: u32,
    pub pause: u8,
    pub choice: String,
    pub at: DateTime<Utc>,
}

/// An archived, read-only copy of the chapter text at a stage boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: PageId,
    pub label: String,
    pub text: String,
    pub at: DateTime<Utc>,
    pub chapter: u32,
    pub stage: Stage,
}

/// List projection of a story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorySummary {
    pub story_id: StoryId,
    pub title: String,
    pub status: StoryStatus,
    pub chapter: u32,
    pub stage: Stage,
    pub updated_at: DateTime<Utc>,
}

fn first_chapter() -> u32 {
    1
}

/// A story and its full progression history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub story_id: StoryId,

    #[serde(flatten)]
    pub config: StoryConfig,

    #[serde(default)]
    pub status: StoryStatus,

    #[serde(default = "first_chapter")]
    pub chapter: u32,

    #[serde(default)]
    pub stage: Stage,

    /// Accumulated text of the current chapter.
    #[serde(default)]
    pub full_text: String,

    #[serde(default)]
    pending_choices: Option<[String; CHOICES_PER_PAUSE]>,

    #[serde(default)]
    pending_choice_at: Option<u8>,

    #[serde(default)]
    choices: Vec<ChoiceRecord>,

    #[serde(default)]
    pages: Vec<Page>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Story {
    /// Create a fresh story at chapter 1, stage 0, with a new id.
    ///
    /// The configuration is normalised; validation is the caller's job.
    pub fn new(config: &StoryConfig) -> Self {
        let now = Utc::now();
        Self {
            story_id: StoryId::new(),
            config: config.normalized(),
            status: StoryStatus::Active,
            chapter: 1,
            stage: Stage::Start,
            full_text: String::new(),
            pending_choices: None,
            pending_choice_at: None,
            choices: Vec::new(),
            pages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> StoryId {
        self.story_id
    }

    pub fn title(&self) -> &str {
        &self.config.title
    }

    pub fn is_active(&self) -> bool {
        self.status == StoryStatus::Active
    }

    /// The options awaiting a decision, with the pause they belong to.
    pub fn pending(&self) -> Option<(&[String; CHOICES_PER_PAUSE], u8)> {
        match (&self.pending_choices, self.pending_choice_at) {
            (Some(options), Some(pause)) => Some((options, pause)),
            _ => None,
        }
    }

    pub fn pending_choices(&self) -> Option<&[String; CHOICES_PER_PAUSE]> {
        self.pending().map(|(options, _)| options)
    }

    pub fn is_awaiting_choice(&self) -> bool {
        self.pending().is_some()
    }

    /// Offer a new set of options for `pause`.
    pub fn set_pending(&mut self, options: [String; CHOICES_PER_PAUSE], pause: u8) {
        self.pending_choices = Some(options);
        self.pending_choice_at = Some(pause);
    }

    pub fn clear_pending(&mut self) {
        self.pending_choices = None;
        self.pending_choice_at = None;
    }

    /// Full decision history, oldest first.
    pub fn choices(&self) -> &[ChoiceRecord] {
        &self.choices
    }

    /// Whether `pause` of `chapter` has already been answered.
    pub fn has_answered(&self, chapter: u32, pause: u8) -> bool {
        self.choices
            .iter()
            .any(|c| c.chapter == chapter && c.pause == pause)
    }

    /// Record the option at `index` and clear the pending set.
    ///
    /// Returns `None` and leaves the story untouched when nothing is pending
    /// or the index is out of range.
    pub fn record_choice(&mut self, index: usize) -> Option<&ChoiceRecord> {
        let (options, pause) = self.pending()?;
        let choice = options.get(index)?.clone();

        self.choices.push(ChoiceRecord {
            chapter: self.chapter,
            pause,
            choice,
            at: Utc::now(),
        });
        self.clear_pending();
        self.choices.last()
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn page(&self, id: PageId) -> Option<&Page> {
        self.pages.iter().find(|p| p.id == id)
    }

    /// Label for a snapshot taken now, e.g. "Capítulo 3 · 90%".
    pub fn page_label(&self) -> String {
        format!("Capítulo {} · {}", self.chapter, self.stage)
    }

    /// Archive the current text as a page.
    ///
    /// Skipped when the text is empty or identical to the latest page.
    pub fn snapshot_page(&mut self, label: impl Into<String>) -> Option<&Page> {
        if self.full_text.trim().is_empty() {
            return None;
        }
        if self.pages.last().map(|p| p.text == self.full_text).unwrap_or(false) {
            return None;
        }

        self.pages.push(Page {
            id: PageId::new(),
            label: label.into(),
            text: self.full_text.clone(),
            at: Utc::now(),
            chapter: self.chapter,
            stage: self.stage,
        });
        self.pages.last()
    }

    /// Append a freshly generated segment as a new paragraph block.
    pub fn append_segment(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.full_text.is_empty() {
            self.full_text.push_str("\n\n");
        }
        self.full_text.push_str(text);
    }

    /// Append a continuation so it reads on from where the text stopped.
    pub fn append_continuation(&mut self, text: &str) {
        let text = text.trim_end();
        if text.trim().is_empty() {
            return;
        }
        let needs_space = self
            .full_text
            .chars()
            .last()
            .map(|c| !c.is_whitespace())
            .unwrap_or(false)
            && text.chars().next().map(|c| c.is_alphanumeric()).unwrap_or(false);
        if needs_space {
            self.full_text.push(' ');
        }
        self.full_text.push_str(text);
    }

    /// Whether the story may move on to the next chapter.
    pub fn can_advance_chapter(&self) -> bool {
        self.status == StoryStatus::Active
            && self.stage == Stage::Concluded
            && self.chapter < CHAPTER_LIMIT
    }

    /// Archive the chapter and reset to stage 0 of the next one.
    ///
    /// Returns `false` without changes when the story cannot advance.
    pub fn begin_next_chapter(&mut self) -> bool {
        if !self.can_advance_chapter() {
            return false;
        }
        let label = self.page_label();
        self.snapshot_page(label);
        self.chapter += 1;
        self.stage = Stage::Start;
        self.full_text.clear();
        self.clear_pending();
        true
    }

    /// Force the terminal state used when the protagonist dies.
    pub fn end(&mut self) {
        self.status = StoryStatus::Ended;
        self.stage = Stage::Concluded;
        self.clear_pending();
    }

    /// Text of earlier chapters, most recent last, for prompt context.
    pub fn previous_text(&self) -> Option<&str> {
        self.pages
            .iter()
            .rev()
            .find(|p| p.chapter < self.chapter)
            .map(|p| p.text.as_str())
    }

    pub fn summary(&self) -> StorySummary {
        StorySummary {
            story_id: self.story_id,
            title: self.config.title.clone(),
            status: self.status,
            chapter: self.chapter,
            stage: self.stage,
            updated_at: self.updated_at,
        }
    }

    /// Refresh the audit timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Repair shapes that deserialised but break invariants.
    ///
    /// Pending options survive only on an active story whose stage awaits
    /// that pause (50% with pause 1, 90% with pause 2). Anything else clears
    /// the pending set; an out-of-range chapter is clamped.
    pub fn sanitize(&mut self) {
        let pending_ok = match (&self.pending_choices, self.pending_choice_at) {
            (None, None) => true,
            (Some(_), Some(pause)) => self.is_active() && self.stage.pause() == Some(pause),
            _ => false,
        };
        if !pending_ok {
            self.clear_pending();
        }
        self.chapter = self.chapter.clamp(1, CHAPTER_LIMIT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> [String; 3] {
        ["Fugir".to_string(), "Lutar".to_string(), "Negociar".to_string()]
    }

    fn story() -> Story {
        Story::new(&StoryConfig::new("Um farol abandonado no litoral"))
    }

    #[test]
    fn test_config_normalization_defaults() {
        let config = StoryConfig::new("  premissa  ").normalized();
        assert_eq!(config.title, "História sem título");
        assert_eq!(config.premise, "premissa");
        assert_eq!(config.tone, "Aventura");
        assert_eq!(config.age_rating, "14+");
    }

    #[test]
    fn test_config_normalization_clips_by_chars() {
        let long_title: String = "ã".repeat(200);
        let config = StoryConfig::new("p").with_title(long_title).normalized();
        assert_eq!(config.title.chars().count(), 80);
        assert_eq!(config.normalized(), config);
    }

    #[test]
    fn test_config_validation() {
        assert!(StoryConfig::new("   ").validate().is_err());
        assert!(StoryConfig::new("algo").validate().is_ok());
    }

    #[test]
    fn test_new_story_state() {
        let story = story();
        assert_eq!(story.status, StoryStatus::Active);
        assert_eq!(story.chapter, 1);
        assert_eq!(story.stage, Stage::Start);
        assert!(story.choices().is_empty());
        assert!(story.pages().is_empty());
        assert!(!story.is_awaiting_choice());
    }

    #[test]
    fn test_stage_serializes_as_percent() {
        assert_eq!(serde_json::to_string(&Stage::PreConclusion).unwrap(), "90");
        let stage: Stage = serde_json::from_str("50").unwrap();
        assert_eq!(stage, Stage::Middle);
        assert!(serde_json::from_str::<Stage>("42").is_err());
    }

    #[test]
    fn test_record_choice_clears_pending() {
        let mut story = story();
        story.set_pending(options(), 1);

        let record = story.record_choice(1).cloned().unwrap();
        assert_eq!(record.choice, "Lutar");
        assert_eq!(record.pause, 1);
        assert_eq!(record.chapter, 1);
        assert!(!story.is_awaiting_choice());
        assert!(story.has_answered(1, 1));
    }

    #[test]
    fn test_record_choice_ignores_bad_input() {
        let mut story = story();
        assert!(story.record_choice(0).is_none());

        story.set_pending(options(), 2);
        assert!(story.record_choice(3).is_none());
        assert!(story.choices().is_empty());
        assert!(story.is_awaiting_choice());
    }

    #[test]
    fn test_snapshot_dedup() {
        let mut story = story();
        assert!(story.snapshot_page("vazio").is_none());

        story.append_segment("A maré subia.");
        assert!(story.snapshot_page("p1").is_some());
        assert!(story.snapshot_page("p1 de novo").is_none());
        assert_eq!(story.pages().len(), 1);

        story.append_segment("O farol acendeu.");
        let id = story.snapshot_page("p2").map(|p| p.id).unwrap();
        assert_eq!(story.pages().len(), 2);
        assert_eq!(story.page(id).unwrap().text, story.full_text);
    }

    #[test]
    fn test_append_continuation_joins_mid_sentence() {
        let mut story = story();
        story.append_segment("Ela abriu a porta e");
        story.append_continuation("viu o mar.");
        assert_eq!(story.full_text, "Ela abriu a porta e viu o mar.");

        story.append_continuation(", depois voltou.");
        assert_eq!(story.full_text, "Ela abriu a porta e viu o mar., depois voltou.");
    }

    #[test]
    fn test_can_advance_chapter_boundary() {
        let mut story = story();
        story.stage = Stage::Concluded;
        story.chapter = 9;
        assert!(story.can_advance_chapter());

        story.chapter = 10;
        assert!(!story.can_advance_chapter());

        story.chapter = 5;
        story.status = StoryStatus::Ended;
        assert!(!story.can_advance_chapter());
    }

    #[test]
    fn test_begin_next_chapter_archives_and_resets() {
        let mut story = story();
        story.append_segment("Fim do primeiro capítulo.");
        story.stage = Stage::Concluded;

        assert!(story.begin_next_chapter());
        assert_eq!(story.chapter, 2);
        assert_eq!(story.stage, Stage::Start);
        assert!(story.full_text.is_empty());
        assert_eq!(story.pages().len(), 1);
        assert_eq!(story.previous_text(), Some("Fim do primeiro capítulo."));

        assert!(!story.begin_next_chapter());
    }

    #[test]
    fn test_end_forces_terminal_state() {
        let mut story = story();
        story.stage = Stage::Middle;
        story.set_pending(options(), 1);
        story.end();
        assert_eq!(story.status, StoryStatus::Ended);
        assert_eq!(story.stage, Stage::Concluded);
        assert!(!story.is_awaiting_choice());
    }

    #[test]
    fn test_serde_layout_and_defaults() {
        let mut story = story();
        story.set_pending(options(), 1);
        let value = serde_json::to_value(&story).unwrap();
        assert!(value.get("storyId").is_some());
        assert!(value.get("fullText").is_some());
        assert_eq!(value["pendingChoiceAt"], 1);
        assert_eq!(value["ageRating"], "14+");
        assert_eq!(value["status"], "active");

        let legacy = format!(r#"{{"storyId": "{}", "premise": "x"}}"#, Uuid::new_v4());
        let loaded: Story = serde_json::from_str(&legacy).unwrap();
        assert_eq!(loaded.chapter, 1);
        assert_eq!(loaded.stage, Stage::Start);
        assert!(loaded.choices().is_empty());
    }

    #[test]
    fn test_sanitize_half_pending() {
        let raw = format!(
            r#"{{"storyId": "{}", "premise": "x", "chapter": 14, "pendingChoices": ["a", "b", "c"]}}"#,
            Uuid::new_v4()
        );
        let mut story: Story = serde_json::from_str(&raw).unwrap();
        story.sanitize();
        assert!(!story.is_awaiting_choice());
        assert_eq!(story.chapter, CHAPTER_LIMIT);
    }

    #[test]
    fn test_sanitize_pending_must_match_stage() {
        let mut concluded = story();
        concluded.stage = Stage::Concluded;
        concluded.set_pending(options(), 1);
        concluded.sanitize();
        assert!(!concluded.is_awaiting_choice());

        let mut wrong_pause = story();
        wrong_pause.stage = Stage::PreConclusion;
        wrong_pause.set_pending(options(), 1);
        wrong_pause.sanitize();
        assert!(!wrong_pause.is_awaiting_choice());

        let mut ended = story();
        ended.stage = Stage::Middle;
        ended.set_pending(options(), 1);
        ended.status = StoryStatus::Ended;
        ended.sanitize();
        assert!(!ended.is_awaiting_choice());

        let mut valid = story();
        valid.stage = Stage::PreConclusion;
        valid.set_pending(options(), 2);
        valid.sanitize();
        assert_eq!(valid.pending().map(|(_, pause)| pause), Some(2));
    }

    #[test]
    fn test_story_id_roundtrip_display() {
        let id = StoryId::new();
        let parsed: StoryId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
