//! Narrator - the story progression state machine.
//!
//! This is the primary public API of the crate. It owns the rules for
//! creating stories, recording irreversible choices, advancing stages and
//! chapters, and repairing interrupted generations. Every mutating
//! operation persists through the injected [`StoryStore`] before it
//! returns successfully.
//!
//! Within a chapter a story moves `0% -> 50% -> 90% -> 100%`:
//!
//! | stage | event             | generation        | result                         |
//! |-------|-------------------|-------------------|--------------------------------|
//! | 0%    | open chapter      | segment at 0%     | 50%, pause 1 offered           |
//! | 50%   | choose (pause 1)  | segment at 50%    | 90%, pause 2 offered           |
//! | 90%   | choose (pause 2)  | segment at 90%    | 100%; chapter 10 completes     |
//! | 100%  | advance chapter   | segment at 0%     | next chapter at 50%            |

use crate::generation::{GenerationError, Generated, TextGenerator};
use crate::heuristics::Heuristics;
use crate::story::{
    Page, PageId, Stage, Story, StoryConfig, StoryId, StoryStatus, StorySummary, CHAPTER_LIMIT,
};
use crate::store::{StoreError, StoryStore};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from narrator operations.
#[derive(Debug, Error)]
pub enum NarratorError {
    #[error("Invalid story: {0}")]
    Validation(String),

    #[error("No pending option at index {0}")]
    InvalidChoiceIndex(usize),

    #[error("Story not found: {0}")]
    NotFound(StoryId),

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Story {id} is not ready: {reason}")]
    NotReady { id: StoryId, reason: String },

    #[error("A generation is already running for story {0}")]
    Busy(StoryId),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl NarratorError {
    /// Whether trying again (usually through `repair`) can succeed
    /// without the reader changing anything first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NarratorError::Busy(_) | NarratorError::Generation(GenerationError::Backend(_))
        )
    }
}

/// The corrective step `repair` would take for a story right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    /// Nothing to fix.
    Nothing,
    /// Write the chapter opening again, replacing the current chapter text.
    RegenerateOpening,
    /// A choice was recorded but its segment never arrived; generate it.
    ResumeSegment(Stage),
    /// Resume the interrupted text and collect the pause 2 options.
    Continue,
    /// The concluded chapter stops mid-sentence; finish the prose.
    FinishProse,
}

/// Decide the minimal repair for `story` from its persisted state alone.
pub fn plan_repair(story: &Story, heuristics: &Heuristics) -> RepairAction {
    if story.status == StoryStatus::Ended {
        return RepairAction::Nothing;
    }
    if story.status == StoryStatus::Completed {
        return finish_if_incomplete(story, heuristics);
    }
    if story.is_awaiting_choice() {
        return RepairAction::Nothing;
    }

    match story.stage {
        Stage::Start => RepairAction::RegenerateOpening,
        Stage::Middle if story.has_answered(story.chapter, 1) => {
            RepairAction::ResumeSegment(Stage::Middle)
        }
        Stage::Middle => RepairAction::RegenerateOpening,
        Stage::PreConclusion if story.has_answered(story.chapter, 2) => {
            RepairAction::ResumeSegment(Stage::PreConclusion)
        }
        Stage::PreConclusion => RepairAction::Continue,
        Stage::Concluded => finish_if_incomplete(story, heuristics),
    }
}

fn finish_if_incomplete(story: &Story, heuristics: &Heuristics) -> RepairAction {
    if heuristics.incomplete(&story.full_text) {
        RepairAction::FinishProse
    } else {
        RepairAction::Nothing
    }
}

/// The story state machine.
///
/// Generic over the store and the generator so tests can run against
/// `MemoryStore` and `MockGenerator`.
pub struct Narrator<S, G> {
    store: Arc<S>,
    generator: G,
    heuristics: Heuristics,
    in_flight: Mutex<HashSet<StoryId>>,
}

/// Marks a story busy until dropped.
struct BusyGuard<'a> {
    in_flight: &'a Mutex<HashSet<StoryId>>,
    id: StoryId,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl<S: StoryStore, G: TextGenerator> Narrator<S, G> {
    pub fn new(store: Arc<S>, generator: G) -> Self {
        Self {
            store,
            generator,
            heuristics: Heuristics::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the death and truncation checks.
    pub fn with_heuristics(mut self, heuristics: Heuristics) -> Self {
        self.heuristics = heuristics;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn heuristics(&self) -> &Heuristics {
        &self.heuristics
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a story, or return the active one with the same configuration.
    ///
    /// The new story is persisted at chapter 1, stage 0; call
    /// [`open_chapter`](Self::open_chapter) to generate its opening.
    pub fn create_story(&self, config: &StoryConfig) -> Result<Story, NarratorError> {
        config.validate().map_err(NarratorError::Validation)?;

        if let Some(existing) = self.find_duplicate_active(config)? {
            info!(story = %existing.id(), "reusing active story with the same configuration");
            return Ok(existing);
        }

        let mut story = Story::new(config);
        self.store.create(&mut story)?;
        info!(story = %story.id(), title = %story.title(), "created story");
        Ok(story)
    }

    /// The active story whose normalised configuration equals `config`'s.
    pub fn find_duplicate_active(
        &self,
        config: &StoryConfig,
    ) -> Result<Option<Story>, NarratorError> {
        let wanted = config.normalized();
        Ok(self
            .store
            .all()?
            .into_iter()
            .find(|story| story.is_active() && story.config == wanted))
    }

    pub fn get_story(&self, id: StoryId) -> Result<Story, NarratorError> {
        self.store.get(id)?.ok_or(NarratorError::NotFound(id))
    }

    pub fn list_stories(&self) -> Result<Vec<StorySummary>, NarratorError> {
        Ok(self.store.list()?)
    }

    /// Delete a story. Returns whether it existed.
    pub fn delete_story(&self, id: StoryId) -> Result<bool, NarratorError> {
        let existed = self.store.delete(id)?;
        if existed {
            info!(story = %id, "deleted story");
        }
        Ok(existed)
    }

    // ========================================================================
    // Progression
    // ========================================================================

    /// Generate the opening of the current chapter (stage 0 to 50).
    pub async fn open_chapter(&self, id: StoryId) -> Result<Story, NarratorError> {
        let _guard = self.begin(id)?;
        let mut story = self.get_story(id)?;

        if !story.is_active() || story.stage != Stage::Start || story.is_awaiting_choice() {
            return Err(not_ready(&story, "chapter is already open"));
        }

        self.run_segment(&mut story, Stage::Start).await?;
        Ok(story)
    }

    /// Record the pending option at `index` and generate the next segment.
    ///
    /// The choice is persisted before the backend is called. If the call
    /// fails, the stage is unchanged and no options are pending; `repair`
    /// resumes from there without asking again.
    pub async fn choose_option(&self, id: StoryId, index: usize) -> Result<Story, NarratorError> {
        let _guard = self.begin(id)?;
        let mut story = self.get_story(id)?;

        let stage = story.stage;
        match story.pending() {
            Some((_, pause)) if story.is_active() && stage.pause() == Some(pause) => {}
            Some(_) => return Err(not_ready(&story, "pending options do not match the stage")),
            None => return Err(NarratorError::InvalidChoiceIndex(index)),
        }
        let pause = story
            .record_choice(index)
            .map(|record| record.pause)
            .ok_or(NarratorError::InvalidChoiceIndex(index))?;
        self.store.update(&mut story)?;
        info!(story = %id, chapter = story.chapter, pause, index, "recorded choice");

        self.run_segment(&mut story, stage).await?;
        Ok(story)
    }

    /// Move to the next chapter and generate its opening.
    ///
    /// The chapter change is persisted first; if the opening then fails,
    /// the story waits at stage 0 for `repair`.
    pub async fn advance_chapter(&self, id: StoryId) -> Result<Story, NarratorError> {
        let _guard = self.begin(id)?;
        let mut story = self.get_story(id)?;

        if !story.begin_next_chapter() {
            let reason = if story.chapter >= CHAPTER_LIMIT {
                "last chapter reached"
            } else if !story.is_active() {
                "story is no longer active"
            } else {
                "chapter is not concluded"
            };
            return Err(not_ready(&story, reason));
        }
        self.store.update(&mut story)?;
        info!(story = %id, chapter = story.chapter, "advanced chapter");

        self.run_segment(&mut story, Stage::Start).await?;
        Ok(story)
    }

    /// Inspect the story and take the minimal corrective step.
    ///
    /// Repair never touches recorded choices, and it keeps no attempt
    /// counters: calling it again recomputes the action from stored state.
    pub async fn repair(&self, id: StoryId) -> Result<(Story, RepairAction), NarratorError> {
        let _guard = self.begin(id)?;
        let mut story = self.get_story(id)?;

        let action = plan_repair(&story, &self.heuristics);
        info!(story = %id, chapter = story.chapter, stage = %story.stage, ?action, "repair");

        match action {
            RepairAction::Nothing => {}
            RepairAction::RegenerateOpening => {
                story.full_text.clear();
                self.run_segment(&mut story, Stage::Start).await?;
            }
            RepairAction::ResumeSegment(stage) => {
                self.run_segment(&mut story, stage).await?;
            }
            RepairAction::Continue | RepairAction::FinishProse => {
                self.run_continuation(&mut story).await?;
            }
        }
        Ok((story, action))
    }

    // ========================================================================
    // Pages
    // ========================================================================

    /// Archive the current text as a page, unless it matches the latest one.
    ///
    /// Fails with [`NarratorError::Busy`] while a generation is running.
    pub fn snapshot(&self, id: StoryId) -> Result<Option<Page>, NarratorError> {
        let _guard = self.begin(id)?;
        let mut story = self.get_story(id)?;
        let label = story.page_label();
        let page = story.snapshot_page(label).cloned();
        if page.is_some() {
            self.store.update(&mut story)?;
        }
        Ok(page)
    }

    /// A read-only archived page.
    pub fn page(&self, id: StoryId, page_id: PageId) -> Result<Page, NarratorError> {
        let story = self.get_story(id)?;
        story
            .page(page_id)
            .cloned()
            .ok_or(NarratorError::PageNotFound(page_id))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn begin(&self, id: StoryId) -> Result<BusyGuard<'_>, NarratorError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(id) {
            warn!(story = %id, "rejected overlapping generation");
            return Err(NarratorError::Busy(id));
        }
        Ok(BusyGuard {
            in_flight: &self.in_flight,
            id,
        })
    }

    /// Generate the segment following `stage` and apply it.
    async fn run_segment(&self, story: &mut Story, stage: Stage) -> Result<(), NarratorError> {
        let Some(next) = stage.next() else {
            return Err(not_ready(story, "chapter is already concluded"));
        };

        debug!(story = %story.id(), chapter = story.chapter, stage = %stage, "generating segment");
        let generated = self.generator.generate_segment(story, stage).await?;
        let Generated { text, choices } = generated;

        story.append_segment(&text);
        story.stage = next;
        match (next.pause(), choices) {
            (Some(pause), Some(options)) => story.set_pending(options, pause),
            (Some(pause), None) => {
                warn!(story = %story.id(), pause, "segment arrived without choices");
            }
            (None, _) => {}
        }
        if next == Stage::Concluded && story.chapter >= CHAPTER_LIMIT {
            story.status = StoryStatus::Completed;
            info!(story = %story.id(), "story completed");
        }

        self.finish_generation(story, &text)
    }

    /// Resume the current text and apply the continuation.
    async fn run_continuation(&self, story: &mut Story) -> Result<(), NarratorError> {
        debug!(story = %story.id(), chapter = story.chapter, stage = %story.stage, "continuing text");
        let generated = self.generator.continue_generation(story).await?;
        let Generated { text, choices } = generated;

        story.append_continuation(&text);
        // Only the pause 2 options can still be missing at this point.
        if let (Stage::PreConclusion, Some(options)) = (story.stage, choices) {
            story.set_pending(options, 2);
        }

        self.finish_generation(story, &text)
    }

    /// Death check, page snapshot and persist; shared by every generation.
    fn finish_generation(&self, story: &mut Story, new_text: &str) -> Result<(), NarratorError> {
        if story.config.first_person && self.heuristics.death(new_text) {
            warn!(story = %story.id(), chapter = story.chapter, "protagonist died, ending story");
            story.end();
        }

        let label = story.page_label();
        story.snapshot_page(label);
        self.store.update(story)?;

        info!(
            story = %story.id(),
            chapter = story.chapter,
            stage = %story.stage,
            status = story.status.name(),
            awaiting_choice = story.is_awaiting_choice(),
            "story updated"
        );
        Ok(())
    }
}

fn not_ready(story: &Story, reason: &str) -> NarratorError {
    NarratorError::NotReady {
        id: story.id(),
        reason: reason.to_string(),
    }
}
