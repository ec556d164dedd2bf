//! Testing utilities for the story engine.
//!
//! This module provides tools for integration testing:
//! - `MockGenerator` for deterministic testing without API calls
//! - `TestHarness` for scripted story scenarios
//! - Assertion helpers for verifying story state

use crate::generation::{parse_output, GenerationError, Generated, TextGenerator};
use crate::narrator::{Narrator, NarratorError, RepairAction};
use crate::story::{Stage, Story, StoryConfig, StoryId, StoryStatus};
use crate::store::{MemoryStore, StoryStore};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// A scripted reply from the mock generator.
#[derive(Debug, Clone)]
pub enum MockReply {
    Output(Generated),
    Backend(String),
    MissingCredential,
}

impl MockReply {
    /// Prose with no choices section.
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Output(Generated::text(text))
    }

    /// Prose followed by three options.
    pub fn with_choices(text: impl Into<String>, choices: [&str; 3]) -> Self {
        MockReply::Output(Generated::with_choices(text, choices.map(str::to_string)))
    }

    /// Raw model output, parsed the same way real responses are.
    pub fn raw(output: &str) -> Self {
        MockReply::Output(parse_output(output))
    }

    /// A failed backend call carrying `message`.
    pub fn failure(message: impl Into<String>) -> Self {
        MockReply::Backend(message.into())
    }

    fn into_result(self) -> Result<Generated, GenerationError> {
        match self {
            MockReply::Output(generated) => Ok(generated),
            MockReply::Backend(message) => Err(GenerationError::Backend(message)),
            MockReply::MissingCredential => Err(GenerationError::MissingCredential),
        }
    }
}

/// Which generator operation was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Segment(Stage),
    Continuation,
}

/// A call the mock received, with the story state it saw.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub kind: CallKind,
    pub story_id: StoryId,
    pub chapter: u32,
    pub stage: Stage,
    pub full_text: String,
}

#[derive(Debug, Default)]
struct MockState {
    replies: VecDeque<MockReply>,
    calls: Vec<MockCall>,
}

/// A generator that returns scripted replies in order.
///
/// Clones share the same script and call log, so a test can keep one
/// handle while the narrator owns another. An exhausted script fails
/// like an unreachable backend.
#[derive(Debug, Clone, Default)]
pub struct MockGenerator {
    state: Arc<Mutex<MockState>>,
}

impl MockGenerator {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                replies: replies.into(),
                calls: Vec::new(),
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a reply to the end of the script.
    pub fn queue(&self, reply: MockReply) {
        self.state().replies.push_back(reply);
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn remaining(&self) -> usize {
        self.state().replies.len()
    }

    fn respond(&self, kind: CallKind, story: &Story) -> Result<Generated, GenerationError> {
        let mut state = self.state();
        state.calls.push(MockCall {
            kind,
            story_id: story.id(),
            chapter: story.chapter,
            stage: story.stage,
            full_text: story.full_text.clone(),
        });
        state
            .replies
            .pop_front()
            .unwrap_or_else(|| MockReply::failure("no scripted reply left"))
            .into_result()
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate_segment(
        &self,
        story: &Story,
        stage: Stage,
    ) -> Result<Generated, GenerationError> {
        self.respond(CallKind::Segment(stage), story)
    }

    async fn continue_generation(&self, story: &Story) -> Result<Generated, GenerationError> {
        self.respond(CallKind::Continuation, story)
    }
}

/// Test harness for running story scenarios.
pub struct TestHarness {
    /// The narrator under test.
    pub narrator: Narrator<MemoryStore, MockGenerator>,
    /// Handle on the narrator's generator script.
    pub generator: MockGenerator,
    /// The narrator's store.
    pub store: Arc<MemoryStore>,
}

impl TestHarness {
    /// Create a harness with an empty store and an empty script.
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let generator = MockGenerator::default();
        let narrator = Narrator::new(Arc::clone(&store), generator.clone());
        Self {
            narrator,
            generator,
            store,
        }
    }

    /// Queue a segment with three options.
    pub fn expect_segment(&mut self, text: &str, choices: [&str; 3]) -> &mut Self {
        self.generator.queue(MockReply::with_choices(text, choices));
        self
    }

    /// Queue prose with no choices.
    pub fn expect_text(&mut self, text: &str) -> &mut Self {
        self.generator.queue(MockReply::text(text));
        self
    }

    /// Queue a backend failure.
    pub fn expect_failure(&mut self, message: &str) -> &mut Self {
        self.generator.queue(MockReply::failure(message));
        self
    }

    pub fn expect(&mut self, reply: MockReply) -> &mut Self {
        self.generator.queue(reply);
        self
    }

    /// Create a story from a premise and generate its opening.
    pub async fn start(&mut self, config: StoryConfig) -> Result<Story, NarratorError> {
        let story = self.narrator.create_story(&config)?;
        self.narrator.open_chapter(story.id()).await
    }

    pub async fn choose(&mut self, id: StoryId, index: usize) -> Result<Story, NarratorError> {
        self.narrator.choose_option(id, index).await
    }

    pub async fn repair(&mut self, id: StoryId) -> Result<(Story, RepairAction), NarratorError> {
        self.narrator.repair(id).await
    }

    pub async fn advance(&mut self, id: StoryId) -> Result<Story, NarratorError> {
        self.narrator.advance_chapter(id).await
    }

    /// The story as currently persisted.
    ///
    /// Panics if the story does not exist; harness use only.
    pub fn stored(&self, id: StoryId) -> Story {
        match self.store.get(id) {
            Ok(Some(story)) => story,
            other => panic!("story {id} not in store: {other:?}"),
        }
    }

    pub fn story_count(&self) -> usize {
        self.store.len()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert the story is at `chapter` and `stage`.
#[track_caller]
pub fn assert_position(story: &Story, chapter: u32, stage: Stage) {
    assert_eq!(
        (story.chapter, story.stage),
        (chapter, stage),
        "Expected chapter {chapter} at {stage}, got chapter {} at {}",
        story.chapter,
        story.stage
    );
}

/// Assert the story offers exactly these options for `pause`.
#[track_caller]
pub fn assert_pending(story: &Story, pause: u8, options: [&str; 3]) {
    let Some((pending, at)) = story.pending() else {
        panic!("Expected pending options for pause {pause}, found none");
    };
    assert_eq!(at, pause, "Expected pause {pause}, got {at}");
    assert_eq!(pending.clone(), options.map(str::to_string));
}

/// Assert no options are pending.
#[track_caller]
pub fn assert_not_awaiting(story: &Story) {
    assert!(
        !story.is_awaiting_choice(),
        "Expected no pending options, found {:?}",
        story.pending_choices()
    );
}

/// Assert the story's lifecycle status.
#[track_caller]
pub fn assert_status(story: &Story, status: StoryStatus) {
    assert_eq!(
        story.status,
        status,
        "Expected status {}, got {}",
        status.name(),
        story.status.name()
    );
}
