//! Interactive fiction engine with AI-generated chapters.
//!
//! This crate provides:
//! - The story model: chapters, stages, pending choices and archived pages
//! - A durable story store (directory-backed or in memory)
//! - The `Narrator` state machine that records choices and drives generation
//! - Repair of interrupted or truncated generations
//!
//! # Quick Start
//!
//! ```ignore
//! use historia_core::{FileStore, GeminiGenerator, Narrator, StoryConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(FileStore::open("./data")?);
//!     let narrator = Narrator::new(store.clone(), GeminiGenerator::new(store));
//!
//!     let story = narrator.create_story(&StoryConfig::new("Um farol abandonado"))?;
//!     let story = narrator.open_chapter(story.id()).await?;
//!     println!("{}", story.full_text);
//!
//!     let story = narrator.choose_option(story.id(), 0).await?;
//!     println!("{}", story.full_text);
//!     Ok(())
//! }
//! ```

pub mod generation;
pub mod heuristics;
pub mod narrator;
pub mod prompt;
pub mod settings;
pub mod store;
pub mod story;
pub mod testing;

// Primary public API
pub use generation::{
    parse_output, GeminiGenerator, Generated, GenerationConfig, GenerationError, TextGenerator,
};
pub use heuristics::Heuristics;
pub use narrator::{plan_repair, Narrator, NarratorError, RepairAction};
pub use settings::AudioSettings;
pub use store::{FileStore, MemoryStore, StoreError, StoryStore};
pub use story::{
    ChoiceRecord, Page, PageId, Stage, Story, StoryConfig, StoryId, StoryStatus, StorySummary,
    CHAPTER_LIMIT,
};
pub use testing::{MockGenerator, MockReply, TestHarness};
