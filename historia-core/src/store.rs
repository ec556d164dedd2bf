//! Story persistence.
//!
//! `StoryStore` is the handle the narrator and generator are given; it holds
//! story records keyed by id plus three scalar settings records (credential,
//! model id, audio preferences). All operations are synchronous and either
//! apply fully or not at all.

use crate::settings::{non_blank, AudioSettings, DEFAULT_MODEL};
use crate::story::{Story, StoryId, StorySummary};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Story not found: {0}")]
    NotFound(StoryId),

    #[error("Story already exists: {0}")]
    AlreadyExists(StoryId),

    #[error("Invalid record format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Current story record version.
const STORE_VERSION: u32 = 1;

/// Durable storage for stories and settings.
pub trait StoryStore: Send + Sync {
    /// Insert a new story. Fails if the id is taken.
    fn create(&self, story: &mut Story) -> Result<(), StoreError>;

    /// Fetch a story by id.
    fn get(&self, id: StoryId) -> Result<Option<Story>, StoreError>;

    /// Replace an existing story, refreshing its `updated_at`.
    fn update(&self, story: &mut Story) -> Result<(), StoreError>;

    /// Remove a story. Returns whether it existed.
    fn delete(&self, id: StoryId) -> Result<bool, StoreError>;

    /// Every readable story, newest created first.
    fn all(&self) -> Result<Vec<Story>, StoreError>;

    /// Summary projection of every story, newest created first.
    fn list(&self) -> Result<Vec<StorySummary>, StoreError> {
        Ok(self.all()?.iter().map(Story::summary).collect())
    }

    fn credential(&self) -> Result<Option<String>, StoreError>;

    /// Store the credential; `None` or blank clears it.
    fn set_credential(&self, credential: Option<&str>) -> Result<(), StoreError>;

    fn model(&self) -> Result<String, StoreError>;

    /// Store the model id; `None` or blank restores the default.
    fn set_model(&self, model: Option<&str>) -> Result<(), StoreError>;

    fn audio_settings(&self) -> Result<AudioSettings, StoreError>;

    fn set_audio_settings(&self, settings: &AudioSettings) -> Result<(), StoreError>;
}

fn newest_first(stories: &mut [Story]) {
    stories.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

// ============================================================================
// File-backed store
// ============================================================================

#[derive(Serialize)]
struct SavedStoryRef<'a> {
    version: u32,
    story: &'a Story,
}

#[derive(Deserialize)]
struct SavedStory {
    #[serde(default)]
    version: u32,
    story: serde_json::Value,
}

/// Directory-backed store.
///
/// ```text
/// <root>/stories/<storyId>.json   versioned story records
/// <root>/settings/credential      plain text
/// <root>/settings/model           plain text
/// <root>/settings/audio.json      audio preferences
/// ```
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("stories"))?;
        fs::create_dir_all(root.join("settings"))?;
        debug!(root = %root.display(), "opened file store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn story_path(&self, id: StoryId) -> PathBuf {
        self.root.join("stories").join(format!("{id}.json"))
    }

    fn settings_path(&self, name: &str) -> PathBuf {
        self.root.join("settings").join(name)
    }

    fn write_story(&self, story: &Story) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(&SavedStoryRef {
            version: STORE_VERSION,
            story,
        })?;
        write_atomic(&self.story_path(story.id()), content.as_bytes())
    }

    /// Read and validate a story record.
    pub fn read_story(path: impl AsRef<Path>) -> Result<Story, StoreError> {
        let content = fs::read_to_string(path)?;
        let saved: SavedStory = serde_json::from_str(&content)
            .map_err(|e| StoreError::InvalidFormat(e.to_string()))?;

        if saved.version != STORE_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_VERSION,
                found: saved.version,
            });
        }

        let mut story: Story = serde_json::from_value(saved.story)
            .map_err(|e| StoreError::InvalidFormat(e.to_string()))?;
        story.sanitize();
        Ok(story)
    }

    fn read_setting(&self, name: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.settings_path(name)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_setting(&self, name: &str, value: Option<&str>) -> Result<(), StoreError> {
        let path = self.settings_path(name);
        match value {
            Some(value) => write_atomic(&path, value.as_bytes()),
            None => remove_if_exists(&path).map(|_| ()),
        }
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl StoryStore for FileStore {
    fn create(&self, story: &mut Story) -> Result<(), StoreError> {
        if self.story_path(story.id()).exists() {
            return Err(StoreError::AlreadyExists(story.id()));
        }
        story.touch();
        self.write_story(story)
    }

    fn get(&self, id: StoryId) -> Result<Option<Story>, StoreError> {
        let path = self.story_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_story(path).map(Some)
    }

    fn update(&self, story: &mut Story) -> Result<(), StoreError> {
        if !self.story_path(story.id()).exists() {
            return Err(StoreError::NotFound(story.id()));
        }
        story.touch();
        self.write_story(story)
    }

    fn delete(&self, id: StoryId) -> Result<bool, StoreError> {
        remove_if_exists(&self.story_path(id))
    }

    fn all(&self) -> Result<Vec<Story>, StoreError> {
        let mut stories = Vec::new();

        for entry in fs::read_dir(self.root.join("stories"))? {
            let path = entry?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match Self::read_story(&path) {
                Ok(story) => stories.push(story),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable story record"),
            }
        }

        newest_first(&mut stories);
        Ok(stories)
    }

    fn credential(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .read_setting("credential")?
            .and_then(|raw| non_blank(&raw)))
    }

    fn set_credential(&self, credential: Option<&str>) -> Result<(), StoreError> {
        let cleaned = credential.and_then(non_blank);
        self.write_setting("credential", cleaned.as_deref())
    }

    fn model(&self) -> Result<String, StoreError> {
        Ok(self
            .read_setting("model")?
            .and_then(|raw| non_blank(&raw))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()))
    }

    fn set_model(&self, model: Option<&str>) -> Result<(), StoreError> {
        let cleaned = model.and_then(non_blank);
        self.write_setting("model", cleaned.as_deref())
    }

    fn audio_settings(&self) -> Result<AudioSettings, StoreError> {
        Ok(self
            .read_setting("audio.json")?
            .map(|raw| AudioSettings::from_json_lenient(&raw))
            .unwrap_or_default())
    }

    fn set_audio_settings(&self, settings: &AudioSettings) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(settings)?;
        self.write_setting("audio.json", Some(&content))
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    stories: HashMap<StoryId, Story>,
    credential: Option<String>,
    model: Option<String>,
    audio: Option<AudioSettings>,
}

/// Volatile store for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored stories.
    pub fn len(&self) -> usize {
        self.state().stories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StoryStore for MemoryStore {
    fn create(&self, story: &mut Story) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.stories.contains_key(&story.id()) {
            return Err(StoreError::AlreadyExists(story.id()));
        }
        story.touch();
        state.stories.insert(story.id(), story.clone());
        Ok(())
    }

    fn get(&self, id: StoryId) -> Result<Option<Story>, StoreError> {
        Ok(self.state().stories.get(&id).cloned())
    }

    fn update(&self, story: &mut Story) -> Result<(), StoreError> {
        let mut state = self.state();
        let Some(slot) = state.stories.get_mut(&story.id()) else {
            return Err(StoreError::NotFound(story.id()));
        };
        story.touch();
        *slot = story.clone();
        Ok(())
    }

    fn delete(&self, id: StoryId) -> Result<bool, StoreError> {
        Ok(self.state().stories.remove(&id).is_some())
    }

    fn all(&self) -> Result<Vec<Story>, StoreError> {
        let mut stories: Vec<Story> = self.state().stories.values().cloned().collect();
        newest_first(&mut stories);
        Ok(stories)
    }

    fn credential(&self) -> Result<Option<String>, StoreError> {
        Ok(self.state().credential.clone())
    }

    fn set_credential(&self, credential: Option<&str>) -> Result<(), StoreError> {
        self.state().credential = credential.and_then(non_blank);
        Ok(())
    }

    fn model(&self) -> Result<String, StoreError> {
        Ok(self
            .state()
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()))
    }

    fn set_model(&self, model: Option<&str>) -> Result<(), StoreError> {
        self.state().model = model.and_then(non_blank);
        Ok(())
    }

    fn audio_settings(&self) -> Result<AudioSettings, StoreError> {
        Ok(self.state().audio.clone().unwrap_or_default())
    }

    fn set_audio_settings(&self, settings: &AudioSettings) -> Result<(), StoreError> {
        self.state().audio = Some(settings.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::{Stage, StoryConfig};
    use tempfile::TempDir;

    fn sample(premise: &str) -> Story {
        Story::new(&StoryConfig::new(premise).with_title("Teste"))
    }

    #[test]
    fn test_memory_crud() {
        let store = MemoryStore::new();
        let mut story = sample("premissa");
        store.create(&mut story).unwrap();
        assert!(matches!(
            store.create(&mut story.clone()),
            Err(StoreError::AlreadyExists(_))
        ));

        story.full_text = "texto".to_string();
        let before = story.updated_at;
        store.update(&mut story).unwrap();
        assert!(story.updated_at >= before);

        let loaded = store.get(story.id()).unwrap().unwrap();
        assert_eq!(loaded.full_text, "texto");

        assert!(store.delete(story.id()).unwrap());
        assert!(!store.delete(story.id()).unwrap());
        assert!(store.get(story.id()).unwrap().is_none());
    }

    #[test]
    fn test_memory_update_unknown_fails() {
        let store = MemoryStore::new();
        let mut story = sample("nunca criada");
        assert!(matches!(store.update(&mut story), Err(StoreError::NotFound(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_settings_defaults() {
        let store = MemoryStore::new();
        assert_eq!(store.credential().unwrap(), None);
        assert_eq!(store.model().unwrap(), DEFAULT_MODEL);
        assert_eq!(store.audio_settings().unwrap(), AudioSettings::default());

        store.set_credential(Some("  key  ")).unwrap();
        assert_eq!(store.credential().unwrap().as_deref(), Some("key"));
        store.set_credential(Some("")).unwrap();
        assert_eq!(store.credential().unwrap(), None);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = FileStore::open(dir.path()).unwrap();

        let mut story = sample("farol");
        story.stage = Stage::Middle;
        story.set_pending(["a".into(), "b".into(), "c".into()], 1);
        store.create(&mut story).unwrap();

        let loaded = store.get(story.id()).unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::Middle);
        assert_eq!(loaded.pending().map(|(_, p)| p), Some(1));
        assert_eq!(loaded.config, story.config);

        let summaries = store.list().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].title, "Teste");
        assert_eq!(summaries[0].stage, Stage::Middle);
    }

    #[test]
    fn test_file_store_list_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let mut older = sample("um");
        older.created_at = chrono::Utc::now() - chrono::Duration::hours(1);
        let mut newer = sample("dois");
        store.create(&mut older).unwrap();
        store.create(&mut newer).unwrap();

        let ids: Vec<_> = store.list().unwrap().iter().map(|s| s.story_id).collect();
        assert_eq!(ids, vec![newer.id(), older.id()]);
    }

    #[test]
    fn test_file_store_skips_corrupt_records() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let mut story = sample("bom");
        store.create(&mut story).unwrap();

        let bad_id = StoryId::new();
        fs::write(
            dir.path().join("stories").join(format!("{bad_id}.json")),
            "{ not json",
        )
        .unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
        assert!(matches!(store.get(bad_id), Err(StoreError::InvalidFormat(_))));
    }

    #[test]
    fn test_file_store_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let story = sample("versão");
        let content = serde_json::to_string(&serde_json::json!({
            "version": 99,
            "story": story,
        }))
        .unwrap();
        fs::write(
            dir.path().join("stories").join(format!("{}.json", story.id())),
            content,
        )
        .unwrap();

        match store.get(story.id()) {
            Err(StoreError::VersionMismatch { expected, found }) => {
                assert_eq!(expected, STORE_VERSION);
                assert_eq!(found, 99);
            }
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_file_store_settings_persist() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set_credential(Some("secret")).unwrap();
            store.set_model(Some("gemini-1.5-pro")).unwrap();
            store
                .set_audio_settings(&AudioSettings {
                    rate: 1.25,
                    volume: 0.5,
                    voice_hint: "pt-PT".to_string(),
                })
                .unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.credential().unwrap().as_deref(), Some("secret"));
        assert_eq!(store.model().unwrap(), "gemini-1.5-pro");
        assert_eq!(store.audio_settings().unwrap().voice_hint, "pt-PT");

        store.set_credential(None).unwrap();
        store.set_model(None).unwrap();
        assert_eq!(store.credential().unwrap(), None);
        assert_eq!(store.model().unwrap(), DEFAULT_MODEL);
    }

    #[test]
    fn test_file_store_drops_pending_that_stage_does_not_await() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let mut story = sample("fim de capítulo");
        story.stage = Stage::Concluded;
        story.set_pending(["a".into(), "b".into(), "c".into()], 1);
        let content = serde_json::to_string(&serde_json::json!({
            "version": STORE_VERSION,
            "story": story,
        }))
        .unwrap();
        fs::write(
            dir.path().join("stories").join(format!("{}.json", story.id())),
            content,
        )
        .unwrap();

        let loaded = store.get(story.id()).unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::Concluded);
        assert!(!loaded.is_awaiting_choice());
        assert!(loaded.choices().is_empty());
    }

    #[test]
    fn test_file_store_corrupt_audio_falls_back() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("settings").join("audio.json"), "garbage").unwrap();
        assert_eq!(store.audio_settings().unwrap(), AudioSettings::default());
    }
}
