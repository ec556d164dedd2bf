//! Headless mode for HistorIA.
//!
//! This module provides a simple text-based interface for reading and
//! steering stories without a graphical front-end. It's designed for
//! scripted sessions and automated testing.

use historia_core::settings::AudioSettings;
use historia_core::{
    Narrator, NarratorError, Page, RepairAction, Stage, Story, StoryConfig, StoryId,
    StoryStore, TextGenerator,
};
use std::io::{self, BufRead, Write};

/// A parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    New(StoryConfig),
    List,
    Open(String),
    Choose(usize),
    Repair,
    Advance,
    Snapshot,
    Pages,
    Page(usize),
    Delete(String),
    License(Option<String>),
    Model(Option<String>),
    Audio(Vec<(String, String)>),
    Status,
    Help,
    Quit,
}

/// Parse one non-empty input line.
///
/// Lines starting with `#` are commands; a bare `1`, `2` or `3` picks
/// a pending option.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if let Ok(number) = line.parse::<usize>() {
        return choice_index(number).map(Command::Choose);
    }

    let Some(body) = line.strip_prefix('#') else {
        return Err("Unknown input. Type #help for help.".to_string());
    };
    let (name, rest) = match body.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (body, ""),
    };

    match name {
        "new" => parse_story_config(rest).map(Command::New),
        "list" => Ok(Command::List),
        "open" => required(rest, "#open <story id>").map(Command::Open),
        "choose" => rest
            .parse::<usize>()
            .map_err(|_| "Usage: #choose <1-3>".to_string())
            .and_then(choice_index)
            .map(Command::Choose),
        "repair" => Ok(Command::Repair),
        "advance" => Ok(Command::Advance),
        "snapshot" => Ok(Command::Snapshot),
        "pages" => Ok(Command::Pages),
        "page" => rest
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .map(|n| Command::Page(n - 1))
            .ok_or_else(|| "Usage: #page <number>".to_string()),
        "delete" => required(rest, "#delete <story id>").map(Command::Delete),
        "license" => Ok(Command::License(optional_value(rest))),
        "model" => Ok(Command::Model(optional_value(rest))),
        "audio" => parse_pairs(rest, ' ').map(Command::Audio),
        "status" => Ok(Command::Status),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        _ => Err("Unknown command. Type #help for help.".to_string()),
    }
}

/// Parse `premise: ... | title: ... | tone: ... | rating: ... | nuclei: ... | first-person: yes`.
///
/// A line without any `key:` is taken as the premise alone.
pub fn parse_story_config(args: &str) -> Result<StoryConfig, String> {
    if args.trim().is_empty() {
        return Err("Usage: #new premise: <text> | title: <text> | ...".to_string());
    }
    if !args.contains(':') {
        return Ok(StoryConfig::new(args.trim()));
    }

    let mut config = StoryConfig::default();
    for (key, value) in parse_pairs(args, '|')? {
        match key.as_str() {
            "premise" | "premissa" => config.premise = value,
            "title" | "titulo" | "título" => config.title = value,
            "nuclei" | "nucleos" | "núcleos" => config.nuclei = value,
            "tone" | "tom" => config.tone = value,
            "rating" | "age" | "classificacao" | "classificação" => config.age_rating = value,
            "first-person" | "pov" => {
                config.first_person = matches!(
                    value.to_lowercase().as_str(),
                    "yes" | "sim" | "true" | "1" | "first" | "primeira"
                )
            }
            other => return Err(format!("Unknown story field '{other}'")),
        }
    }
    Ok(config)
}

fn parse_pairs(args: &str, separator: char) -> Result<Vec<(String, String)>, String> {
    let key_separator = if separator == '|' { ':' } else { '=' };
    args.split(separator)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.split_once(key_separator)
                .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
                .ok_or_else(|| format!("Expected key{key_separator}value, got '{part}'"))
        })
        .collect()
}

fn choice_index(number: usize) -> Result<usize, String> {
    if (1..=3).contains(&number) {
        Ok(number - 1)
    } else {
        Err("Choose 1, 2 or 3.".to_string())
    }
}

fn required(rest: &str, usage: &str) -> Result<String, String> {
    if rest.is_empty() {
        Err(format!("Usage: {usage}"))
    } else {
        Ok(rest.to_string())
    }
}

fn optional_value(rest: &str) -> Option<String> {
    match rest {
        "" | "clear" | "default" => None,
        value => Some(value.to_string()),
    }
}

/// Apply `key=value` pairs on top of the current audio settings.
pub fn apply_audio(
    mut audio: AudioSettings,
    pairs: &[(String, String)],
) -> Result<AudioSettings, String> {
    for (key, value) in pairs {
        match key.as_str() {
            "rate" => audio.rate = parse_unit(value, 0.5, 2.0)?,
            "volume" => audio.volume = parse_unit(value, 0.0, 1.0)?,
            "voice" => audio.voice_hint = value.clone(),
            other => return Err(format!("Unknown audio setting '{other}'")),
        }
    }
    Ok(audio)
}

fn parse_unit(value: &str, min: f32, max: f32) -> Result<f32, String> {
    value
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(min, max))
        .ok_or_else(|| format!("'{value}' is not a number"))
}

/// Run HistorIA in headless mode.
///
/// This provides a simple line-oriented protocol:
/// - Lines starting with `#` are commands (new, open, choose, repair, ...)
/// - A bare `1`, `2` or `3` picks a pending option
/// - All other output is story text or state
pub async fn run_headless<S, G>(narrator: Narrator<S, G>) -> Result<(), NarratorError>
where
    S: StoryStore,
    G: TextGenerator,
{
    let mut session = Session {
        narrator,
        current: None,
    };

    println!("=== HistorIA Headless Mode ===");
    session.print_list()?;
    println!();
    print_help();
    println!();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let command = match parse_command(line) {
            Ok(command) => command,
            Err(message) => {
                println!("[ERROR] {message}");
                stdout.flush().ok();
                continue;
            }
        };

        if command == Command::Quit {
            println!("Até logo!");
            break;
        }

        if let Err(e) = session.execute(command).await {
            println!("[ERROR] {e}");
            if e.is_retryable() {
                println!("[HINT] Type #repair to try again.");
            }
        }
        stdout.flush().ok();
    }

    Ok(())
}

/// Front-end state: only which story is selected.
struct Session<S, G> {
    narrator: Narrator<S, G>,
    current: Option<StoryId>,
}

impl<S: StoryStore, G: TextGenerator> Session<S, G> {
    async fn execute(&mut self, command: Command) -> Result<(), NarratorError> {
        match command {
            Command::New(config) => {
                let story = self.narrator.create_story(&config)?;
                self.current = Some(story.id());
                println!("[CREATED] {} ({})", story.title(), story.id());
                // A duplicate may already be under way.
                let story = if story.is_active() && story.stage == Stage::Start {
                    self.generating(self.narrator.open_chapter(story.id()))
                        .await?
                } else {
                    story
                };
                print_story(&story);
            }
            Command::List => self.print_list()?,
            Command::Open(raw) => {
                let id = self.resolve(&raw)?;
                let story = self.narrator.get_story(id)?;
                self.current = Some(id);
                print_story(&story);
            }
            Command::Choose(index) => {
                let id = self.selected()?;
                let story = self
                    .generating(self.narrator.choose_option(id, index))
                    .await?;
                print_story(&story);
            }
            Command::Repair => {
                let id = self.selected()?;
                let (story, action) = self.generating(self.narrator.repair(id)).await?;
                if action == RepairAction::Nothing {
                    println!("[REPAIR] Nothing to repair.");
                } else {
                    println!("[REPAIR] {action:?}");
                }
                print_story(&story);
            }
            Command::Advance => {
                let id = self.selected()?;
                let story = self.generating(self.narrator.advance_chapter(id)).await?;
                print_story(&story);
            }
            Command::Snapshot => {
                let id = self.selected()?;
                match self.narrator.snapshot(id)? {
                    Some(page) => println!("[PAGE] Archived {}", page.label),
                    None => println!("[PAGE] Nothing new to archive."),
                }
            }
            Command::Pages => {
                let story = self.narrator.get_story(self.selected()?)?;
                println!("[PAGES]");
                for (n, page) in story.pages().iter().enumerate() {
                    println!("  {}. {} ({})", n + 1, page.label, page.at.format("%Y-%m-%d %H:%M"));
                }
            }
            Command::Page(n) => {
                let story = self.narrator.get_story(self.selected()?)?;
                match story.pages().get(n) {
                    Some(page) => {
                        let page = self.narrator.page(story.id(), page.id)?;
                        print_page(&page);
                    }
                    None => println!("[ERROR] No page {}.", n + 1),
                }
            }
            Command::Delete(raw) => {
                let id = self.resolve(&raw)?;
                if self.narrator.delete_story(id)? {
                    println!("[DELETED] {id}");
                    if self.current == Some(id) {
                        self.current = None;
                    }
                } else {
                    println!("[ERROR] No story {id}.");
                }
            }
            Command::License(key) => {
                self.narrator.store().set_credential(key.as_deref())?;
                match key {
                    Some(_) => println!("[LICENSE] Saved."),
                    None => println!("[LICENSE] Cleared."),
                }
            }
            Command::Model(model) => {
                let store = self.narrator.store();
                store.set_model(model.as_deref())?;
                println!("[MODEL] {}", store.model()?);
            }
            Command::Audio(pairs) => {
                let store = self.narrator.store();
                match apply_audio(store.audio_settings()?, &pairs) {
                    Ok(audio) => {
                        if !pairs.is_empty() {
                            store.set_audio_settings(&audio)?;
                        }
                        println!(
                            "[AUDIO] rate {:.2}, volume {:.2}, voice {}",
                            audio.rate, audio.volume, audio.voice_hint
                        );
                    }
                    Err(message) => println!("[ERROR] {message}"),
                }
            }
            Command::Status => self.print_status()?,
            Command::Help => print_help(),
            Command::Quit => {}
        }
        Ok(())
    }

    /// Show a progress marker while a generation runs.
    async fn generating<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, NarratorError>>,
    ) -> Result<T, NarratorError> {
        print!("[GENERATING]");
        io::stdout().flush().ok();
        let result = call.await;
        print!("\r            \r");
        io::stdout().flush().ok();
        result
    }

    fn selected(&self) -> Result<StoryId, NarratorError> {
        self.current.ok_or_else(|| {
            NarratorError::Validation("no story selected; use #open <id> or #new".to_string())
        })
    }

    /// Accept a full id, or a unique prefix of one.
    fn resolve(&self, raw: &str) -> Result<StoryId, NarratorError> {
        if let Ok(id) = raw.parse::<StoryId>() {
            return Ok(id);
        }
        let matches: Vec<StoryId> = self
            .narrator
            .list_stories()?
            .into_iter()
            .map(|s| s.story_id)
            .filter(|id| id.to_string().starts_with(raw))
            .collect();
        match matches.as_slice() {
            [id] => Ok(*id),
            [] => Err(NarratorError::Validation(format!("no story matches '{raw}'"))),
            _ => Err(NarratorError::Validation(format!("'{raw}' is ambiguous"))),
        }
    }

    fn print_list(&self) -> Result<(), NarratorError> {
        let stories = self.narrator.list_stories()?;
        if stories.is_empty() {
            println!("[STORIES] None yet. Start one with #new <premise>.");
            return Ok(());
        }
        println!("[STORIES]");
        for summary in stories {
            println!(
                "  {}  {} - chapter {} at {}, {}",
                summary.story_id,
                summary.title,
                summary.chapter,
                summary.stage,
                summary.status.name()
            );
        }
        Ok(())
    }

    fn print_status(&self) -> Result<(), NarratorError> {
        let store = self.narrator.store();
        println!("[STATUS]");
        println!(
            "  License: {}",
            if store.credential()?.is_some() { "configured" } else { "missing" }
        );
        println!("  Model: {}", store.model()?);
        match self.current {
            Some(id) => {
                let story = self.narrator.get_story(id)?;
                println!("  Story: {} ({})", story.title(), id);
                println!("  Chapter: {} at {}", story.chapter, story.stage);
                println!("  Status: {}", story.status.name());
                println!("  Choices made: {}", story.choices().len());
                println!("  Pages: {}", story.pages().len());
            }
            None => println!("  Story: none selected"),
        }
        Ok(())
    }
}

fn print_story(story: &Story) {
    println!("[STORY] {} · {}", story.title(), story.page_label());
    for para in story.full_text.split("\n\n") {
        println!("{para}");
    }
    println!();

    if let Some((options, pause)) = story.pending() {
        println!("[CHOICES] Pause {pause}:");
        for (n, option) in options.iter().enumerate() {
            println!("  {}) {option}", n + 1);
        }
    } else if !story.is_active() {
        println!("[END] Story {}.", story.status.name());
    } else if story.can_advance_chapter() {
        println!("[CHAPTER] Concluded. Type #advance to continue.");
    } else {
        println!("[HINT] No options pending. Type #repair to resume.");
    }
}

fn print_page(page: &Page) {
    println!("[PAGE] {}", page.label);
    for para in page.text.split("\n\n") {
        println!("{para}");
    }
    println!();
}

fn print_help() {
    println!("[HELP]");
    println!("  #new <premise>           - Create a story (or: premise: .. | title: .. | tone: ..");
    println!("                             | rating: .. | nuclei: .. | first-person: yes)");
    println!("  #list                    - List stories");
    println!("  #open <id>               - Select a story (id prefix is enough)");
    println!("  #choose <n> / <n>        - Pick option 1, 2 or 3");
    println!("  #repair                  - Resume an interrupted generation");
    println!("  #advance                 - Start the next chapter");
    println!("  #snapshot                - Archive the current text as a page");
    println!("  #pages / #page <n>       - List or read archived pages");
    println!("  #delete <id>             - Delete a story");
    println!("  #license <key|clear>     - Set the Gemini API key");
    println!("  #model <id|default>      - Set the Gemini model");
    println!("  #audio rate=1 volume=1 voice=pt-BR - Read-aloud preferences");
    println!("  #status                  - Show settings and the selected story");
    println!("  #quit                    - Exit");
}

#[cfg(test)]
mod tests {
    use super::*;
    use historia_core::testing::TestHarness;

    #[test]
    fn test_parse_bare_number_is_choice() {
        assert_eq!(parse_command("2"), Ok(Command::Choose(1)));
        assert_eq!(parse_command("#choose 3"), Ok(Command::Choose(2)));
        assert!(parse_command("4").is_err());
        assert!(parse_command("#choose x").is_err());
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_command("#list"), Ok(Command::List));
        assert_eq!(parse_command("#exit"), Ok(Command::Quit));
        assert_eq!(parse_command("#page 1"), Ok(Command::Page(0)));
        assert!(parse_command("#page 0").is_err());
        assert_eq!(parse_command("#license clear"), Ok(Command::License(None)));
        assert_eq!(
            parse_command("#model gemini-1.5-pro"),
            Ok(Command::Model(Some("gemini-1.5-pro".to_string())))
        );
        assert!(parse_command("hello").is_err());
        assert!(parse_command("#open").is_err());
    }

    #[test]
    fn test_parse_story_config_fields() {
        let config = parse_story_config(
            "premise: Um trem que nunca para | title: Expresso | tone: Suspense | first-person: sim",
        )
        .unwrap();
        assert_eq!(config.premise, "Um trem que nunca para");
        assert_eq!(config.title, "Expresso");
        assert_eq!(config.tone, "Suspense");
        assert!(config.first_person);

        let bare = parse_story_config("Um trem que nunca para").unwrap();
        assert_eq!(bare.premise, "Um trem que nunca para");
        assert!(!bare.first_person);

        assert!(parse_story_config("color: azul").is_err());
        assert!(parse_story_config("").is_err());
    }

    #[test]
    fn test_apply_audio_pairs() {
        let pairs = vec![
            ("rate".to_string(), "3".to_string()),
            ("voice".to_string(), "en-US".to_string()),
        ];
        let audio = apply_audio(AudioSettings::default(), &pairs).unwrap();
        assert_eq!(audio.rate, 2.0);
        assert_eq!(audio.volume, 1.0);
        assert_eq!(audio.voice_hint, "en-US");

        let bad = vec![("volume".to_string(), "loud".to_string())];
        assert!(apply_audio(AudioSettings::default(), &bad).is_err());
    }

    #[tokio::test]
    async fn test_session_new_and_choose() {
        let mut harness = TestHarness::new();
        harness
            .expect_segment("Era uma vez.", ["a", "b", "c"])
            .expect_segment("Depois.", ["d", "e", "f"]);

        let mut session = Session {
            narrator: harness.narrator,
            current: None,
        };
        session
            .execute(Command::New(StoryConfig::new("premissa")))
            .await
            .unwrap();
        let id = session.current.unwrap();

        session.execute(Command::Choose(0)).await.unwrap();
        let story = session.narrator.get_story(id).unwrap();
        assert_eq!(story.choices().len(), 1);
        assert_eq!(story.pending_choices().unwrap()[0], "d");
    }

    #[tokio::test]
    async fn test_session_requires_selection() {
        let harness = TestHarness::new();
        let mut session = Session {
            narrator: harness.narrator,
            current: None,
        };
        let err = session.execute(Command::Repair).await.unwrap_err();
        assert!(matches!(err, NarratorError::Validation(_)));
    }
}
