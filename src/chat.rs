// Pet chat: prompt construction, the Ollama client and canned fallbacks.

use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::{Database, Memory, Pet};
use crate::metrics;
use crate::pet::{require_pet, MemoryKind, Mood, PetError};

pub const MESSAGE_MAX_CHARS: usize = 500;
/// Memories included in each prompt, most recent first.
pub const PROMPT_MEMORIES: i64 = 5;

/// Errors from the LLM endpoint. Never surfaced to API callers.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("LLM endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("LLM request timed out after {0}ms")]
    Timeout(u128),

    #[error("LLM returned HTTP {0}")]
    Status(u16),

    #[error("Failed to parse LLM response: {0}")]
    Parse(String),

    #[error("LLM returned an empty reply")]
    Empty,
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ChatError::Parse(err.to_string())
        } else {
            ChatError::Unavailable(err.to_string())
        }
    }
}

/// Where a reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplySource {
    Llm,
    Fallback,
}

impl ReplySource {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplySource::Llm => "llm",
            ReplySource::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TalkReply {
    pub reply: String,
    pub source: ReplySource,
    pub mood: Mood,
    pub pet_id: i64,
}

/// Client for Ollama's `/api/generate` endpoint.
pub struct ChatClient {
    endpoint: Option<String>,
    model: String,
    timeout: Duration,
    http: Client,
}

impl ChatClient {
    pub fn new(endpoint: Option<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint,
            model: model.into(),
            timeout,
            http: Client::new(),
        }
    }

    /// A client with no endpoint: every call falls back.
    pub fn disabled() -> Self {
        Self::new(None, "", Duration::from_secs(1))
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    pub async fn generate(&self, prompt: &str) -> Result<String, ChatError> {
        let Some(base_url) = &self.endpoint else {
            return Err(ChatError::Unavailable("no LLM endpoint configured".into()));
        };

        let url = format!("{}/api/generate", base_url);
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": 0.8,
                "num_predict": 120,
            }
        });

        let start = Instant::now();
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChatError::Timeout(self.timeout.as_millis())
                } else {
                    ChatError::from(e)
                }
            })?;

        if !resp.status().is_success() {
            return Err(ChatError::Status(resp.status().as_u16()));
        }

        let json: serde_json::Value = resp.json().await?;
        let text = json["response"]
            .as_str()
            .ok_or_else(|| ChatError::Parse("missing 'response' field".into()))?
            .trim()
            .to_string();

        debug!(
            latency_ms = start.elapsed().as_millis() as u64,
            model = %self.model,
            "LLM reply received"
        );

        if text.is_empty() {
            return Err(ChatError::Empty);
        }
        Ok(text)
    }
}

/// Build the prompt from pet state, recent memories (most recent first) and the message.
pub fn build_prompt(pet: &Pet, memories: &[Memory], message: &str) -> String {
    let mut prompt = format!(
        "You are {name}, a small virtual pet (generation {generation}). Reply in one or two short, \
         playful sentences and stay in character.\n\
         Current state: hunger {hunger}/100, happiness {happiness}/100, energy {energy}/100, \
         hygiene {hygiene}/100, health {health}/100. You feel {mood}.\n",
        name = pet.name,
        generation = pet.generation,
        hunger = pet.stats.hunger,
        happiness = pet.stats.happiness,
        energy = pet.stats.energy,
        hygiene = pet.stats.hygiene,
        health = pet.stats.health,
        mood = pet.mood,
    );

    if !memories.is_empty() {
        prompt.push_str("Things that happened recently (newest first):\n");
        for memory in memories {
            prompt.push_str("- ");
            prompt.push_str(&memory.content);
            prompt.push('\n');
        }
    }

    prompt.push_str("\nYour caretaker says: ");
    prompt.push_str(message);
    prompt.push_str(&format!("\n{}:", pet.name));
    prompt
}

fn canned_replies(mood: Mood) -> &'static [&'static str] {
    match mood {
        Mood::Dead => &["..."],
        Mood::Sick => &[
            "I don't feel so good... can you take care of me?",
            "*sniffles* I need some rest and love.",
        ],
        Mood::Hungry => &[
            "My tummy is rumbling! Is it snack time?",
            "Food, please! I'm sooo hungry.",
        ],
        Mood::Tired => &[
            "*yawns* I could really use a nap...",
            "So sleepy... can we talk after a snooze?",
        ],
        Mood::Dirty => &[
            "I'm a little stinky. Bath time?",
            "I rolled in something. Help!",
        ],
        Mood::Sad => &[
            "I'm feeling a bit lonely. Want to play?",
            "Could we play a game? It would cheer me up.",
        ],
        Mood::Happy => &[
            "Hi hi! I'm so happy you're here!",
            "Yay, you came to talk to me!",
            "Everything is great today!",
        ],
    }
}

/// Canned reply for when the LLM is unavailable.
pub fn fallback_reply(mood: Mood) -> String {
    let replies = canned_replies(mood);
    replies
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("...")
        .to_string()
}

pub fn validate_message(raw: &str) -> Result<String, PetError> {
    let message = raw.trim();
    let len = message.chars().count();
    if len == 0 || len > MESSAGE_MAX_CHARS {
        return Err(PetError::Validation(format!(
            "message must be 1-{MESSAGE_MAX_CHARS} characters"
        )));
    }
    Ok(message.to_string())
}

/// Talk to a pet. LLM failures are recovered with a canned reply.
pub async fn talk(
    db: &Database,
    chat: &ChatClient,
    pet_id: i64,
    raw_message: &str,
) -> Result<TalkReply, PetError> {
    let message = validate_message(raw_message)?;
    let pet = require_pet(db, pet_id).await?;

    let (reply, source) = if !pet.alive {
        (fallback_reply(Mood::Dead), ReplySource::Fallback)
    } else {
        let memories = db.recent_memories(pet_id, PROMPT_MEMORIES).await?;
        let prompt = build_prompt(&pet, &memories, &message);
        match chat.generate(&prompt).await {
            Ok(text) => (text, ReplySource::Llm),
            Err(e) => {
                if chat.is_enabled() {
                    warn!(pet_id, "Chat falling back to canned reply: {e}");
                }
                (fallback_reply(pet.mood), ReplySource::Fallback)
            }
        }
    };

    db.add_memory(
        pet_id,
        MemoryKind::Chat,
        &format!("Caretaker said \"{message}\" and {} replied \"{reply}\".", pet.name),
    )
    .await?;
    metrics::TALK_REPLIES_TOTAL
        .with_label_values(&[source.as_str()])
        .inc();

    Ok(TalkReply {
        reply,
        source,
        mood: pet.mood,
        pet_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pet::Stats;

    fn sample_pet(stats: Stats) -> Pet {
        Pet {
            id: 1,
            user_id: 1,
            name: "Mochi".into(),
            stats,
            alive: true,
            generation: 2,
            mood: Mood::from_stats(&stats, true),
            world_code: None,
            world_open: false,
            visits: 0,
            last_fed_at: None,
            last_played_at: None,
            last_cleaned_at: None,
            last_slept_at: None,
            created_at: "2026-01-01T00:00:00.000Z".into(),
            updated_at: "2026-01-01T00:00:00.000Z".into(),
        }
    }

    fn memory(id: i64, content: &str) -> Memory {
        Memory {
            id,
            pet_id: 1,
            kind: "action".into(),
            content: content.into(),
            created_at: "2026-01-01T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn test_prompt_includes_state_and_memories() {
        let pet = sample_pet(Stats {
            hunger: 12,
            ..Stats::FRESH
        });
        let memories = vec![memory(2, "Mochi took a long, cosy nap."), memory(1, "Mochi was fed.")];
        let prompt = build_prompt(&pet, &memories, "How are you?");

        assert!(prompt.contains("You are Mochi"));
        assert!(prompt.contains("generation 2"));
        assert!(prompt.contains("hunger 12/100"));
        assert!(prompt.contains("You feel hungry"));
        let nap = prompt.find("cosy nap").unwrap();
        let fed = prompt.find("was fed").unwrap();
        assert!(nap < fed, "memories keep most-recent-first order");
        assert!(prompt.trim_end().ends_with("Mochi:"));
        assert!(prompt.contains("Your caretaker says: How are you?"));
    }

    #[test]
    fn test_prompt_without_memories() {
        let prompt = build_prompt(&sample_pet(Stats::FRESH), &[], "hi");
        assert!(!prompt.contains("happened recently"));
    }

    #[test]
    fn test_fallback_matches_mood() {
        for mood in [Mood::Happy, Mood::Hungry, Mood::Tired, Mood::Dead] {
            let reply = fallback_reply(mood);
            assert!(canned_replies(mood).contains(&reply.as_str()));
        }
    }

    #[test]
    fn test_validate_message() {
        assert_eq!(validate_message("  hello ").unwrap(), "hello");
        assert!(validate_message("").is_err());
        assert!(validate_message(&"a".repeat(MESSAGE_MAX_CHARS + 1)).is_err());
        assert!(validate_message(&"a".repeat(MESSAGE_MAX_CHARS)).is_ok());
    }

    #[tokio::test]
    async fn test_disabled_client_is_unavailable() {
        let client = ChatClient::disabled();
        assert!(!client.is_enabled());
        assert!(matches!(
            client.generate("hello").await,
            Err(ChatError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_errors() {
        // Port 9 (discard) is not listening on test machines
        let client = ChatClient::new(
            Some("http://127.0.0.1:9".into()),
            "llama3.2",
            Duration::from_millis(500),
        );
        assert!(client.generate("hello").await.is_err());
    }
}
