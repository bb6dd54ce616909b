use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::scenario::Persona;

pub const DEFAULT_BEGIN_KEYWORD: &str = "begin";

// Longest persona name, in words, that a mention may span.
const MAX_MENTION_WORDS: usize = 5;

static RE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Command {
    Begin,
    Help,
    Progress,
    Mention { persona_id: String, remainder: String },
    PlainChat(String),
}

impl Command {
    /// Chat turns produce persona replies and count toward the scene's turn limit.
    pub fn is_chat(&self) -> bool {
        matches!(self, Command::Mention { .. } | Command::PlainChat(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Command::Begin => "begin",
            Command::Help => "help",
            Command::Progress => "progress",
            Command::Mention { .. } => "mention",
            Command::PlainChat(_) => "chat",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandInterpreter {
    begin_keyword: String,
}

impl Default for CommandInterpreter {
    fn default() -> Self {
        Self::new(DEFAULT_BEGIN_KEYWORD)
    }
}

impl CommandInterpreter {
    pub fn new(begin_keyword: impl Into<String>) -> Self {
        Self {
            begin_keyword: begin_keyword.into().trim().to_lowercase(),
        }
    }

    pub fn begin_keyword(&self) -> &str {
        &self.begin_keyword
    }

    /// Classifies a raw student message against the active scene's roster.
    ///
    /// Pure: the same text and roster always yield the same command.
    pub fn classify(&self, text: &str, roster: &[&Persona]) -> Command {
        let trimmed = text.trim();
        let lowered = trimmed.to_lowercase();
        let bare = lowered.strip_prefix('/').unwrap_or(&lowered);

        if bare == self.begin_keyword {
            return Command::Begin;
        }
        match bare {
            "help" | "?" => return Command::Help,
            "progress" | "status" => return Command::Progress,
            _ => {}
        }

        if let Some(rest) = trimmed.strip_prefix('@') {
            if let Some((persona_id, remainder)) = resolve_mention(rest, roster) {
                return Command::Mention {
                    persona_id,
                    remainder,
                };
            }
            if let Some(hint) = closest_name(rest, roster) {
                tracing::debug!(mention = %rest, did_you_mean = %hint, "unresolved mention");
            }
        }

        Command::PlainChat(trimmed.to_string())
    }
}

/// Lowercase with whitespace and punctuation removed.
pub fn normalize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Lowercased words of a name or message; punctuation and whitespace only separate.
pub fn name_words(raw: &str) -> Vec<String> {
    RE_WORD
        .find_iter(raw)
        .map(|word| word.as_str().to_lowercase())
        .collect()
}

fn resolve_mention(rest: &str, roster: &[&Persona]) -> Option<(String, String)> {
    let words: Vec<_> = RE_WORD.find_iter(rest).take(MAX_MENTION_WORDS).collect();
    let lowered: Vec<String> = words.iter().map(|word| word.as_str().to_lowercase()).collect();

    // Longest prefix first so "@Dana Whitfield" beats a persona called "Dana". A name
    // matches whole words only, so "@Dan a question" never reaches "Dana".
    for count in (1..=words.len()).rev() {
        if let Some(persona) = match_persona(&lowered[..count], roster) {
            let end = words[count - 1].end();
            let remainder = rest[end..]
                .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, ',' | ':' | ';' | '-'))
                .trim_end()
                .to_string();
            return Some((persona.id.clone(), remainder));
        }
    }
    None
}

fn match_persona<'a>(candidate: &[String], roster: &[&'a Persona]) -> Option<&'a Persona> {
    if let Some(persona) = roster
        .iter()
        .find(|persona| name_words(&persona.name) == candidate || name_words(&persona.id) == candidate)
    {
        return Some(*persona);
    }

    // A first name resolves only when it is unambiguous within the scene.
    let [single] = candidate else {
        return None;
    };
    let mut by_first_name = roster
        .iter()
        .filter(|persona| name_words(&persona.name).first() == Some(single));
    match (by_first_name.next(), by_first_name.next()) {
        (Some(persona), None) => Some(*persona),
        _ => None,
    }
}

fn closest_name(rest: &str, roster: &[&Persona]) -> Option<String> {
    let first = RE_WORD.find(rest)?;
    let want = normalize_name(first.as_str());
    roster
        .iter()
        .map(|persona| {
            let distance = strsim::levenshtein(&want, &normalize_name(&persona.name));
            (persona.name.clone(), distance)
        })
        .min_by_key(|(_, distance)| *distance)
        .filter(|(_, distance)| *distance <= 3)
        .map(|(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Vec<Persona> {
        vec![
            Persona::new("dana", "Dana Whitfield"),
            Persona::new("raj", "Raj Patel"),
            Persona::new("dan", "Dan"),
        ]
    }

    fn classify(text: &str) -> Command {
        let personas = roster();
        let refs: Vec<&Persona> = personas.iter().collect();
        CommandInterpreter::default().classify(text, &refs)
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(classify("  BEGIN "), Command::Begin);
        assert_eq!(classify("/begin"), Command::Begin);
        assert_eq!(classify("Help"), Command::Help);
        assert_eq!(classify("/status"), Command::Progress);
    }

    #[test]
    fn begin_must_be_exact() {
        assert_eq!(
            classify("let's begin now"),
            Command::PlainChat("let's begin now".into())
        );
    }

    #[test]
    fn custom_begin_keyword() {
        let interpreter = CommandInterpreter::new("Start");
        assert_eq!(interpreter.classify("start", &[]), Command::Begin);
        assert_eq!(interpreter.classify("begin", &[]), Command::PlainChat("begin".into()));
    }

    #[test]
    fn mention_resolves_full_name_with_punctuation() {
        assert_eq!(
            classify("@dana-whitfield, what is the budget?"),
            Command::Mention {
                persona_id: "dana".into(),
                remainder: "what is the budget?".into()
            }
        );
        assert_eq!(
            classify("@Dana Whitfield: thoughts?"),
            Command::Mention {
                persona_id: "dana".into(),
                remainder: "thoughts?".into()
            }
        );
    }

    #[test]
    fn longest_name_wins() {
        // "Dan" is also a persona; the two-word match must be preferred.
        assert!(matches!(
            classify("@Dana Whitfield hello"),
            Command::Mention { persona_id, .. } if persona_id == "dana"
        ));
        assert!(matches!(
            classify("@Dan hello"),
            Command::Mention { persona_id, .. } if persona_id == "dan"
        ));
    }

    #[test]
    fn following_words_never_extend_a_name() {
        // "dan" + "a" spells "dana", which is a different persona's id.
        assert_eq!(
            classify("@Dan a question for you"),
            Command::Mention {
                persona_id: "dan".into(),
                remainder: "a question for you".into()
            }
        );
        assert_eq!(
            classify("@Raj Pa tel?"),
            Command::Mention {
                persona_id: "raj".into(),
                remainder: "Pa tel?".into()
            }
        );
    }

    #[test]
    fn unique_first_name_resolves() {
        assert_eq!(
            classify("@raj can we move faster"),
            Command::Mention {
                persona_id: "raj".into(),
                remainder: "can we move faster".into()
            }
        );
    }

    #[test]
    fn unresolved_mention_falls_back_to_plain_chat() {
        assert_eq!(
            classify("@Morgan any news?"),
            Command::PlainChat("@Morgan any news?".into())
        );
    }

    #[test]
    fn only_leading_mention_counts() {
        assert!(matches!(
            classify("@Raj and @Dana please weigh in"),
            Command::Mention { persona_id, remainder } if persona_id == "raj" && remainder == "and @Dana please weigh in"
        ));
    }

    #[test]
    fn only_chat_commands_reach_personas() {
        assert!(classify("@Raj hi").is_chat());
        assert!(classify("hello everyone").is_chat());
        assert!(!classify("begin").is_chat());
        assert!(!classify("help").is_chat());
        assert!(!classify("progress").is_chat());
    }

    #[test]
    fn normalize_strips_case_space_and_punctuation() {
        assert_eq!(normalize_name(" O'Neil-Smith Jr. "), "oneilsmithjr");
    }
}
