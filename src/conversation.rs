//! Chat templates used to turn preference records into model input text.
//!
//! Each template renders a list of messages by its separator style. An empty
//! trailing assistant message renders the generation prompt, which is what
//! the prompt half of a preference pair looks like.

use serde::{Deserialize, Serialize};

use crate::errors::{EvalError, EvalResult};

/// Speaker of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[serde(alias = "human")]
    User,
    #[serde(alias = "gpt", alias = "bot")]
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparatorStyle {
    AddNewLineSingle,
    ChatMl,
    Llama2,
    AddColonTwo,
    NoColonSingle,
}

/// A named chat template.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub name: &'static str,
    system_template: &'static str,
    system_message: String,
    roles: [&'static str; 2],
    style: SeparatorStyle,
    sep: &'static str,
    sep2: &'static str,
}

/// Names accepted by [`Conversation::from_name`].
pub const TEMPLATE_NAMES: [&str; 6] = ["tulu", "zephyr", "chatml", "llama-2", "vicuna_v1.1", "raw"];

impl Conversation {
    /// Look up a built-in template by name.
    pub fn from_name(name: &str) -> EvalResult<Self> {
        let conv = match name {
            "tulu" => Self {
                name: "tulu",
                system_template: "{system_message}",
                system_message: String::new(),
                roles: ["<|user|>", "<|assistant|>"],
                style: SeparatorStyle::AddNewLineSingle,
                sep: "\n",
                sep2: "",
            },
            "zephyr" => Self {
                name: "zephyr",
                system_template: "<|system|>\n{system_message}",
                system_message: String::new(),
                roles: ["<|user|>", "<|assistant|>"],
                style: SeparatorStyle::ChatMl,
                sep: "</s>",
                sep2: "",
            },
            "chatml" => Self {
                name: "chatml",
                system_template: "<|im_start|>system\n{system_message}",
                system_message: String::new(),
                roles: ["<|im_start|>user", "<|im_start|>assistant"],
                style: SeparatorStyle::ChatMl,
                sep: "<|im_end|>",
                sep2: "",
            },
            "llama-2" => Self {
                name: "llama-2",
                system_template: "[INST] <<SYS>>\n{system_message}\n<</SYS>>\n\n",
                system_message: String::new(),
                roles: ["[INST]", "[/INST]"],
                style: SeparatorStyle::Llama2,
                sep: " ",
                sep2: " </s><s>",
            },
            "vicuna_v1.1" => Self {
                name: "vicuna_v1.1",
                system_template: "{system_message}",
                system_message: "A chat between a curious user and an artificial intelligence assistant. \
                    The assistant gives helpful, detailed, and polite answers to the user's questions."
                    .to_string(),
                roles: ["USER", "ASSISTANT"],
                style: SeparatorStyle::AddColonTwo,
                sep: " ",
                sep2: "</s>",
            },
            "raw" => Self {
                name: "raw",
                system_template: "{system_message}",
                system_message: String::new(),
                roles: ["", ""],
                style: SeparatorStyle::NoColonSingle,
                sep: "",
                sep2: "",
            },
            other => {
                return Err(EvalError::template(format!(
                    "unknown chat template '{other}' (available: {})",
                    TEMPLATE_NAMES.join(", ")
                )))
            }
        };
        Ok(conv)
    }

    pub fn style(&self) -> SeparatorStyle {
        self.style
    }

    pub fn with_system_message(mut self, message: impl Into<String>) -> Self {
        self.system_message = message.into();
        self
    }

    fn system_prompt(&self) -> String {
        self.system_template
            .replace("{system_message}", &self.system_message)
    }

    /// Render `messages` as model input.
    ///
    /// A leading system message replaces the template's default. User and
    /// assistant turns must alternate starting with the user; `None` content
    /// on the final assistant slot renders the generation prompt.
    pub fn render(&self, messages: &[Message], generation_prompt: bool) -> EvalResult<String> {
        let (system, turns) = match messages.split_first() {
            Some((first, rest)) if first.role == Role::System => (Some(first.content.as_str()), rest),
            _ => (None, messages),
        };

        let conv = match system {
            Some(system) => self.clone().with_system_message(system),
            None => self.clone(),
        };

        let mut slots: Vec<(&str, Option<&str>)> = Vec::with_capacity(turns.len() + 1);
        for (i, turn) in turns.iter().enumerate() {
            let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
            if turn.role != expected {
                return Err(EvalError::template(format!(
                    "turn {i} has role {:?}, expected {:?}",
                    turn.role, expected
                )));
            }
            slots.push((conv.roles[i % 2], Some(turn.content.as_str())));
        }
        if generation_prompt {
            if slots.len() % 2 == 0 {
                return Err(EvalError::template(
                    "generation prompt requires the conversation to end with a user turn",
                ));
            }
            slots.push((conv.roles[1], None));
        }

        Ok(conv.render_slots(&slots))
    }

    fn render_slots(&self, slots: &[(&str, Option<&str>)]) -> String {
        let system_prompt = self.system_prompt();
        let mut ret = String::new();
        match self.style {
            SeparatorStyle::AddNewLineSingle => {
                if !system_prompt.is_empty() {
                    ret.push_str(&system_prompt);
                    ret.push_str(self.sep);
                }
                for (role, message) in slots {
                    match message {
                        Some(message) => {
                            ret.push_str(&format!("{role}\n{message}{}", self.sep));
                        }
                        None => ret.push_str(&format!("{role}\n")),
                    }
                }
            }
            SeparatorStyle::ChatMl => {
                if !system_prompt.is_empty() {
                    ret.push_str(&system_prompt);
                    ret.push_str(self.sep);
                    ret.push('\n');
                }
                for (role, message) in slots {
                    match message {
                        Some(message) => {
                            ret.push_str(&format!("{role}\n{message}{}\n", self.sep));
                        }
                        None => ret.push_str(&format!("{role}\n")),
                    }
                }
            }
            SeparatorStyle::Llama2 => {
                let seps = [self.sep, self.sep2];
                if self.system_message.is_empty() {
                    ret.push_str("[INST] ");
                } else {
                    ret.push_str(&system_prompt);
                }
                for (i, (role, message)) in slots.iter().enumerate() {
                    match message {
                        Some(message) if i == 0 => {
                            ret.push_str(message);
                            ret.push(' ');
                        }
                        Some(message) => {
                            ret.push_str(&format!("{role} {message}{}", seps[i % 2]));
                        }
                        None => ret.push_str(role),
                    }
                }
            }
            SeparatorStyle::AddColonTwo => {
                let seps = [self.sep, self.sep2];
                ret.push_str(&system_prompt);
                ret.push_str(seps[0]);
                for (i, (role, message)) in slots.iter().enumerate() {
                    match message {
                        Some(message) => {
                            ret.push_str(&format!("{role}: {message}{}", seps[i % 2]));
                        }
                        None => ret.push_str(&format!("{role}:")),
                    }
                }
            }
            SeparatorStyle::NoColonSingle => {
                ret.push_str(&system_prompt);
                for (role, message) in slots {
                    match message {
                        Some(message) => ret.push_str(&format!("{role}{message}{}", self.sep)),
                        None => ret.push_str(role),
                    }
                }
            }
        }
        ret
    }
}
