use serde::{Deserialize, Serialize};

use crate::message::Role;

/// Presentation facts a rendering surface needs to draw the chatbot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Persona {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_heading")]
    pub heading: String,
    #[serde(default = "default_input_placeholder")]
    pub input_placeholder: String,
    #[serde(default = "default_assistant_avatar")]
    pub assistant_avatar: String,
    #[serde(default = "default_user_avatar")]
    pub user_avatar: String,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            title: default_title(),
            heading: default_heading(),
            input_placeholder: default_input_placeholder(),
            assistant_avatar: default_assistant_avatar(),
            user_avatar: default_user_avatar(),
        }
    }
}

fn default_title() -> String {
    "OnoBot".into()
}

fn default_heading() -> String {
    "Ono Bot".into()
}

fn default_input_placeholder() -> String {
    "メッセージを送信する:".into()
}

fn default_assistant_avatar() -> String {
    "imgs/assistant.png".into()
}

fn default_user_avatar() -> String {
    "imgs/user.png".into()
}

impl Persona {
    pub fn page_title(&self) -> String {
        format!("{} - An Intelligent Assistant", self.title)
    }

    /// Avatar image path for a role. System messages are never displayed.
    pub fn avatar_for(&self, role: Role) -> Option<&str> {
        match role {
            Role::Assistant => Some(&self.assistant_avatar),
            Role::User => Some(&self.user_avatar),
            Role::System => None,
        }
    }
}
