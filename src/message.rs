use serde::{Deserialize, Serialize};

/// Role in conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A message in the conversation transcript.
///
/// The transcript is sent to the backend verbatim, so the serialized shape
/// matches the wire format exactly. Persisted records may predate optional
/// fields; deserialization tolerates their absence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(
        default,
        rename = "isImage",
        skip_serializing_if = "Option::is_none"
    )]
    pub is_image: Option<bool>,
    /// Set on responses committed by cancellation or a mid-stream error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
}

/// Message content is either a plain string or an ordered list of parts
/// (text and image references). Both shapes occur on the wire and in
/// persisted history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageRef,
        #[serde(
            default,
            rename = "thoughtSignature",
            skip_serializing_if = "Option::is_none"
        )]
        thought_signature: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
}

impl Message {
    pub fn user_text(text: &str) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::Text {
                text: text.to_string(),
            }]),
            is_image: None,
            partial: None,
        }
    }

    pub fn assistant_text(text: &str) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.to_string()),
            is_image: None,
            partial: None,
        }
    }

    pub fn assistant_image(url: &str, thought_signature: Option<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageRef {
                    url: url.to_string(),
                },
                thought_signature,
            }]),
            is_image: Some(true),
            partial: None,
        }
    }

    pub fn is_image(&self) -> bool {
        self.is_image.unwrap_or(false)
    }
}

impl MessageContent {
    /// Concatenated text of the content, ignoring image parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Replace only the text portion, preserving any image parts. A part
    /// list without a text part gains one at the front.
    pub fn set_text(&mut self, new_text: &str) {
        match self {
            MessageContent::Text(_) => {
                *self = MessageContent::Parts(vec![ContentPart::Text {
                    text: new_text.to_string(),
                }]);
            }
            MessageContent::Parts(parts) => {
                let mut replaced = false;
                for part in parts.iter_mut() {
                    if let ContentPart::Text { text } = part {
                        *text = new_text.to_string();
                        replaced = true;
                    }
                }
                if !replaced {
                    parts.insert(0, ContentPart::Text {
                        text: new_text.to_string(),
                    });
                }
            }
        }
    }

    pub fn image_urls(&self) -> Vec<&str> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ImageUrl { image_url, .. } => Some(image_url.url.as_str()),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }
}
