use std::path::Path;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

/// A file folded into the next user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Text { name: String, text: String },
    Image { name: String, url: String },
    Binary { name: String },
}

impl Attachment {
    pub fn name(&self) -> &str {
        match self {
            Self::Text { name, .. } | Self::Image { name, .. } | Self::Binary { name } => name,
        }
    }

    /// Load a file: images by extension become links, valid UTF-8 is
    /// inlined, anything else is only mentioned by name.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if is_image {
            let abs = std::fs::canonicalize(path)?;
            return Ok(Self::Image {
                name,
                url: format!("file://{}", abs.display()),
            });
        }

        let bytes = std::fs::read(path)?;
        Ok(match String::from_utf8(bytes) {
            Ok(text) => Self::Text { name, text },
            Err(_) => Self::Binary { name },
        })
    }

    fn render(&self) -> String {
        match self {
            Self::Text { name, text } if !text.is_empty() => {
                format!("\n\n**File: {name}**\n```\n{text}\n```\n")
            }
            Self::Image { name, url } if !url.is_empty() => format!("\n\n![{name}]({url})\n"),
            other => format!("\n\n(Attached file: {})\n", other.name()),
        }
    }
}

// Prompt text followed by each attachment's rendering, in order
pub fn build_user_content(prompt: &str, attachments: &[Attachment]) -> String {
    let mut content = prompt.to_string();
    for attachment in attachments {
        content.push_str(&attachment.render());
    }
    content
}
