//! Pipeline-boundary errors.
//!
//! `Display` is the stable, user-facing message. Internal causes travel as
//! `#[source]` so they can be logged but never reach the caller verbatim.

use crate::types::{ChatRole, ChatType};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Unable to load file. Please try again or contact support for assistance.")]
    MissingFile,

    #[error("Unable to determine the chat thread for this upload. Please start a new chat and try again.")]
    MissingThread,

    #[error("File size is too large. Please upload a file less than {}MB.", .limit / 1_000_000)]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Invalid file type. Currently only DOCX, TXT, MSG, PDF, JPG, and PNG files are supported.")]
    InvalidFileType { mime_type: String },

    #[error("Unable to find any text for processing in this file.")]
    NoExtractableText,

    #[error("Unknown error. Please contact support for assistance.")]
    Extraction {
        #[source]
        cause: anyhow::Error,
    },

    #[error("Unable to index this file. Please try again or contact support for assistance.")]
    Indexing {
        #[source]
        cause: anyhow::Error,
    },
}

impl UploadError {
    /// Rejected before any external call was made.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingFile
                | Self::MissingThread
                | Self::FileTooLarge { .. }
                | Self::InvalidFileType { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Invalid chat request: {0}")]
    InvalidRequest(String),

    #[error("There is no message to respond to.")]
    EmptyConversation,

    #[error("The last message must come from the user, found '{}'.", .role.as_str())]
    LastMessageNotFromUser { role: ChatRole },

    #[error("Chat thread not found.")]
    ThreadNotFound { thread_id: String },

    #[error("Chat type '{}' is not supported.", .0.as_str())]
    UnsupportedChatType(ChatType),

    #[error("Unable to load the conversation. Please try again.")]
    Store {
        #[source]
        cause: anyhow::Error,
    },

    #[error("Unable to search the documents for this chat. Please try again.")]
    Retrieval {
        #[source]
        cause: anyhow::Error,
    },

    #[error("The assistant failed to generate a response. Please try again.")]
    Generation {
        #[source]
        cause: anyhow::Error,
    },
}

impl ChatError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_)
                | Self::EmptyConversation
                | Self::LastMessageNotFromUser { .. }
                | Self::ThreadNotFound { .. }
                | Self::UnsupportedChatType(_)
        )
    }
}
