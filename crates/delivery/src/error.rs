use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Session(#[from] embergram_session::Error),

    #[error(transparent)]
    Contacts(#[from] embergram_contacts::Error),

    #[error("remote file fetch failed: {0}")]
    Fetch(#[source] anyhow::Error),

    #[error("{0}")]
    Message(String),
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl embergram_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

embergram_common::impl_context!();
