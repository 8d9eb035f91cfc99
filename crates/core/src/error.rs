use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid channel id: {0}")]
    InvalidChannelId(String),

    #[error("Invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("Codec error: {0}")]
    Codec(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
