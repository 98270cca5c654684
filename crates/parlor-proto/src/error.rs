use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("first frame must be `register`, got `{0}`")]
    UnexpectedFirstFrame(&'static str),
    #[error("`{0}` is relay-originated and cannot be sent by a peer")]
    NotClientOriginated(&'static str),
    #[error("binary frames are not part of the signaling protocol")]
    BinaryFrame,
}
