use std::convert::Infallible;

use serde::Serialize;
use thiserror::Error;
use warp::http::StatusCode;
use warp::{Rejection, Reply};

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("{0}")]
    Invalid(String),
    #[error("Missing topic")]
    MissingTopic,
    #[error("username {0} is already taken")]
    UsernameTaken(String),
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("file too big")]
    FileTooBig,
    #[error("invalid upload")]
    InvalidUpload,
    #[error("only GIFs allowed")]
    NotGif,
    #[error("storage lock poisoned")]
    StorePoisoned,
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("peer link error: {0}")]
    Relay(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Invalid(_)
            | ChatError::MissingTopic
            | ChatError::InvalidUpload
            | ChatError::NotGif
            | ChatError::Json(_) => StatusCode::BAD_REQUEST,
            ChatError::UsernameTaken(_) => StatusCode::CONFLICT,
            ChatError::UnknownUser(_) => StatusCode::UNAUTHORIZED,
            ChatError::FileTooBig => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl warp::reject::Reject for ChatError {}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Turns rejections into `{"error": ...}` bodies with a matching status.
pub async fn recover(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(err) = rejection.find::<ChatError>() {
        if err.status().is_server_error() {
            log::error!("request failed: {err}");
        }
        (err.status(), err.to_string())
    } else if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(err) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid JSON: {err}"))
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, ChatError::FileTooBig.to_string())
    } else if rejection.find::<warp::reject::InvalidQuery>().is_some() {
        (StatusCode::BAD_REQUEST, "invalid query".to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        log::warn!("unhandled rejection: {rejection:?}");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorBody { error: message }),
        status,
    ))
}

#[cfg(test)]
mod tests {
    use warp::Filter;

    use super::*;

    #[tokio::test]
    async fn chat_errors_recover_as_json() {
        let taken = warp::path!("taken")
            .and_then(|| async {
                Err::<String, Rejection>(ChatError::UsernameTaken("bob".to_string()).into())
            })
            .recover(recover);

        let res = warp::test::request().path("/taken").reply(&taken).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["error"], "username bob is already taken");

        let missing = warp::test::request().path("/nowhere").reply(&taken).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
