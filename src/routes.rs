use std::convert::Infallible;
use std::path::PathBuf;

use futures_util::StreamExt;
use serde::Deserialize;
use warp::http::{StatusCode, Uri};
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

use crate::accounts::{self, Credentials};
use crate::error::{self, ChatError};
use crate::files::UPLOADS_ROUTE;
use crate::messages::Message;
use crate::server::Server;
use crate::store::MessageFilter;

const JSON_BODY_LIMIT: u64 = 64 * 1024;
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

#[derive(Debug, Default, Deserialize)]
struct UserQuery {
    username: Option<String>,
}

impl UserQuery {
    fn username_or<'a>(&'a self, node: &'a str) -> &'a str {
        self.username
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(node)
    }
}

#[derive(Debug, Default, Deserialize)]
struct TopicQuery {
    topic: Option<String>,
    username: Option<String>,
}

/// Who to announce an upload as, if anyone.
#[derive(Debug, Default, Deserialize)]
struct UploadQuery {
    username: Option<String>,
    topic: Option<String>,
    recipient: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesQuery {
    topic: Option<String>,
    since: Option<i64>,
    limit: Option<usize>,
}

fn with_server(server: Server) -> impl Filter<Extract = (Server,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

/// The node's whole HTTP surface.
pub fn routes(
    server: Server,
    static_dir: PathBuf,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let upload_limit = server.file_manager.max_size() + MULTIPART_OVERHEAD;
    let uploads_dir = server.file_manager.storage_path().to_path_buf();

    let login = warp::path!("login")
        .and(warp::post())
        .and(warp::body::content_length_limit(JSON_BODY_LIMIT))
        .and(warp::body::json())
        .and(with_server(server.clone()))
        .and_then(login);

    let register = warp::path!("register")
        .and(warp::post())
        .and(warp::body::content_length_limit(JSON_BODY_LIMIT))
        .and(warp::body::json())
        .and(with_server(server.clone()))
        .and_then(register);

    let list_messages = warp::path!("messages")
        .and(warp::get())
        .and(warp::query::<MessagesQuery>())
        .and(with_server(server.clone()))
        .and_then(list_messages);

    let post_message = warp::path!("messages")
        .and(warp::post())
        .and(warp::body::content_length_limit(JSON_BODY_LIMIT))
        .and(warp::body::bytes())
        .and(with_server(server.clone()))
        .and_then(post_message);

    let subscriptions = warp::path!("subscriptions")
        .and(warp::get())
        .and(warp::query::<UserQuery>())
        .and(with_server(server.clone()))
        .and_then(subscriptions);

    let subscribe = warp::path!("subscribe")
        .and(warp::get())
        .and(warp::query::<TopicQuery>())
        .and(with_server(server.clone()))
        .and_then(subscribe);

    let unsubscribe = warp::path!("unsubscribe")
        .and(warp::get())
        .and(warp::query::<TopicQuery>())
        .and(with_server(server.clone()))
        .and_then(unsubscribe);

    let upload = warp::path!("upload")
        .and(warp::post())
        .and(warp::query::<UploadQuery>())
        .and(warp::body::content_length_limit(upload_limit))
        .and(warp::multipart::form().max_length(upload_limit))
        .and(with_server(server.clone()))
        .and_then(upload);

    let uploads = warp::path(UPLOADS_ROUTE).and(warp::fs::dir(uploads_dir));

    let ws = warp::path!("ws")
        .and(warp::ws())
        .and(warp::query::<UserQuery>())
        .and(with_server(server.clone()))
        .and_then(upgrade);

    let events = warp::path!("events" / String)
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(events);

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(health);

    let index = warp::path::end()
        .and(warp::get())
        .and(warp::query::<UserQuery>())
        .and(with_server(server))
        .and_then(index);

    let static_files = warp::fs::dir(static_dir);

    login
        .or(register)
        .or(list_messages)
        .or(post_message)
        .or(subscriptions)
        .or(subscribe)
        .or(unsubscribe)
        .or(upload)
        .or(uploads)
        .or(ws)
        .or(events)
        .or(health)
        .or(index)
        .or(static_files)
        .recover(error::recover)
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET", "POST"])
                .allow_header("content-type"),
        )
        .with(warp::log("nodechat::http"))
}

async fn login(request: Credentials, server: Server) -> Result<impl Reply, Rejection> {
    let user = accounts::login(server.store(), &request)?;
    Ok(warp::reply::json(&user))
}

async fn register(request: Credentials, server: Server) -> Result<impl Reply, Rejection> {
    let user = accounts::register(server.store(), &request)?;
    Ok(warp::reply::with_status(
        warp::reply::json(&user),
        StatusCode::CREATED,
    ))
}

async fn list_messages(query: MessagesQuery, server: Server) -> Result<impl Reply, Rejection> {
    let filter = MessageFilter {
        topic: query.topic.filter(|topic| !topic.trim().is_empty()),
        since: query.since,
        limit: query.limit,
    };
    let messages = server.store().messages(&filter)?;
    Ok(warp::reply::json(&messages))
}

async fn post_message(
    body: warp::hyper::body::Bytes,
    server: Server,
) -> Result<impl Reply, Rejection> {
    let message: Message = serde_json::from_slice(&body).map_err(ChatError::Json)?;
    server.publish(message).await?;
    Ok(warp::reply::with_status("Message received", StatusCode::CREATED))
}

async fn subscriptions(query: UserQuery, server: Server) -> Result<impl Reply, Rejection> {
    let topics = server
        .store()
        .subscriptions(query.username_or(server.node_name()))?;
    Ok(warp::reply::json(&topics))
}

fn topic_request(query: &TopicQuery, node: &str) -> Result<(String, String), ChatError> {
    let topic = query
        .topic
        .as_deref()
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .ok_or(ChatError::MissingTopic)?;
    let username = UserQuery {
        username: query.username.clone(),
    }
    .username_or(node)
    .to_string();
    Ok((username, topic.to_string()))
}

async fn subscribe(query: TopicQuery, server: Server) -> Result<impl Reply, Rejection> {
    let (username, topic) = topic_request(&query, server.node_name())?;
    let topic = server.subscribe(&username, &topic).await?;
    Ok(format!("Subscribed to {topic}"))
}

async fn unsubscribe(query: TopicQuery, server: Server) -> Result<impl Reply, Rejection> {
    let (username, topic) = topic_request(&query, server.node_name())?;
    let topic = server.unsubscribe(&username, &topic).await?;
    Ok(format!("Unsubscribed from {topic}"))
}

async fn upload(
    query: UploadQuery,
    form: warp::multipart::FormData,
    server: Server,
) -> Result<impl Reply, Rejection> {
    let uploaded = server.file_manager.receive(form).await?;

    if let Some(sender) = query.username.filter(|name| !name.trim().is_empty()) {
        let mut message = Message::file(sender, &uploaded.url, &uploaded.file_name);
        if let Some(topic) = query.topic.filter(|topic| !topic.trim().is_empty()) {
            message = message.with_topic(topic);
        }
        if let Some(recipient) = query.recipient.filter(|name| !name.trim().is_empty()) {
            message = message.with_recipient(recipient);
        }
        server.publish(message).await?;
    }
    Ok(warp::reply::json(&uploaded))
}

async fn upgrade(
    ws: warp::ws::Ws,
    query: UserQuery,
    server: Server,
) -> Result<impl Reply, Rejection> {
    let username = match query.username.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => Some(accounts::validate_username(name)?.to_string()),
        _ => None,
    };
    Ok(ws.on_upgrade(move |socket| async move {
        server.handle_connection(socket, username).await;
    }))
}

async fn health(server: Server) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&serde_json::json!({
        "status": "ok",
        "node": server.node_name(),
        "peers": server.relay().peer_names().await,
        "sessions": server.session_count().await,
    })))
}

async fn events(username: String, server: Server) -> Result<impl Reply, Rejection> {
    let username = accounts::validate_username(&username)?.to_string();
    let stream = server.event_stream(username).await?;
    let events = stream.map(|message| Event::default().event("message").json_data(message));
    Ok(warp::sse::reply(warp::sse::keep_alive().stream(events)))
}

// The web client expects to know whose node it is talking to.
async fn index(query: UserQuery, server: Server) -> Result<impl Reply, Rejection> {
    if query.username.is_some() {
        return Err(warp::reject::not_found());
    }
    let location = format!("/?username={}", server.node_name());
    let uri = Uri::try_from(location.as_str())
        .map_err(|e| ChatError::Invalid(format!("bad redirect {location:?}: {e}")))?;
    Ok(warp::redirect::found(uri))
}
