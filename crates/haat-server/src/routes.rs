use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use haat_contracts::{
    ChatListResponse, ContactsResponse, HistoryQuery, HistoryResponse, MarkReadResponse,
    OpenChatRequest, OpenChatResponse, SendMessageRequest, SendMessageResponse,
};

use crate::auth::Caller;
use crate::error::ChatError;
use crate::AppState;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ChatError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ChatError::InvalidInput(e.body_text()))
}

pub async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

pub async fn list_chats(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<Json<ChatListResponse>, ChatError> {
    state.chat.list_my_conversations(&caller).await.map(Json)
}

pub async fn list_contacts(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<Json<ContactsResponse>, ChatError> {
    let contacts = state.chat.list_contacts(&caller).await?;
    Ok(Json(ContactsResponse { contacts }))
}

pub async fn open_chat(
    State(state): State<AppState>,
    Caller(caller): Caller,
    payload: Result<Json<OpenChatRequest>, JsonRejection>,
) -> Result<Json<OpenChatResponse>, ChatError> {
    let req = body(payload)?;
    let chat = state.chat.create_or_open(&caller, req).await?;
    Ok(Json(OpenChatResponse { chat }))
}

/// Unparseable paging parameters fall back to the defaults.
pub async fn chat_messages(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(chat_id): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ChatError> {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    state
        .chat
        .get_history(&caller, &chat_id, query)
        .await
        .map(Json)
}

pub async fn send_message(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(chat_id): Path<String>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SendMessageResponse>), ChatError> {
    let req = body(payload)?;
    let sent = state.chat.send_message(&caller, &chat_id, &req.text).await?;
    Ok((StatusCode::CREATED, Json(sent)))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(chat_id): Path<String>,
) -> Result<Json<MarkReadResponse>, ChatError> {
    let unread_count = state.chat.mark_read(&caller, &chat_id).await?;
    Ok(Json(MarkReadResponse { unread_count }))
}
