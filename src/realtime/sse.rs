use crate::api::ByteStream;
use crate::errors::{AppError, AppResult};
use eventsource_stream::Eventsource;
use futures_util::stream::{BoxStream, StreamExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
}

pub type MessageStream = BoxStream<'static, AppResult<SseMessage>>;

/// Decodes a `text/event-stream` body into messages. Comment lines
/// (heartbeats) and events without data never surface.
pub fn messages(body: ByteStream) -> MessageStream {
    body.eventsource()
        .filter_map(|item| async move {
            match item {
                Ok(event) if event.data.is_empty() => None,
                Ok(event) => Some(Ok(SseMessage {
                    event: event.event,
                    data: event.data,
                })),
                Err(error) => Some(Err(AppError::Stream(error.to_string()))),
            }
        })
        .boxed()
}
