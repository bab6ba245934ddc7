use std::fmt::Display;

use eventsource_stream::{Event as SseEvent, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use shared::{domain::Event, error::ApiError, protocol::decode_event};

/// The event name a frame gets when the server sends no `event:` field.
const DEFAULT_EVENT_NAME: &str = "message";

/// Maps one dispatched frame to a domain event. Unnamed frames carry their
/// type inside the payload envelope.
pub fn into_domain_event(frame: SseEvent) -> Event {
    let name = Some(frame.event.as_str())
        .filter(|name| !name.is_empty() && *name != DEFAULT_EVENT_NAME);
    decode_event(name, &frame.data)
}

/// Decodes a `text/event-stream` body into domain events. Transport errors go
/// through `map_transport_error`; framing errors surface as network errors.
pub fn decode_event_stream<S, B, E>(
    body: S,
    map_transport_error: impl Fn(E) -> ApiError,
) -> impl Stream<Item = Result<Event, ApiError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    body.eventsource().map(move |frame| match frame {
        Ok(frame) => Ok(into_domain_event(frame)),
        Err(EventStreamError::Transport(err)) => Err(map_transport_error(err)),
        Err(err) => Err(ApiError::network(err.to_string())),
    })
}

#[cfg(test)]
#[path = "tests/sse_tests.rs"]
mod tests;
