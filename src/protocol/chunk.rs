//! Fragments and reassembles oversized payloads over a request/reply bus
//! that caps individual messages.
//!
//! The bus offers no streaming primitive, so flow control is pushed into
//! request/reply: every intermediate fragment is a `request`, which gives
//! per-chunk backpressure and turns a lost fragment into an immediate
//! timeout instead of a silent stall.

use std::time::Duration;

use tracing::{debug, warn};

use crate::bus::{Bus, Message};
use crate::protocol::{random_token, HEADER_CHUNKS, HEADER_CHUNKS_SEQ, HEADER_CHUNK_SUBJECT, HEADER_MSGID};
use crate::{Error, Result};

/// Fragment size: 95% of the bus's advertised `max_payload`.
pub fn chunk_limit(max_payload: usize) -> usize {
    (max_payload as f64 * 0.95).floor() as usize
}

/// Number of additional fragments after the first, for a body of `len`
/// bytes at `limit` bytes per fragment: `P = floor(len / limit)`.
fn additional_chunk_count(len: usize, limit: usize) -> usize {
    len / limit
}

fn slice_bounds(i: usize, limit: usize, len: usize) -> (usize, usize) {
    let start = i * limit;
    let end = std::cmp::min(start + limit, len);
    (start, end)
}

/// Split `body` into `P + 1` contiguous slices of at most `limit` bytes
/// each, where `P = floor(len(body) / limit)`. When `len(body)` is an exact
/// multiple of `limit` the final slice is empty but still present.
fn split_into_chunks(body: &[u8], limit: usize) -> Vec<&[u8]> {
    let pages = additional_chunk_count(body.len(), limit);
    (0..=pages)
        .map(|i| {
            let (start, end) = slice_bounds(i, limit, body.len());
            &body[start..end]
        })
        .collect()
}

fn ensure_msgid(msg: &Message) -> Result<()> {
    if msg.header(HEADER_MSGID).unwrap_or("").is_empty() {
        return Err(Error::Protocol("MSGID not set".into()));
    }
    Ok(())
}

/// Send `req` to the bus, fragmenting if it exceeds `limit`, and return the
/// (already-reassembled) reply.
pub async fn send_request(
    bus: &dyn Bus,
    req: Message,
    limit: usize,
    deadline: Duration,
) -> Result<Message> {
    ensure_msgid(&req)?;

    if req.body.len() <= limit {
        let reply = bus.request(req, deadline).await?;
        return reassemble(bus, reply, deadline).await;
    }

    let chunks = split_into_chunks(&req.body, limit);
    let pages = chunks.len() - 1;
    debug!(msgid = req.header(HEADER_MSGID), pages, "chunking send_request");

    let first = Message {
        subject: req.subject.clone(),
        reply_subject: None,
        headers: {
            let mut h = req.headers.clone();
            h.insert(HEADER_CHUNKS.to_string(), pages.to_string());
            h
        },
        body: chunks[0].to_vec(),
    };
    let negotiation = bus.request(first, deadline).await?;
    let chunk_subject = negotiation
        .header(HEADER_CHUNK_SUBJECT)
        .ok_or_else(|| Error::Protocol("chunked response didn't include subject".into()))?
        .to_string();

    let mut last_ack = None;
    for (i, chunk) in chunks.iter().enumerate().skip(1) {
        let msg = Message {
            subject: chunk_subject.clone(),
            reply_subject: None,
            headers: {
                let mut h = req.headers.clone();
                h.insert(HEADER_CHUNKS_SEQ.to_string(), i.to_string());
                h
            },
            body: chunk.to_vec(),
        };
        last_ack = Some(bus.request(msg, deadline).await?);
    }

    // The response to the final chunk is the logical reply to the request.
    let reply = last_ack.expect("pages > 0 implies at least one chunk send");
    reassemble(bus, reply, deadline).await
}

/// Send `reply` back to `orig`, fragmenting if it exceeds `limit`.
/// The final fragment is published, not requested, because the replier
/// does not expect a further answer.
pub async fn send_reply(bus: &dyn Bus, orig: &Message, reply: Message, limit: usize, deadline: Duration) -> Result<()> {
    ensure_msgid(&reply)?;

    if reply.body.len() <= limit {
        bus.respond(orig, reply).await?;
        return Ok(());
    }

    let chunks = split_into_chunks(&reply.body, limit);
    let pages = chunks.len() - 1;
    debug!(msgid = reply.header(HEADER_MSGID), pages, "chunking send_reply");

    let first = Message {
        subject: orig
            .reply_subject
            .clone()
            .ok_or_else(|| Error::Protocol("original message carries no reply subject".into()))?,
        reply_subject: None,
        headers: {
            let mut h = reply.headers.clone();
            h.insert(HEADER_CHUNKS.to_string(), pages.to_string());
            h
        },
        body: chunks[0].to_vec(),
    };
    let negotiation = bus.request(first, deadline).await?;
    let chunk_subject = negotiation
        .header(HEADER_CHUNK_SUBJECT)
        .ok_or_else(|| Error::Protocol("chunked response didn't include subject".into()))?
        .to_string();

    for (i, chunk) in chunks.iter().enumerate().skip(1) {
        let msg = Message {
            subject: chunk_subject.clone(),
            reply_subject: None,
            headers: {
                let mut h = reply.headers.clone();
                h.insert(HEADER_CHUNKS_SEQ.to_string(), i.to_string());
                h
            },
            body: chunk.to_vec(),
        };
        if i < pages {
            bus.request(msg, deadline).await?;
        } else {
            bus.publish(msg).await?;
        }
    }
    Ok(())
}

/// Reassemble `msg` if it carries `X-RNS-CHUNKS`, otherwise return it
/// unchanged. On any error or deadline expiry the partially assembled
/// buffer is discarded rather than returned short.
pub async fn reassemble(bus: &dyn Bus, msg: Message, deadline: Duration) -> Result<Message> {
    let pages: usize = match msg.header(crate::protocol::HEADER_CHUNKS) {
        None => return Ok(msg),
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid {HEADER_CHUNKS} value: {raw}")))?,
    };
    ensure_msgid(&msg)?;

    let (chunk_subject, mut sub) = bus.new_inbox_subscription().await?;
    let negotiation_reply = Message {
        subject: String::new(),
        reply_subject: None,
        headers: {
            let mut h = msg.headers.clone();
            h.insert(HEADER_CHUNK_SUBJECT.to_string(), chunk_subject.clone());
            h
        },
        body: Vec::new(),
    };
    let result: Result<Message> = async {
        bus.respond(&msg, negotiation_reply).await?;

        let mut body = msg.body.clone();
        let mut reply_subject = msg.reply_subject.clone();
        for i in 1..=pages {
            let chunk = sub
                .next(deadline)
                .await?
                .ok_or_else(|| Error::Protocol("chunk subscription closed early".into()))?;
            if let Some(seq) = chunk.header(HEADER_CHUNKS_SEQ) {
                debug!(seq, expected = i, "received chunk");
            } else {
                warn!("chunk missing {HEADER_CHUNKS_SEQ} header");
            }
            body.extend_from_slice(&chunk.body);
            if i < pages {
                bus.respond(&chunk, Message::new("")).await?;
            } else {
                // Final fragment was published, not requested: preserve its
                // reply_subject so the eventual op reply reaches the
                // original requester.
                reply_subject = chunk.reply_subject.clone();
            }
        }

        Ok(Message {
            subject: msg.subject.clone(),
            reply_subject,
            headers: msg.headers.clone(),
            body,
        })
    }
    .await;

    let _ = sub.unsubscribe().await;
    result
}
