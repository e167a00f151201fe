use crate::error::RemoteError;
use crate::models::EmailContent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use google_gmail1::Gmail;
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A message id / thread id pair from a search sweep.
#[derive(Debug, Clone)]
pub struct MessageRef {
    pub id: String,
    pub thread_id: Option<String>,
}

/// The mail operations the pipeline drives. `GmailClient` is the real
/// implementation; tests substitute a fake.
#[async_trait]
pub trait Mailbox {
    async fn search_messages(&self, query: &str) -> Result<Vec<MessageRef>>;
    async fn get_message(&self, id: &str) -> Result<EmailContent>;
    async fn ensure_label(&self, name: &str) -> Result<String>;
    async fn apply_label(&self, message_ids: &[String], label_id: &str, batch_size: usize)
    -> Result<()>;
    async fn forward_message(&self, id: &str, to: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct GmailClient {
    hub: Gmail<HttpsConnector<HttpConnector>>,
    max_retries: u32,
    page_delay: Duration,
}

impl GmailClient {
    pub fn new(hub: Gmail<HttpsConnector<HttpConnector>>, max_retries: u32) -> Self {
        Self {
            hub,
            max_retries,
            page_delay: Duration::from_millis(100),
        }
    }

    /// Runs a Gmail call, retrying transient failures with capped
    /// exponential backoff and full jitter. Permanent failures surface
    /// on the first attempt.
    async fn with_backoff<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = google_gmail1::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let err = RemoteError::from(err);
                    if !err.is_transient() || attempt + 1 >= self.max_retries {
                        return Err(err).with_context(|| format!("{} failed", what));
                    }
                    let wait = Duration::from_secs_f64(
                        f64::from(1u32 << attempt) + rand::random::<f64>(),
                    );
                    warn!(
                        "{} hit a transient error, retrying in {:.2}s (attempt {}/{}): {}",
                        what,
                        wait.as_secs_f64(),
                        attempt + 1,
                        self.max_retries,
                        err
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl Mailbox for GmailClient {
    /// Paginated search over the mailbox. Returns every matching
    /// message reference, pacing between pages.
    async fn search_messages(&self, query: &str) -> Result<Vec<MessageRef>> {
        info!("searching with query: {:.100}", query);

        let mut refs = Vec::new();
        let mut page_token: Option<String> = None;
        let mut page_num = 0;

        loop {
            page_num += 1;
            let token = page_token.clone();

            let (_, list) = self
                .with_backoff("message search", || {
                    let mut req = self
                        .hub
                        .users()
                        .messages_list("me")
                        .q(query)
                        .max_results(500);
                    if let Some(t) = &token {
                        req = req.page_token(t);
                    }
                    req.doit()
                })
                .await?;

            let page: Vec<MessageRef> = list
                .messages
                .unwrap_or_default()
                .into_iter()
                .filter_map(|m| {
                    m.id.map(|id| MessageRef {
                        id,
                        thread_id: m.thread_id,
                    })
                })
                .collect();

            debug!("page {}: {} messages (total {})", page_num, page.len(), refs.len() + page.len());
            refs.extend(page);

            page_token = list.next_page_token;
            if page_token.is_none() {
                break;
            }
            tokio::time::sleep(self.page_delay).await;
        }

        info!("search complete: {} messages", refs.len());
        Ok(refs)
    }

    /// Fetches a message in full format and flattens it into headers
    /// plus concatenated html and plain-text bodies.
    async fn get_message(&self, id: &str) -> Result<EmailContent> {
        let (_, msg) = self
            .with_backoff("message fetch", || {
                self.hub
                    .users()
                    .messages_get("me", id)
                    .format("full")
                    .doit()
            })
            .await?;

        let mut content = EmailContent {
            message_id: msg.id.unwrap_or_else(|| id.to_string()),
            thread_id: msg.thread_id,
            ..Default::default()
        };

        if let Some(payload) = &msg.payload {
            if let Some(headers) = &payload.headers {
                for header in headers {
                    match header.name.as_deref() {
                        Some("Subject") => content.subject = header.value.clone().unwrap_or_default(),
                        Some("From") => {
                            content.from_address = header.value.clone().unwrap_or_default()
                        }
                        Some("Date") => content.msg_date = header.value.clone().unwrap_or_default(),
                        _ => {}
                    }
                }
            }
            collect_bodies(payload, &mut content.html_body, &mut content.text_body);
        }

        Ok(content)
    }

    /// Returns the id of the named label, creating it if absent.
    async fn ensure_label(&self, name: &str) -> Result<String> {
        let (_, label_list) = self
            .with_backoff("label list", || self.hub.users().labels_list("me").doit())
            .await?;

        for label in label_list.labels.unwrap_or_default() {
            if label.name.as_deref() == Some(name) {
                let id = label.id.unwrap_or_default();
                info!("label '{}' already exists with id {}", name, id);
                return Ok(id);
            }
        }

        info!("creating label '{}'", name);
        let request = google_gmail1::api::Label {
            name: Some(name.to_string()),
            label_list_visibility: Some("labelShow".to_string()),
            message_list_visibility: Some("show".to_string()),
            ..Default::default()
        };

        let (_, created) = self
            .with_backoff("label create", || {
                self.hub.users().labels_create(request.clone(), "me").doit()
            })
            .await?;

        created.id.context("Label created without an id")
    }

    /// Applies a label to a batch of messages, chunked to the API's
    /// batch-modify limit.
    async fn apply_label(
        &self,
        message_ids: &[String],
        label_id: &str,
        batch_size: usize,
    ) -> Result<()> {
        let total_batches = message_ids.len().div_ceil(batch_size);
        for (batch_num, chunk) in message_ids.chunks(batch_size).enumerate() {
            info!(
                "labeling batch {}/{} ({} messages)",
                batch_num + 1,
                total_batches,
                chunk.len()
            );

            let request = google_gmail1::api::BatchModifyMessagesRequest {
                ids: Some(chunk.to_vec()),
                add_label_ids: Some(vec![label_id.to_string()]),
                remove_label_ids: None,
            };

            self.with_backoff("batch label", || {
                self.hub
                    .users()
                    .messages_batch_modify(request.clone(), "me")
                    .doit()
            })
            .await?;
        }

        info!("labeled {} messages", message_ids.len());
        Ok(())
    }

    /// Forwards a message by wrapping its raw RFC-822 form in a new
    /// outbound message. Returns the sent message id.
    async fn forward_message(&self, id: &str, to: &str) -> Result<String> {
        info!("forwarding message {} to {}", id, to);

        let (_, raw_msg) = self
            .with_backoff("raw message fetch", || {
                self.hub
                    .users()
                    .messages_get("me", id)
                    .format("raw")
                    .doit()
            })
            .await?;

        let raw_bytes = raw_msg.raw.context("Message has no raw content")?;
        let original = String::from_utf8_lossy(&raw_bytes);

        let (_, full_msg) = self
            .with_backoff("message fetch", || {
                self.hub
                    .users()
                    .messages_get("me", id)
                    .format("full")
                    .doit()
            })
            .await?;

        let subject = full_msg
            .payload
            .as_ref()
            .and_then(|p| p.headers.as_ref())
            .and_then(|headers| {
                headers
                    .iter()
                    .find(|h| h.name.as_deref() == Some("Subject"))
                    .and_then(|h| h.value.clone())
            })
            .unwrap_or_else(|| "Flight Confirmation".to_string());

        let outbound = format!(
            "To: {}\r\nSubject: Fwd: {}\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\n\r\n---------- Forwarded message ---------\r\n{}",
            to, subject, original
        );

        use std::io::Cursor;
        let sent = self
            .with_backoff("message send", || {
                let cursor = Cursor::new(outbound.clone().into_bytes());
                self.hub
                    .users()
                    .messages_send(google_gmail1::api::Message::default(), "me")
                    .upload(cursor, "message/rfc822".parse().unwrap())
            })
            .await?;

        let sent_id = sent.1.id.unwrap_or_default();
        info!("forwarded message {} as {}", id, sent_id);
        Ok(sent_id)
    }
}

/// Walks the multipart tree appending decoded text/html and text/plain
/// parts to their buffers.
fn collect_bodies(part: &google_gmail1::api::MessagePart, html: &mut String, text: &mut String) {
    if let Some(parts) = &part.parts {
        for p in parts {
            collect_bodies(p, html, text);
        }
        return;
    }

    let Some(mime) = part.mime_type.as_deref() else {
        return;
    };
    if mime != "text/html" && mime != "text/plain" {
        return;
    }

    if let Some(body) = &part.body {
        if let Some(data) = &body.data {
            if let Some(decoded) = decode_body_data(data) {
                if mime == "text/html" {
                    html.push_str(&decoded);
                } else {
                    text.push_str(&decoded);
                }
            }
        }
    }
}

/// Gmail body data is base64url, but real-world messages are sloppy
/// about padding and alphabet, so try the url-safe engines first and
/// fall back to the standard ones on the untouched input.
fn decode_body_data(data: &[u8]) -> Option<String> {
    use base64::{Engine as _, engine::general_purpose};
    let data_str = String::from_utf8_lossy(data);
    let trimmed = data_str.trim();

    let decoded = general_purpose::URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| general_purpose::URL_SAFE.decode(trimmed))
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(trimmed))
        .or_else(|_| general_purpose::STANDARD.decode(trimmed));

    match decoded {
        Ok(bytes) => String::from_utf8(bytes).ok(),
        // If base64 decoding fails, it might already be raw content
        Err(_) => String::from_utf8(data.to_vec()).ok(),
    }
}
