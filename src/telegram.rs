//! Bot-API client implementing [`Delivery`].
//!
//! Videos are streamed as a hand-built `multipart/form-data` body with an
//! exact `Content-Length`, so progress reflects bytes actually handed to the
//! socket. Transport errors are retried with a fixed backoff; HTTP errors and
//! `"ok": false` replies are not.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::TelegramSettings;
use crate::delivery::{Delivery, SnapshotSource};
use crate::layout::display_stem;
use crate::notify::truncate;
use crate::progress::{ProgressSettings, UploadProgress};
use crate::redact::Redactor;

const API_BASE: &str = "https://api.telegram.org";
const SHORT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_READ_MARGIN: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 2500;
const SNAPSHOT_LIMIT: u64 = 20 * 1024 * 1024;

pub struct TelegramClient {
    settings: TelegramSettings,
    agent: ureq::Agent,
    short_agent: ureq::Agent,
    progress: ProgressSettings,
    redactor: Redactor,
    api_base: String,
}

impl TelegramClient {
    pub fn new(settings: TelegramSettings, progress: ProgressSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.connect_timeout)
            .timeout_read(settings.read_timeout)
            .timeout_write(settings.write_timeout)
            .build();
        let short_agent = ureq::AgentBuilder::new()
            .timeout_connect(SHORT_TIMEOUT)
            .timeout_read(SHORT_TIMEOUT)
            .timeout_write(SHORT_TIMEOUT)
            .build();
        let redactor = Redactor::new(vec![settings.token.clone()], true);
        Self {
            settings,
            agent,
            short_agent,
            progress,
            redactor,
            api_base: API_BASE.to_string(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.settings.token, method)
    }

    fn disable_notification(&self) -> &'static str {
        if self.settings.silent_mode == 0 {
            "true"
        } else {
            "false"
        }
    }

    /// Run `attempt` up to `retries` times, retrying only transport errors.
    fn with_retries<F>(&self, method: &str, mut attempt: F) -> Result<serde_json::Value>
    where
        F: FnMut(u32) -> Result<std::result::Result<ureq::Response, ureq::Error>>,
    {
        let attempts = self.settings.retries.max(1);
        let mut last_error = String::new();
        for n in 1..=attempts {
            match attempt(n)? {
                Ok(response) => return self.read_ok(method, response),
                Err(ureq::Error::Status(code, response)) => {
                    let body = response.into_string().unwrap_or_default();
                    bail!(
                        "{} HTTP {}: {}",
                        method,
                        code,
                        self.redactor.redact(&truncate(&body, ERROR_BODY_LIMIT))
                    );
                }
                Err(ureq::Error::Transport(transport)) => {
                    last_error = self.redactor.redact(&transport.to_string());
                    log::warn!(
                        "{} request failed (attempt {}/{}): {}",
                        method,
                        n,
                        attempts,
                        last_error
                    );
                    if n < attempts {
                        std::thread::sleep(self.settings.retry_backoff);
                    }
                }
            }
        }
        Err(anyhow!(
            "{} failed after {} attempts: {}",
            method,
            attempts,
            last_error
        ))
    }

    fn read_ok(&self, method: &str, response: ureq::Response) -> Result<serde_json::Value> {
        let status = response.status();
        let body = response
            .into_string()
            .with_context(|| format!("{} read response body", method))?;
        if !(200..300).contains(&status) {
            bail!(
                "{} HTTP {}: {}",
                method,
                status,
                truncate(&body, ERROR_BODY_LIMIT)
            );
        }
        parse_api_reply(method, &body)
    }

    /// Long-poll for operator messages.
    pub fn get_updates(&self, offset: Option<i64>, timeout_secs: u64) -> Result<Vec<Update>> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(POLL_CONNECT_TIMEOUT)
            .timeout_read(Duration::from_secs(timeout_secs) + POLL_READ_MARGIN)
            .build();
        let mut request = agent
            .get(&self.method_url("getUpdates"))
            .query("timeout", &timeout_secs.to_string());
        if let Some(offset) = offset {
            request = request.query("offset", &offset.to_string());
        }
        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => bail!("getUpdates HTTP {}", code),
            Err(ureq::Error::Transport(t)) => {
                bail!("getUpdates failed: {}", self.redactor.redact(&t.to_string()))
            }
        };
        let result = self.read_ok("getUpdates", response)?;
        serde_json::from_value(result).context("decode getUpdates result")
    }

    /// GET a camera snapshot with short timeouts.
    pub fn fetch_snapshot(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .short_agent
            .get(url)
            .call()
            .map_err(|e| anyhow!("fetch snapshot: {}", self.redactor.redact(&e.to_string())))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(SNAPSHOT_LIMIT)
            .read_to_end(&mut bytes)
            .context("read snapshot body")?;
        if bytes.is_empty() {
            bail!("empty snapshot");
        }
        Ok(bytes)
    }
}

impl Delivery for TelegramClient {
    fn send_text(&self, text: &str) -> Result<()> {
        let url = self.method_url("sendMessage");
        let chat_id = self.settings.chat_id.as_str();
        let silent = self.disable_notification();
        self.with_retries("sendMessage", |_| {
            Ok(self.agent.post(&url).send_form(&[
                ("chat_id", chat_id),
                ("text", text),
                ("disable_notification", silent),
                ("disable_web_page_preview", "true"),
            ]))
        })?;
        Ok(())
    }

    fn send_image(&self, image: &[u8], filename: &str, caption: &str) -> Result<()> {
        let url = self.method_url("sendPhoto");
        let mut fields = vec![
            ("chat_id", self.settings.chat_id.as_str()),
            ("disable_notification", self.disable_notification()),
        ];
        if !caption.is_empty() {
            fields.push(("caption", caption));
        }
        self.with_retries("sendPhoto", |_| {
            let boundary = new_boundary();
            let body = multipart_bytes(&boundary, &fields, "photo", filename, "image/jpeg", image);
            Ok(self
                .agent
                .post(&url)
                .set("Content-Type", &multipart_content_type(&boundary))
                .send_bytes(&body))
        })?;
        log::info!("sent image {}", filename);
        Ok(())
    }

    fn send_video(&self, path: &Path, caption: &str) -> Result<()> {
        let url = self.method_url("sendVideo");
        let fields = [
            ("chat_id", self.settings.chat_id.as_str()),
            ("disable_notification", self.disable_notification()),
            ("caption", caption),
        ];
        let name = display_stem(path)?;
        let attempts = self.settings.retries.max(1);
        self.with_retries("sendVideo", |n| {
            let upload = MultipartUpload::open(&new_boundary(), &fields, "video", path)?;
            log::info!(
                "upload start: file={} size={} multipart={} attempt={}/{}",
                path.display(),
                upload.file_len(),
                upload.content_length(),
                n,
                attempts
            );
            let content_type = upload.content_type();
            let content_length = upload.content_length();
            let progress = self.progress.start(&name, content_length);
            let reader = upload.into_reader(self.settings.chunk_size, progress);
            Ok(self
                .agent
                .post(&url)
                .set("Content-Type", &content_type)
                .set("Content-Length", &content_length.to_string())
                .send(reader))
        })?;
        log::info!("sendVideo success: {}", path.display());
        Ok(())
    }
}

/// Camera snapshot fetched over HTTP through the client's short-timeout agent.
pub struct CameraSnapshot {
    client: Arc<TelegramClient>,
    url: String,
}

impl CameraSnapshot {
    pub fn new(client: Arc<TelegramClient>, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
        }
    }
}

impl SnapshotSource for CameraSnapshot {
    fn snapshot(&self) -> Result<Vec<u8>> {
        if self.url.is_empty() {
            bail!("SNAPSHOT_URL is not configured");
        }
        self.client.fetch_snapshot(&self.url)
    }
}

/// Successful reply check: `{"ok": true, "result": ...}`.
pub fn parse_api_reply(method: &str, body: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(body)
        .with_context(|| format!("{} returned non-JSON reply", method))?;
    if value.get("ok").and_then(|v| v.as_bool()) != Some(true) {
        bail!(
            "{} ok=false: {}",
            method,
            truncate(body, ERROR_BODY_LIMIT)
        );
    }
    Ok(value
        .get("result")
        .cloned()
        .unwrap_or(serde_json::Value::Null))
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

pub fn new_boundary() -> String {
    format!("----camcourier_{}", hex::encode(rand::random::<[u8; 8]>()))
}

fn multipart_content_type(boundary: &str) -> String {
    format!("multipart/form-data; boundary={boundary}")
}

fn field_parts(boundary: &str, fields: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in fields {
        out.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    out
}

fn file_header(boundary: &str, field: &str, filename: &str, content_type: &str) -> Vec<u8> {
    format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
    )
    .into_bytes()
}

fn closing(boundary: &str) -> Vec<u8> {
    format!("\r\n--{boundary}--\r\n").into_bytes()
}

fn multipart_bytes(
    boundary: &str,
    fields: &[(&str, &str)],
    file_field: &str,
    filename: &str,
    content_type: &str,
    data: &[u8],
) -> Vec<u8> {
    let mut body = field_parts(boundary, fields);
    body.extend_from_slice(&file_header(boundary, file_field, filename, content_type));
    body.extend_from_slice(data);
    body.extend_from_slice(&closing(boundary));
    body
}

fn video_content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp4") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

/// A multipart body whose file part is streamed from disk.
pub struct MultipartUpload {
    boundary: String,
    head: Vec<u8>,
    file: File,
    file_len: u64,
    tail: Vec<u8>,
}

impl MultipartUpload {
    pub fn open(
        boundary: &str,
        fields: &[(&str, &str)],
        file_field: &str,
        path: &Path,
    ) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let file_len = file
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("path {} has no file name", path.display()))?;
        let mut head = field_parts(boundary, fields);
        head.extend_from_slice(&file_header(
            boundary,
            file_field,
            filename,
            video_content_type(path),
        ));
        Ok(Self {
            boundary: boundary.to_string(),
            head,
            file,
            file_len,
            tail: closing(boundary),
        })
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn content_length(&self) -> u64 {
        self.head.len() as u64 + self.file_len + self.tail.len() as u64
    }

    pub fn content_type(&self) -> String {
        multipart_content_type(&self.boundary)
    }

    pub fn into_reader(self, chunk_size: usize, progress: UploadProgress) -> impl Read {
        let body = Cursor::new(self.head)
            .chain(BufReader::with_capacity(chunk_size.max(1), self.file))
            .chain(Cursor::new(self.tail));
        ProgressReader {
            inner: body,
            progress,
        }
    }
}

struct ProgressReader<R> {
    inner: R,
    progress: UploadProgress,
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.progress.finish();
        } else {
            self.progress.advance(n as u64);
        }
        Ok(n)
    }
}
