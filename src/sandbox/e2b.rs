//! Hosted MicroVM backend.
//!
//! The control plane creates sandboxes from a template; each sandbox runs an
//! in-VM daemon (envd) that serves the file system over plain HTTP and
//! process execution over a Connect RPC server stream.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use super::{CommandOutput, OutputSink, SandboxError, SandboxProvider, SandboxSession};
use crate::config::E2bConfig;

/// Port envd listens on inside every sandbox.
const ENVD_PORT: u16 = 49983;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

/// Provisions sandboxes through the E2B control plane.
pub(crate) struct E2bProvider {
    client: Client,
    api_key: String,
    config: E2bConfig,
    command_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxInfo {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(default)]
    envd_access_token: Option<String>,
}

impl E2bProvider {
    pub fn new(
        api_key: String,
        config: E2bConfig,
        command_timeout: Duration,
    ) -> Result<Self, SandboxError> {
        let client = Client::builder()
            .build()
            .map_err(|e| SandboxError::unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            config,
            command_timeout,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl SandboxProvider for E2bProvider {
    fn name(&self) -> &'static str {
        "e2b"
    }

    async fn provision(&self, template: &str, timeout: Duration) -> Result<String, SandboxError> {
        let body = json!({
            "templateID": template,
            "timeout": timeout.as_secs(),
        });
        let request = self
            .client
            .post(self.api("/sandboxes"))
            .header("X-API-Key", &self.api_key)
            .timeout(CONTROL_TIMEOUT)
            .json(&body);

        let response = send(request, CONTROL_TIMEOUT, "sandbox").await?;
        let info: SandboxInfo = response
            .json()
            .await
            .map_err(|e| SandboxError::operation_failed(format!("invalid create response: {e}")))?;

        info!(sandbox_id = %info.sandbox_id, template, "E2B sandbox created");
        Ok(info.sandbox_id)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Box<dyn SandboxSession>, SandboxError> {
        let request = self
            .client
            .get(self.api(&format!("/sandboxes/{sandbox_id}")))
            .header("X-API-Key", &self.api_key)
            .timeout(CONTROL_TIMEOUT);

        let response = send(request, CONTROL_TIMEOUT, sandbox_id).await?;
        let info: SandboxInfo = response
            .json()
            .await
            .map_err(|e| SandboxError::operation_failed(format!("invalid sandbox info: {e}")))?;

        Ok(Box::new(E2bSession {
            client: self.client.clone(),
            sandbox_id: info.sandbox_id,
            access_token: info.envd_access_token,
            config: self.config.clone(),
            command_timeout: self.command_timeout,
        }))
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let request = self
            .client
            .delete(self.api(&format!("/sandboxes/{sandbox_id}")))
            .header("X-API-Key", &self.api_key)
            .timeout(CONTROL_TIMEOUT);

        send(request, CONTROL_TIMEOUT, sandbox_id).await?;
        info!(sandbox_id, "E2B sandbox killed");
        Ok(())
    }
}

/// A connection to one running E2B sandbox.
struct E2bSession {
    client: Client,
    sandbox_id: String,
    access_token: Option<String>,
    config: E2bConfig,
    command_timeout: Duration,
}

impl E2bSession {
    fn envd(&self, path: &str) -> String {
        format!(
            "https://{}{path}",
            sandbox_host(ENVD_PORT, &self.sandbox_id, &self.config.domain)
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        // envd selects the acting OS user from basic auth with an empty password
        let user = BASE64.encode(format!("{}:", self.config.user));
        let request = request.header(header::AUTHORIZATION, format!("Basic {user}"));
        match self.access_token {
            Some(ref token) => request.header("X-Access-Token", token),
            None => request,
        }
    }

    async fn start_process(
        &self,
        command: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<CommandOutput, SandboxError> {
        let message = json!({
            "process": {
                "cmd": "/bin/bash",
                "args": ["-l", "-c", command],
                "envs": {},
                "cwd": self.config.workdir,
            }
        });
        let body = encode_envelope(&message);

        let request = self
            .authorize(self.client.post(self.envd("/process.Process/Start")))
            .header(header::CONTENT_TYPE, "application/connect+json")
            .header("Connect-Protocol-Version", "1")
            .body(body);

        let response = send(request, self.command_timeout, command).await?;
        let mut stream = response.bytes_stream();
        let mut decoder = EnvelopeDecoder::default();
        let mut result = ProcessResult {
            command_timeout: self.command_timeout,
            ..ProcessResult::default()
        };

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_transport(&e, self.command_timeout))?;
            for frame in decoder.push(&chunk)? {
                if result.apply(&frame, sink)? {
                    return result.finish();
                }
            }
        }

        result.finish()
    }
}

#[async_trait]
impl SandboxSession for E2bSession {
    fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    async fn run_command(
        &self,
        command: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<CommandOutput, SandboxError> {
        debug!(sandbox_id = %self.sandbox_id, command, "Running command");
        match tokio::time::timeout(self.command_timeout, self.start_process(command, sink)).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::timeout(self.command_timeout)),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let part = reqwest::multipart::Part::text(content.to_string()).file_name(path.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);

        let request = self
            .authorize(self.client.post(self.envd("/files")))
            .query(&[("path", path), ("username", self.config.user.as_str())])
            .timeout(CONTROL_TIMEOUT)
            .multipart(form);

        send(request, CONTROL_TIMEOUT, path).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let request = self
            .authorize(self.client.get(self.envd("/files")))
            .query(&[("path", path), ("username", self.config.user.as_str())])
            .timeout(CONTROL_TIMEOUT);

        let response = send(request, CONTROL_TIMEOUT, path).await?;
        response
            .text()
            .await
            .map_err(|e| map_transport(&e, CONTROL_TIMEOUT))
    }

    async fn host(&self, port: u16) -> Result<String, SandboxError> {
        Ok(sandbox_host(port, &self.sandbox_id, &self.config.domain))
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

fn sandbox_host(port: u16, sandbox_id: &str, domain: &str) -> String {
    format!("{port}-{sandbox_id}.{domain}")
}

/// Send a request and classify non-success statuses.
///
/// `subject` names what a 404 refers to.
async fn send(
    request: RequestBuilder,
    timeout: Duration,
    subject: &str,
) -> Result<Response, SandboxError> {
    let response = request
        .send()
        .await
        .map_err(|e| map_transport(&e, timeout))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body, subject))
}

fn classify_status(status: StatusCode, body: &str, subject: &str) -> SandboxError {
    match status {
        StatusCode::NOT_FOUND => SandboxError::not_found(subject),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SandboxError::unavailable(format!("authentication rejected ({status}): {body}"))
        }
        s if s.is_server_error() => SandboxError::unavailable(format!("{s}: {body}")),
        s => SandboxError::operation_failed(format!("{s}: {body}")),
    }
}

fn map_transport(err: &reqwest::Error, timeout: Duration) -> SandboxError {
    if err.is_timeout() {
        SandboxError::timeout(timeout)
    } else if err.is_connect() {
        SandboxError::unavailable(err.to_string())
    } else {
        SandboxError::operation_failed(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Connect envelope framing
// ---------------------------------------------------------------------------

const FLAG_END_STREAM: u8 = 0b10;

/// One length-prefixed message on a Connect stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Envelope {
    end_stream: bool,
    payload: Bytes,
}

fn encode_envelope(message: &serde_json::Value) -> Vec<u8> {
    let payload = message.to_string().into_bytes();
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.push(0);
    out.extend_from_slice(&u32::try_from(payload.len()).unwrap_or(u32::MAX).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Reassembles envelopes from arbitrarily split body chunks.
#[derive(Debug, Default)]
struct EnvelopeDecoder {
    buf: BytesMut,
}

impl EnvelopeDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<Envelope>, SandboxError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < 5 {
                break;
            }
            let flags = self.buf[0];
            if flags & 0b01 != 0 {
                return Err(SandboxError::operation_failed(
                    "compressed process stream frames are not supported",
                ));
            }
            let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
            let len = len as usize;
            if self.buf.len() < 5 + len {
                break;
            }
            self.buf.advance(5);
            let payload = self.buf.split_to(len).freeze();
            frames.push(Envelope {
                end_stream: flags & FLAG_END_STREAM != 0,
                payload,
            });
        }
        Ok(frames)
    }
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(default)]
    event: Option<ProcessEvent>,
}

#[derive(Debug, Default, Deserialize)]
struct ProcessEvent {
    #[serde(default)]
    data: Option<DataEvent>,
    #[serde(default)]
    end: Option<EndEvent>,
}

#[derive(Debug, Deserialize)]
struct DataEvent {
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndEvent {
    // proto3 JSON omits zero values
    #[serde(default)]
    exit_code: i64,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndStreamMessage {
    #[serde(default)]
    error: Option<ConnectError>,
}

#[derive(Debug, Deserialize)]
struct ConnectError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Accumulates process events into a [`CommandOutput`].
#[derive(Debug, Default)]
struct ProcessResult {
    stdout: String,
    stderr: String,
    stdout_bytes: Utf8Stream,
    stderr_bytes: Utf8Stream,
    exit_code: Option<i64>,
    command_timeout: Duration,
}

impl ProcessResult {
    /// Apply one frame. Returns true once the stream is complete.
    fn apply(&mut self, frame: &Envelope, sink: &mut dyn OutputSink) -> Result<bool, SandboxError> {
        if frame.end_stream {
            let end: EndStreamMessage = serde_json::from_slice(&frame.payload).map_err(|e| {
                SandboxError::operation_failed(format!("invalid stream trailer: {e}"))
            })?;
            if let Some(err) = end.error {
                return Err(match err.code.as_str() {
                    "deadline_exceeded" => SandboxError::timeout(self.command_timeout),
                    "unavailable" | "unauthenticated" => SandboxError::unavailable(err.message),
                    "not_found" => SandboxError::not_found(err.message),
                    _ => SandboxError::operation_failed(format!("{}: {}", err.code, err.message)),
                });
            }
            return Ok(true);
        }

        let message: StartResponse = serde_json::from_slice(&frame.payload)
            .map_err(|e| SandboxError::operation_failed(format!("invalid process event: {e}")))?;
        let Some(event) = message.event else {
            return Ok(false);
        };

        if let Some(data) = event.data {
            if let Some(chunk) = data.stdout {
                let text = self.stdout_bytes.push(&decode_chunk(&chunk)?);
                self.emit_stdout(&text, sink);
            }
            if let Some(chunk) = data.stderr {
                let text = self.stderr_bytes.push(&decode_chunk(&chunk)?);
                self.emit_stderr(&text, sink);
            }
        }

        if let Some(end) = event.end {
            let text = self.stdout_bytes.flush();
            self.emit_stdout(&text, sink);
            let text = self.stderr_bytes.flush();
            self.emit_stderr(&text, sink);
            if let Some(error) = end.error.filter(|e| !e.is_empty()) {
                self.stderr.push_str(&error);
            }
            self.exit_code = Some(end.exit_code);
        }

        Ok(false)
    }

    fn emit_stdout(&mut self, text: &str, sink: &mut dyn OutputSink) {
        if !text.is_empty() {
            sink.on_stdout(text);
            self.stdout.push_str(text);
        }
    }

    fn emit_stderr(&mut self, text: &str, sink: &mut dyn OutputSink) {
        if !text.is_empty() {
            sink.on_stderr(text);
            self.stderr.push_str(text);
        }
    }

    fn finish(mut self) -> Result<CommandOutput, SandboxError> {
        let text = self.stdout_bytes.flush();
        self.stdout.push_str(&text);
        let text = self.stderr_bytes.flush();
        self.stderr.push_str(&text);
        let exit_code = self.exit_code.ok_or_else(|| {
            SandboxError::operation_failed("process stream ended without an exit status")
        })?;
        Ok(CommandOutput {
            stdout: self.stdout,
            stderr: self.stderr,
            exit_code,
        })
    }
}

fn decode_chunk(chunk: &str) -> Result<Vec<u8>, SandboxError> {
    BASE64
        .decode(chunk)
        .map_err(|e| SandboxError::operation_failed(format!("invalid output chunk: {e}")))
}

/// UTF-8 decoding across chunk boundaries. A character split between two
/// chunks is held back until the rest of it arrives.
#[derive(Debug, Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let complete = self.pending.len() - incomplete_tail(&self.pending);
        let tail = self.pending.split_off(complete);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    fn flush(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing multi-byte sequence that is still missing bytes.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::CapturedOutput;

    fn frame(flags: u8, json: &str) -> Vec<u8> {
        let mut out = vec![flags];
        out.extend_from_slice(&(json.len() as u32).to_be_bytes());
        out.extend_from_slice(json.as_bytes());
        out
    }

    fn data_frame(stream: &str, text: &str) -> Vec<u8> {
        frame(
            0,
            &format!(
                r#"{{"event":{{"data":{{"{stream}":"{}"}}}}}}"#,
                BASE64.encode(text)
            ),
        )
    }

    #[test]
    fn test_sandbox_host() {
        assert_eq!(sandbox_host(3000, "abc123", "e2b.app"), "3000-abc123.e2b.app");
    }

    #[test]
    fn test_encode_envelope_prefix() {
        let encoded = encode_envelope(&json!({"a": 1}));
        assert_eq!(encoded[0], 0);
        assert_eq!(&encoded[1..5], &7u32.to_be_bytes());
        assert_eq!(&encoded[5..], br#"{"a":1}"#);
    }

    #[test]
    fn test_decoder_handles_split_frames() {
        let mut bytes = data_frame("stdout", "hi");
        bytes.extend(frame(FLAG_END_STREAM, "{}"));

        let mut decoder = EnvelopeDecoder::default();
        let (first, rest) = bytes.split_at(3);
        assert!(decoder.push(first).unwrap().is_empty());
        let frames = decoder.push(rest).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(!frames[0].end_stream);
        assert!(frames[1].end_stream);
    }

    #[test]
    fn test_decoder_rejects_compressed_frames() {
        let mut decoder = EnvelopeDecoder::default();
        assert!(decoder.push(&frame(0b01, "{}")).is_err());
    }

    #[test]
    fn test_process_result_collects_output_and_exit_code() {
        let mut bytes = frame(0, r#"{"event":{"start":{"pid":42}}}"#);
        bytes.extend(data_frame("stdout", "added 3 packages\n"));
        bytes.extend(data_frame("stderr", "npm warn\n"));
        bytes.extend(frame(0, r#"{"event":{"keepalive":{}}}"#));
        bytes.extend(frame(0, r#"{"event":{"end":{"exited":true,"status":"exit status 0"}}}"#));
        bytes.extend(frame(FLAG_END_STREAM, "{}"));

        let mut decoder = EnvelopeDecoder::default();
        let mut result = ProcessResult::default();
        let mut sink = CapturedOutput::default();
        let mut done = false;
        for f in decoder.push(&bytes).unwrap() {
            done = result.apply(&f, &mut sink).unwrap();
        }
        assert!(done);

        let output = result.finish().unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "added 3 packages\n");
        assert_eq!(output.stderr, "npm warn\n");
        assert_eq!(sink.stdout, output.stdout);
    }

    #[test]
    fn test_process_result_nonzero_exit() {
        let mut result = ProcessResult::default();
        let mut sink = CapturedOutput::default();
        let end = Envelope {
            end_stream: false,
            payload: Bytes::from_static(br#"{"event":{"end":{"exitCode":127,"exited":true}}}"#),
        };
        result.apply(&end, &mut sink).unwrap();
        assert_eq!(result.finish().unwrap().exit_code, 127);
    }

    #[test]
    fn test_process_result_without_end_is_error() {
        let result = ProcessResult::default();
        assert!(result.finish().is_err());
    }

    #[test]
    fn test_end_stream_error_is_reported() {
        let mut result = ProcessResult::default();
        let mut sink = CapturedOutput::default();
        let trailer = Envelope {
            end_stream: true,
            payload: Bytes::from_static(
                br#"{"error":{"code":"unavailable","message":"sandbox is paused"}}"#,
            ),
        };
        let err = result.apply(&trailer, &mut sink).unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_deadline_exceeded_is_timeout() {
        let mut result = ProcessResult {
            command_timeout: Duration::from_secs(90),
            ..ProcessResult::default()
        };
        let mut sink = CapturedOutput::default();
        let trailer = Envelope {
            end_stream: true,
            payload: Bytes::from_static(
                br#"{"error":{"code":"deadline_exceeded","message":"context deadline exceeded"}}"#,
            ),
        };
        let err = result.apply(&trailer, &mut sink).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_character_split_across_chunks_is_kept() {
        // "é" is 0xC3 0xA9 and arrives in two events
        let first = frame(0, &format!(r#"{{"event":{{"data":{{"stdout":"{}"}}}}}}"#, BASE64.encode([b'c', b'a', b'f', 0xC3])));
        let second = frame(0, &format!(r#"{{"event":{{"data":{{"stdout":"{}"}}}}}}"#, BASE64.encode([0xA9, b'\n'])));
        let mut bytes = first;
        bytes.extend(second);
        bytes.extend(frame(0, r#"{"event":{"end":{"exitCode":0,"exited":true}}}"#));

        let mut decoder = EnvelopeDecoder::default();
        let mut result = ProcessResult::default();
        let mut sink = CapturedOutput::default();
        for f in decoder.push(&bytes).unwrap() {
            result.apply(&f, &mut sink).unwrap();
        }

        let output = result.finish().unwrap();
        assert_eq!(output.stdout, "café\n");
        assert_eq!(sink.stdout, "café\n");
    }

    #[test]
    fn test_utf8_stream_holds_incomplete_tail() {
        let mut stream = Utf8Stream::default();
        let snowman = "☃".as_bytes();
        assert_eq!(stream.push(&snowman[..1]), "");
        assert_eq!(stream.push(&snowman[1..2]), "");
        assert_eq!(stream.push(&snowman[2..]), "☃");
        assert_eq!(stream.push(&[0xE2]), "");
        assert_eq!(stream.flush(), "\u{FFFD}");
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::NOT_FOUND, "", "app/page.tsx").is_not_found());
        assert!(classify_status(StatusCode::UNAUTHORIZED, "bad key", "x").is_unavailable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "", "x").is_unavailable());
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad", "x"),
            SandboxError::OperationFailed { .. }
        ));
    }
}
