//! # Exchange Capture Parser
//!
//! Reassembles HTTP/1.1 request/response pairs from the two byte
//! directions of a forwarded connection. The forwarder tees chunks in as
//! they pass; parsing happens on the teed copy and never gates the copy
//! loop itself.
//!
//! One connection can carry many pipelined exchanges; the k-th request is
//! paired with the k-th response. Bodies are captured up to the configured
//! cap and only counted beyond it. A parse failure marks the affected
//! exchange `malformed`, records what was seen, and stops interpreting
//! that connection; forwarding is unaffected.

use fxtunnel_protocol::unix_millis;
use std::collections::VecDeque;
use std::time::Instant;

/// Heads larger than this are treated as malformed.
const MAX_HEAD_LEN: usize = 64 * 1024;

/// Chunk size lines larger than this are treated as malformed.
const MAX_CHUNK_LINE: usize = 1024;

/// A finalized exchange, ready for the ring buffer. The inspector assigns
/// the public id on insert.
#[derive(Debug, Clone)]
pub struct ExchangeDraft {
    pub tunnel_id: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub request_headers: Vec<(String, String)>,
    pub request_body: Vec<u8>,
    pub request_truncated: bool,
    pub request_body_size: u64,
    pub response_status: u16,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Vec<u8>,
    pub response_truncated: bool,
    pub response_body_size: u64,
    pub started_at: u64,
    pub duration_ns: u64,
    pub malformed: bool,
    pub replay_ref: Option<String>,
}

// ─── One Direction ──────────────────────────────────────────────

/// Parsed head of the message currently being captured.
#[derive(Debug, Clone)]
enum HeadInfo {
    Request {
        method: String,
        path: String,
        host: String,
    },
    Response {
        status: u16,
    },
}

#[derive(Debug)]
enum BodyKind {
    /// Content-Length bytes remaining.
    Length(u64),
    Chunked(ChunkPhase),
    /// Response delimited by connection close.
    ToClose,
}

#[derive(Debug)]
enum ChunkPhase {
    /// Accumulating the hex size line.
    Size,
    /// Chunk payload bytes remaining.
    Data(u64),
    /// CRLF terminating a chunk's payload.
    DataEnd,
    /// After the zero chunk; consuming (possibly empty) trailers.
    Trailers,
}

#[derive(Debug)]
enum SideState {
    Head,
    Body(BodyKind),
    /// Parse error; bytes still flow but are no longer interpreted.
    Broken,
}

/// Captured half of one exchange.
#[derive(Debug, Default)]
struct HalfCapture {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    truncated: bool,
    body_size: u64,
}

/// A message one side finished parsing.
struct SideMessage {
    head: HeadInfo,
    capture: HalfCapture,
}

/// Incremental parser for one direction of one connection.
struct SideParser {
    is_request: bool,
    state: SideState,
    buf: Vec<u8>,
    head: Option<HeadInfo>,
    capture: HalfCapture,
    max_body: usize,
    broke: bool,
}

impl SideParser {
    fn new(is_request: bool, max_body: usize) -> Self {
        Self {
            is_request,
            state: SideState::Head,
            buf: Vec::new(),
            head: None,
            capture: HalfCapture::default(),
            max_body,
            broke: false,
        }
    }

    /// Feeds one teed chunk; returns every message completed by it.
    /// `paired_methods` are the methods of the requests still awaiting a
    /// response, oldest first; a response side consults them so HEAD
    /// responses are framed bodyless.
    fn feed(&mut self, bytes: &[u8], paired_methods: &[String]) -> Vec<SideMessage> {
        if matches!(self.state, SideState::Broken) {
            return Vec::new();
        }
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            match &self.state {
                SideState::Broken => break,
                SideState::Head => {
                    let Some(head_end) = find_head_end(&self.buf) else {
                        if self.buf.len() > MAX_HEAD_LEN {
                            self.break_parsing();
                        }
                        break;
                    };
                    let head_bytes: Vec<u8> = self.buf.drain(..head_end).collect();

                    let Some((info, headers)) = parse_head(&head_bytes, self.is_request) else {
                        self.break_parsing();
                        break;
                    };

                    // Interim 1xx responses are skipped entirely.
                    if matches!(&info, HeadInfo::Response { status } if (100..200).contains(status))
                    {
                        continue;
                    }

                    let paired = paired_methods.get(out.len()).map(|m| m.as_str());
                    let body = body_kind(&info, &headers, paired);
                    self.capture.headers = headers;
                    self.head = Some(info);
                    match body {
                        None => out.push(self.complete_message()),
                        Some(kind) => self.state = SideState::Body(kind),
                    }
                }
                SideState::Body(_) => {
                    let SideState::Body(kind) = &mut self.state else {
                        unreachable!();
                    };
                    let progress = advance_body(kind, &mut self.buf);
                    if !progress.captured.is_empty() {
                        self.push_body_bytes(&progress.captured);
                    }
                    if progress.broke {
                        self.break_parsing();
                        break;
                    }
                    if progress.complete {
                        out.push(self.complete_message());
                        continue;
                    }
                    break;
                }
            }
        }
        out
    }

    /// Connection closed: a read-to-close response completes now.
    fn finish(&mut self) -> Option<SideMessage> {
        if matches!(self.state, SideState::Body(BodyKind::ToClose)) {
            self.state = SideState::Head;
            let head = self.head.take()?;
            return Some(SideMessage {
                head,
                capture: std::mem::take(&mut self.capture),
            });
        }
        None
    }

    fn complete_message(&mut self) -> SideMessage {
        self.state = SideState::Head;
        SideMessage {
            head: self.head.take().expect("head parsed before completion"),
            capture: std::mem::take(&mut self.capture),
        }
    }

    fn push_body_bytes(&mut self, bytes: &[u8]) {
        self.capture.body_size += bytes.len() as u64;
        let room = self.max_body.saturating_sub(self.capture.body.len());
        if room >= bytes.len() {
            self.capture.body.extend_from_slice(bytes);
        } else {
            self.capture.body.extend_from_slice(&bytes[..room]);
            self.capture.truncated = true;
        }
    }

    fn break_parsing(&mut self) {
        self.state = SideState::Broken;
        self.broke = true;
        self.buf.clear();
    }
}

// ─── Body Framing Progress ──────────────────────────────────────

struct BodyProgress {
    /// Body bytes consumed by this call.
    captured: Vec<u8>,
    /// The message's body is complete.
    complete: bool,
    /// The framing is unintelligible.
    broke: bool,
}

impl BodyProgress {
    fn more(captured: Vec<u8>) -> Self {
        Self {
            captured,
            complete: false,
            broke: false,
        }
    }

    fn done(captured: Vec<u8>) -> Self {
        Self {
            captured,
            complete: true,
            broke: false,
        }
    }

    fn broken(captured: Vec<u8>) -> Self {
        Self {
            captured,
            complete: false,
            broke: true,
        }
    }
}

/// Consumes as much body as `buf` allows, in place.
fn advance_body(kind: &mut BodyKind, buf: &mut Vec<u8>) -> BodyProgress {
    let mut captured = Vec::new();
    loop {
        match kind {
            BodyKind::Length(remaining) => {
                let take = (*remaining).min(buf.len() as u64) as usize;
                captured.extend(buf.drain(..take));
                *remaining -= take as u64;
                return if *remaining == 0 {
                    BodyProgress::done(captured)
                } else {
                    BodyProgress::more(captured)
                };
            }
            BodyKind::ToClose => {
                captured.extend(buf.drain(..));
                return BodyProgress::more(captured);
            }
            BodyKind::Chunked(phase) => match phase {
                ChunkPhase::Size => {
                    let Some(line_end) = find_crlf(buf) else {
                        if buf.len() > MAX_CHUNK_LINE {
                            return BodyProgress::broken(captured);
                        }
                        return BodyProgress::more(captured);
                    };
                    let line: Vec<u8> = buf.drain(..line_end + 2).collect();
                    let Some(size) = parse_chunk_size(&line[..line_end]) else {
                        return BodyProgress::broken(captured);
                    };
                    *phase = if size == 0 {
                        ChunkPhase::Trailers
                    } else {
                        ChunkPhase::Data(size)
                    };
                }
                ChunkPhase::Data(remaining) => {
                    let take = (*remaining).min(buf.len() as u64) as usize;
                    captured.extend(buf.drain(..take));
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        *phase = ChunkPhase::DataEnd;
                    } else {
                        return BodyProgress::more(captured);
                    }
                }
                ChunkPhase::DataEnd => {
                    if buf.len() < 2 {
                        return BodyProgress::more(captured);
                    }
                    if &buf[..2] != b"\r\n" {
                        return BodyProgress::broken(captured);
                    }
                    buf.drain(..2);
                    *phase = ChunkPhase::Size;
                }
                ChunkPhase::Trailers => {
                    if buf.starts_with(b"\r\n") {
                        buf.drain(..2);
                        return BodyProgress::done(captured);
                    }
                    let Some(line_end) = find_crlf(buf) else {
                        if buf.len() > MAX_HEAD_LEN {
                            return BodyProgress::broken(captured);
                        }
                        return BodyProgress::more(captured);
                    };
                    // Trailer headers are consumed, not captured.
                    buf.drain(..line_end + 2);
                }
            },
        }
    }
}

// ─── Head Parsing ───────────────────────────────────────────────

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_head(head: &[u8], is_request: bool) -> Option<(HeadInfo, Vec<(String, String)>)> {
    let mut storage = [httparse::EMPTY_HEADER; 64];
    if is_request {
        let mut request = httparse::Request::new(&mut storage);
        if !matches!(request.parse(head), Ok(httparse::Status::Complete(_))) {
            return None;
        }
        let headers = collect_headers(request.headers);
        let host = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("host"))
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        Some((
            HeadInfo::Request {
                method: request.method?.to_string(),
                path: request.path?.to_string(),
                host,
            },
            headers,
        ))
    } else {
        let mut response = httparse::Response::new(&mut storage);
        if !matches!(response.parse(head), Ok(httparse::Status::Complete(_))) {
            return None;
        }
        let headers = collect_headers(response.headers);
        Some((
            HeadInfo::Response {
                status: response.code?,
            },
            headers,
        ))
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

/// Decides how the message body is delimited. `None` means no body at all.
fn body_kind(
    info: &HeadInfo,
    headers: &[(String, String)],
    paired_method: Option<&str>,
) -> Option<BodyKind> {
    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    if let HeadInfo::Response { status } = info {
        if *status == 204 || *status == 304 || paired_method == Some("HEAD") {
            return None;
        }
    }

    if header("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        return Some(BodyKind::Chunked(ChunkPhase::Size));
    }
    if let Some(length) = header("content-length").and_then(|v| v.trim().parse::<u64>().ok()) {
        return (length > 0).then_some(BodyKind::Length(length));
    }
    match info {
        HeadInfo::Request { .. } => None,
        HeadInfo::Response { .. } => Some(BodyKind::ToClose),
    }
}

fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let line = std::str::from_utf8(line).ok()?;
    let size = line.split(';').next()?.trim();
    u64::from_str_radix(size, 16).ok()
}

// ─── Exchange Assembly ──────────────────────────────────────────

/// Request whose parsing finished, waiting for its response.
struct OpenExchange {
    method: String,
    path: String,
    host: String,
    request: HalfCapture,
    started_at: u64,
    started_instant: Instant,
}

/// Per-connection parser pairing the two directions into exchanges.
pub struct ExchangeParser {
    tunnel_id: String,
    request_side: SideParser,
    response_side: SideParser,
    /// Completed requests not yet answered, oldest first.
    open: VecDeque<OpenExchange>,
    replay_ref: Option<String>,
}

impl ExchangeParser {
    pub fn new(tunnel_id: impl Into<String>, max_body: usize) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            request_side: SideParser::new(true, max_body),
            response_side: SideParser::new(false, max_body),
            open: VecDeque::new(),
            replay_ref: None,
        }
    }

    /// Stamps every exchange from this connection as a replay of `id`.
    pub fn with_replay_ref(mut self, id: impl Into<String>) -> Self {
        self.replay_ref = Some(id.into());
        self
    }

    /// Feeds bytes flowing external→local.
    pub fn push_request(&mut self, bytes: &[u8]) -> Vec<ExchangeDraft> {
        for message in self.request_side.feed(bytes, &[]) {
            let HeadInfo::Request { method, path, host } = message.head else {
                continue;
            };
            self.open.push_back(OpenExchange {
                method,
                path,
                host,
                request: message.capture,
                started_at: unix_millis(),
                started_instant: Instant::now(),
            });
        }
        Vec::new()
    }

    /// Feeds bytes flowing local→external. Returns exchanges completed by
    /// this chunk.
    pub fn push_response(&mut self, bytes: &[u8]) -> Vec<ExchangeDraft> {
        let paired: Vec<String> = self.open.iter().map(|o| o.method.clone()).collect();
        let messages = self.response_side.feed(bytes, &paired);
        messages
            .into_iter()
            .filter_map(|m| self.pair_response(m))
            .collect()
    }

    /// Connection closed: finalize a read-to-close response, then flush
    /// unanswered requests so their traffic is not silently lost.
    pub fn finish(&mut self) -> Vec<ExchangeDraft> {
        let mut done = Vec::new();
        if let Some(message) = self.response_side.finish() {
            done.extend(self.pair_response(message));
        }
        while let Some(open) = self.open.pop_front() {
            let mut draft = self.draft_from(open, 0, HalfCapture::default());
            draft.malformed = true;
            done.push(draft);
        }
        done
    }

    fn pair_response(&mut self, message: SideMessage) -> Option<ExchangeDraft> {
        let HeadInfo::Response { status } = message.head else {
            return None;
        };
        match self.open.pop_front() {
            Some(open) => Some(self.draft_from(open, status, message.capture)),
            // A response with no recorded request; record it malformed.
            None => {
                let open = OpenExchange {
                    method: String::new(),
                    path: String::new(),
                    host: String::new(),
                    request: HalfCapture::default(),
                    started_at: unix_millis(),
                    started_instant: Instant::now(),
                };
                let mut draft = self.draft_from(open, status, message.capture);
                draft.malformed = true;
                Some(draft)
            }
        }
    }

    fn draft_from(&self, open: OpenExchange, status: u16, response: HalfCapture) -> ExchangeDraft {
        ExchangeDraft {
            tunnel_id: self.tunnel_id.clone(),
            method: open.method,
            host: open.host,
            path: open.path,
            request_headers: open.request.headers,
            request_body: open.request.body,
            request_truncated: open.request.truncated,
            request_body_size: open.request.body_size,
            response_status: status,
            response_headers: response.headers,
            response_body: response.body,
            response_truncated: response.truncated,
            response_body_size: response.body_size,
            started_at: open.started_at,
            duration_ns: open.started_instant.elapsed().as_nanos() as u64,
            malformed: self.request_side.broke || self.response_side.broke,
            replay_ref: self.replay_ref.clone(),
        }
    }
}
