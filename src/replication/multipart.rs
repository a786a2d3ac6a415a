//! MIME multipart document reader
//!
//! Parses `multipart/*` replication responses: the first part is the
//! document JSON; each following part is one attachment body, streamed
//! into a blob-store writer that computes SHA-1 and MD5 on the fly so
//! large attachments never sit in memory.
//!
//! The reader is incremental: drive it with `feed()` from stream
//! callbacks, or hand it the whole buffer at once; the contract is
//! identical.
//!
//! Attachment association, for every `follows: true` entry of the
//! document's `_attachments`:
//! 1. a part whose `Content-Disposition` filename matches binds by name;
//! 2. else a part whose computed digest matches the metadata digest binds;
//! 3. else, when exactly one attachment and one part remain, they bind
//!    (best-effort);
//! 4. else the response is malformed.
//! A bound part's length must equal the metadata length exactly.

use serde_json::{Map, Value};
use tracing::warn;

use crate::blobstore::BlobStore;
use crate::revision::AttachmentEncoding;
use crate::storage::{PulledAttachment, PulledAttachmentContent};

use super::errors::{ReplicationError, ReplicationResult};

/// Largest part header block accepted.
const MAX_HEADER_BLOCK: usize = 64 * 1024;

/// One attachment part, sealed but not yet installed.
#[derive(Debug)]
pub struct FinishedPart {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub length: u64,
    pub md5_digest: String,
    pub sha1_digest: String,
    pub writer: crate::blobstore::BlobWriter,
}

/// A fully parsed multipart response.
#[derive(Debug)]
pub struct ParsedMultipart {
    /// The document JSON, reserved fields included.
    pub document: Map<String, Value>,
    pub parts: Vec<FinishedPart>,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Preamble,
    AfterDelimiter,
    Headers,
    Body,
    Done,
}

enum PartSink {
    Document(Vec<u8>),
    Blob {
        filename: Option<String>,
        content_type: Option<String>,
        writer: crate::blobstore::BlobWriter,
    },
}

/// Incremental multipart parser.
pub struct MultipartReader {
    store: BlobStore,
    boundary: Vec<u8>,
    buffer: Vec<u8>,
    state: State,
    part_index: usize,
    current: Option<PartSink>,
    document: Option<Vec<u8>>,
    parts: Vec<FinishedPart>,
}

impl MultipartReader {
    /// Creates a reader for a response with the given `Content-Type`,
    /// which must carry a `boundary` parameter.
    pub fn new(content_type: &str, store: BlobStore) -> ReplicationResult<Self> {
        let boundary = boundary_param(content_type).ok_or_else(|| {
            ReplicationError::Upstream(format!("no boundary in content type {content_type:?}"))
        })?;
        Ok(Self {
            store,
            boundary: boundary.into_bytes(),
            buffer: Vec::new(),
            state: State::Preamble,
            part_index: 0,
            current: None,
            document: None,
            parts: Vec::new(),
        })
    }

    /// Appends response bytes and advances the parser.
    pub fn feed(&mut self, chunk: &[u8]) -> ReplicationResult<()> {
        self.buffer.extend_from_slice(chunk);
        self.process()
    }

    /// Completes parsing; the body must have reached its closing
    /// delimiter.
    pub fn finish(mut self) -> ReplicationResult<ParsedMultipart> {
        self.process()?;
        if self.state != State::Done {
            return Err(ReplicationError::Upstream("truncated multipart body".into()));
        }
        let document_bytes = self
            .document
            .take()
            .ok_or_else(|| ReplicationError::Upstream("multipart body has no document".into()))?;
        let document: Map<String, Value> = serde_json::from_slice(&document_bytes)
            .map_err(|e| ReplicationError::Upstream(format!("bad document part: {e}")))?;
        Ok(ParsedMultipart {
            document,
            parts: self.parts,
        })
    }

    fn process(&mut self) -> ReplicationResult<()> {
        loop {
            match self.state {
                State::Preamble => {
                    let needle = self.delimiter(false);
                    match find(&self.buffer, &needle) {
                        Some(idx) => {
                            self.buffer.drain(..idx + needle.len());
                            self.state = State::AfterDelimiter;
                        }
                        None => {
                            // Preamble content is discardable; keep only a
                            // possible partial delimiter at the tail.
                            let keep = needle.len().saturating_sub(1).min(self.buffer.len());
                            let drop_len = self.buffer.len() - keep;
                            self.buffer.drain(..drop_len);
                            return Ok(());
                        }
                    }
                }
                State::AfterDelimiter => {
                    if self.buffer.len() < 2 {
                        return Ok(());
                    }
                    if self.buffer.starts_with(b"--") {
                        self.state = State::Done;
                    } else if self.buffer.starts_with(b"\r\n") {
                        self.buffer.drain(..2);
                        self.state = State::Headers;
                    } else {
                        return Err(ReplicationError::Upstream(
                            "malformed multipart delimiter".into(),
                        ));
                    }
                }
                State::Headers => {
                    match find(&self.buffer, b"\r\n\r\n") {
                        Some(idx) => {
                            let block = self.buffer[..idx].to_vec();
                            self.buffer.drain(..idx + 4);
                            self.start_part(&block)?;
                            self.state = State::Body;
                        }
                        None => {
                            if self.buffer.len() > MAX_HEADER_BLOCK {
                                return Err(ReplicationError::Upstream(
                                    "oversized part header block".into(),
                                ));
                            }
                            return Ok(());
                        }
                    }
                }
                State::Body => {
                    let needle = self.delimiter(true);
                    match find(&self.buffer, &needle) {
                        Some(idx) => {
                            let body: Vec<u8> = self.buffer[..idx].to_vec();
                            self.sink(&body)?;
                            self.buffer.drain(..idx + needle.len());
                            self.finish_part()?;
                            self.state = State::AfterDelimiter;
                        }
                        None => {
                            // Flush everything that cannot be the start of
                            // a split delimiter.
                            let keep = needle.len().saturating_sub(1).min(self.buffer.len());
                            let flush_len = self.buffer.len() - keep;
                            if flush_len > 0 {
                                let body: Vec<u8> = self.buffer[..flush_len].to_vec();
                                self.sink(&body)?;
                                self.buffer.drain(..flush_len);
                            }
                            return Ok(());
                        }
                    }
                }
                State::Done => return Ok(()),
            }
        }
    }

    fn delimiter(&self, with_crlf: bool) -> Vec<u8> {
        let mut d = Vec::with_capacity(self.boundary.len() + 4);
        if with_crlf {
            d.extend_from_slice(b"\r\n");
        }
        d.extend_from_slice(b"--");
        d.extend_from_slice(&self.boundary);
        d
    }

    fn start_part(&mut self, header_block: &[u8]) -> ReplicationResult<()> {
        let headers = parse_headers(header_block)?;
        if self.part_index == 0 {
            self.current = Some(PartSink::Document(Vec::new()));
        } else {
            let filename = headers
                .iter()
                .find(|(name, _)| name == "content-disposition")
                .and_then(|(_, value)| disposition_filename(value));
            let content_type = headers
                .iter()
                .find(|(name, _)| name == "content-type")
                .map(|(_, value)| value.clone());
            let writer = self
                .store
                .open_writer()
                .map_err(|e| ReplicationError::Upstream(format!("blob writer: {e}")))?;
            self.current = Some(PartSink::Blob {
                filename,
                content_type,
                writer,
            });
        }
        Ok(())
    }

    fn sink(&mut self, data: &[u8]) -> ReplicationResult<()> {
        match self.current.as_mut() {
            Some(PartSink::Document(buf)) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Some(PartSink::Blob { writer, .. }) => writer
                .append(data)
                .map_err(|e| ReplicationError::Upstream(format!("blob writer: {e}"))),
            None => Err(ReplicationError::Upstream(
                "multipart body outside any part".into(),
            )),
        }
    }

    fn finish_part(&mut self) -> ReplicationResult<()> {
        let sink = self.current.take().ok_or_else(|| {
            ReplicationError::Upstream("multipart delimiter outside any part".into())
        })?;
        match sink {
            PartSink::Document(buf) => {
                self.document = Some(buf);
            }
            PartSink::Blob {
                filename,
                content_type,
                mut writer,
            } => {
                writer
                    .finish()
                    .map_err(|e| ReplicationError::Upstream(format!("blob writer: {e}")))?;
                let (md5, sha1) = match (writer.md5_digest_string(), writer.sha1_digest_string()) {
                    (Some(md5), Some(sha1)) => (md5, sha1),
                    _ => {
                        return Err(ReplicationError::Upstream(
                            "blob writer missing digests".into(),
                        ))
                    }
                };
                self.parts.push(FinishedPart {
                    filename,
                    content_type,
                    length: writer.length(),
                    md5_digest: md5,
                    sha1_digest: sha1,
                    writer,
                });
            }
        }
        self.part_index += 1;
        Ok(())
    }
}

/// Builds the pulled-attachment list for a wire document, binding
/// `follows` entries to multipart parts.
pub fn associate_attachments(
    document: &Map<String, Value>,
    parts: Vec<FinishedPart>,
) -> ReplicationResult<Vec<PulledAttachment>> {
    let metas = match document.get("_attachments") {
        Some(value) => value.as_object().ok_or_else(|| {
            ReplicationError::Upstream("_attachments is not an object".into())
        })?,
        None => {
            if !parts.is_empty() {
                return Err(ReplicationError::Upstream(
                    "multipart parts without _attachments metadata".into(),
                ));
            }
            return Ok(Vec::new());
        }
    };

    let mut slots: Vec<Option<FinishedPart>> = parts.into_iter().map(Some).collect();
    let mut out = Vec::with_capacity(metas.len());
    let mut unmatched: Vec<(String, AttMeta)> = Vec::new();

    for (name, meta) in metas {
        let meta = AttMeta::parse(name, meta)?;
        if meta.stub {
            out.push(meta.into_pulled(name, PulledAttachmentContent::Stub));
        } else if let Some(data) = meta.inline_data()? {
            out.push(meta.into_pulled(name, PulledAttachmentContent::Inline(data)));
        } else if meta.follows {
            // Pass 1: bind by part filename.
            let by_name = slots.iter().position(|slot| {
                slot.as_ref()
                    .map(|p| p.filename.as_deref() == Some(name.as_str()))
                    .unwrap_or(false)
            });
            match by_name.and_then(|i| slots[i].take()) {
                Some(part) => out.push(bind(meta, name, part)?),
                None => unmatched.push((name.clone(), meta)),
            }
        } else {
            return Err(ReplicationError::Upstream(format!(
                "attachment {name:?} has neither data, stub nor follows"
            )));
        }
    }

    // Pass 2: bind by digest.
    let mut still_unmatched = Vec::new();
    for (name, meta) in unmatched {
        let by_digest = meta.digest.as_ref().and_then(|digest| {
            slots.iter().position(|slot| {
                slot.as_ref()
                    .map(|p| &p.md5_digest == digest || &p.sha1_digest == digest)
                    .unwrap_or(false)
            })
        });
        match by_digest.and_then(|i| slots[i].take()) {
            Some(part) => out.push(bind(meta, &name, part)?),
            None => still_unmatched.push((name, meta)),
        }
    }

    // Pass 3: a single leftover pair binds best-effort.
    let mut remaining: Vec<FinishedPart> = slots.into_iter().flatten().collect();
    if still_unmatched.len() == 1 && remaining.len() == 1 {
        if let (Some((name, meta)), Some(part)) = (still_unmatched.pop(), remaining.pop()) {
            warn!(attachment = %name, "binding sole remaining attachment to sole remaining part");
            out.push(bind(meta, &name, part)?);
        }
    } else if !still_unmatched.is_empty() || !remaining.is_empty() {
        return Err(ReplicationError::Upstream(format!(
            "{} attachments and {} parts left unassociated",
            still_unmatched.len(),
            remaining.len()
        )));
    }

    Ok(out)
}

fn bind(meta: AttMeta, name: &str, part: FinishedPart) -> ReplicationResult<PulledAttachment> {
    let expected = meta.on_wire_length();
    if expected != part.length {
        return Err(ReplicationError::Upstream(format!(
            "attachment {name:?} length {} does not match part length {}",
            expected, part.length
        )));
    }
    Ok(meta.into_pulled(name, PulledAttachmentContent::Streamed(part.writer)))
}

/// Decoded `_attachments` metadata entry.
struct AttMeta {
    content_type: Option<String>,
    length: u64,
    encoded_length: Option<u64>,
    encoding: AttachmentEncoding,
    revpos: u64,
    digest: Option<String>,
    stub: bool,
    follows: bool,
    data: Option<String>,
}

impl AttMeta {
    fn parse(name: &str, value: &Value) -> ReplicationResult<Self> {
        let object = value.as_object().ok_or_else(|| {
            ReplicationError::Upstream(format!("attachment {name:?} metadata is not an object"))
        })?;
        let encoding = AttachmentEncoding::from_wire(
            object.get("encoding").and_then(Value::as_str),
        )
        .map_err(|e| ReplicationError::Upstream(e.to_string()))?;
        Ok(Self {
            content_type: object
                .get("content_type")
                .and_then(Value::as_str)
                .map(str::to_string),
            length: object.get("length").and_then(Value::as_u64).unwrap_or(0),
            encoded_length: object.get("encoded_length").and_then(Value::as_u64),
            encoding,
            revpos: object.get("revpos").and_then(Value::as_u64).unwrap_or(0),
            digest: object
                .get("digest")
                .and_then(Value::as_str)
                .map(str::to_string),
            stub: object.get("stub").and_then(Value::as_bool).unwrap_or(false),
            follows: object
                .get("follows")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            data: object
                .get("data")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn inline_data(&self) -> ReplicationResult<Option<Vec<u8>>> {
        let Some(data) = &self.data else {
            return Ok(None);
        };
        let decoded = data_encoding::BASE64
            .decode(data.as_bytes())
            .or_else(|_| data_encoding::BASE64_NOPAD.decode(data.as_bytes()))
            .map_err(|e| {
                ReplicationError::Upstream(format!("bad inline attachment data: {e}"))
            })?;
        Ok(Some(decoded))
    }

    fn on_wire_length(&self) -> u64 {
        match self.encoding {
            AttachmentEncoding::None => self.length,
            AttachmentEncoding::Gzip => self.encoded_length.unwrap_or(self.length),
        }
    }

    fn into_pulled(self, name: &str, content: PulledAttachmentContent) -> PulledAttachment {
        PulledAttachment {
            name: name.to_string(),
            content_type: self.content_type,
            length: self.length,
            encoding: self.encoding,
            encoded_length: self.encoded_length,
            revpos: self.revpos,
            content,
        }
    }
}

fn boundary_param(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("boundary=") {
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

fn parse_headers(block: &[u8]) -> ReplicationResult<Vec<(String, String)>> {
    let text = std::str::from_utf8(block)
        .map_err(|_| ReplicationError::Upstream("part headers are not UTF-8".into()))?;
    let mut headers = Vec::new();
    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':').ok_or_else(|| {
            ReplicationError::Upstream(format!("malformed part header {line:?}"))
        })?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }
    Ok(headers)
}

fn disposition_filename(value: &str) -> Option<String> {
    for param in value.split(';').skip(1) {
        let param = param.trim();
        if let Some(name) = param.strip_prefix("filename=") {
            return Some(name.trim_matches('"').to_string());
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn store() -> (TempDir, BlobStore) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    fn sample_body(boundary: &str) -> Vec<u8> {
        let doc = serde_json::json!({
            "_id": "d1",
            "_rev": "1-abc",
            "title": "hello",
            "_attachments": {
                "note.txt": {
                    "content_type": "text/plain",
                    "length": 5,
                    "follows": true,
                    "revpos": 1,
                }
            }
        })
        .to_string();
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Type: application/json\r\n\r\n");
        body.extend_from_slice(doc.as_bytes());
        body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: attachment; filename=\"note.txt\"\r\n\
              Content-Type: text/plain\r\n\r\n",
        );
        body.extend_from_slice(b"hello");
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        body
    }

    #[test]
    fn test_whole_buffer_parse() {
        let (_dir, store) = store();
        let body = sample_body("BOUND");
        let mut reader =
            MultipartReader::new("multipart/related; boundary=\"BOUND\"", store).unwrap();
        reader.feed(&body).unwrap();
        let parsed = reader.finish().unwrap();

        assert_eq!(parsed.document.get("_id").unwrap(), "d1");
        assert_eq!(parsed.parts.len(), 1);
        assert_eq!(parsed.parts[0].filename.as_deref(), Some("note.txt"));
        assert_eq!(parsed.parts[0].length, 5);
    }

    #[test]
    fn test_chunked_parse_is_identical() {
        let (_dir, store) = store();
        let body = sample_body("BOUND");
        // Byte-at-a-time is the worst case for split delimiters.
        let mut reader =
            MultipartReader::new("multipart/related; boundary=BOUND", store).unwrap();
        for byte in &body {
            reader.feed(std::slice::from_ref(byte)).unwrap();
        }
        let parsed = reader.finish().unwrap();
        assert_eq!(parsed.parts.len(), 1);
        assert_eq!(parsed.parts[0].length, 5);
    }

    #[test]
    fn test_truncated_body_fails() {
        let (_dir, store) = store();
        let body = sample_body("BOUND");
        let mut reader =
            MultipartReader::new("multipart/related; boundary=BOUND", store).unwrap();
        reader.feed(&body[..body.len() / 2]).unwrap();
        assert!(matches!(
            reader.finish(),
            Err(ReplicationError::Upstream(_))
        ));
    }

    #[test]
    fn test_association_by_filename_and_length_check() {
        let (_dir, store) = store();
        let body = sample_body("BOUND");
        let mut reader =
            MultipartReader::new("multipart/related; boundary=BOUND", store).unwrap();
        reader.feed(&body).unwrap();
        let parsed = reader.finish().unwrap();

        let atts = associate_attachments(&parsed.document, parsed.parts).unwrap();
        assert_eq!(atts.len(), 1);
        assert_eq!(atts[0].name, "note.txt");
        assert!(matches!(
            atts[0].content,
            PulledAttachmentContent::Streamed(_)
        ));
    }

    #[test]
    fn test_association_length_mismatch_is_hard_error() {
        let (_dir, store) = store();
        let mut document = Map::new();
        document.insert(
            "_attachments".into(),
            serde_json::json!({
                "a.bin": {"length": 99, "follows": true}
            }),
        );
        let mut writer = store.open_writer().unwrap();
        writer.append(b"abc").unwrap();
        writer.finish().unwrap();
        let part = FinishedPart {
            filename: Some("a.bin".into()),
            content_type: None,
            length: 3,
            md5_digest: writer.md5_digest_string().unwrap(),
            sha1_digest: writer.sha1_digest_string().unwrap(),
            writer,
        };
        assert!(matches!(
            associate_attachments(&document, vec![part]),
            Err(ReplicationError::Upstream(_))
        ));
    }

    #[test]
    fn test_association_by_digest() {
        let (_dir, store) = store();
        let mut writer = store.open_writer().unwrap();
        writer.append(b"abc").unwrap();
        writer.finish().unwrap();
        let md5 = writer.md5_digest_string().unwrap();
        let part = FinishedPart {
            filename: None,
            content_type: None,
            length: 3,
            md5_digest: md5.clone(),
            sha1_digest: writer.sha1_digest_string().unwrap(),
            writer,
        };

        let mut document = Map::new();
        document.insert(
            "_attachments".into(),
            serde_json::json!({
                "a.bin": {"length": 3, "follows": true, "digest": md5}
            }),
        );
        let atts = associate_attachments(&document, vec![part]).unwrap();
        assert_eq!(atts[0].name, "a.bin");
    }

    #[test]
    fn test_association_last_pair_heuristic() {
        let (_dir, store) = store();
        let mut writer = store.open_writer().unwrap();
        writer.append(b"abcd").unwrap();
        writer.finish().unwrap();
        let part = FinishedPart {
            filename: None,
            content_type: None,
            length: 4,
            md5_digest: writer.md5_digest_string().unwrap(),
            sha1_digest: writer.sha1_digest_string().unwrap(),
            writer,
        };

        let mut document = Map::new();
        document.insert(
            "_attachments".into(),
            serde_json::json!({
                "only.bin": {"length": 4, "follows": true, "digest": "md5-nope"}
            }),
        );
        let atts = associate_attachments(&document, vec![part]).unwrap();
        assert_eq!(atts[0].name, "only.bin");
    }

    #[test]
    fn test_inline_and_stub_attachments() {
        let mut document = Map::new();
        document.insert(
            "_attachments".into(),
            serde_json::json!({
                "inline.txt": {"content_type": "text/plain", "revpos": 2,
                                "data": "aGVsbG8="},
                "old.txt": {"length": 9, "stub": true, "revpos": 1},
            }),
        );
        let atts = associate_attachments(&document, Vec::new()).unwrap();
        assert_eq!(atts.len(), 2);
        let inline = atts.iter().find(|a| a.name == "inline.txt").unwrap();
        match &inline.content {
            PulledAttachmentContent::Inline(data) => assert_eq!(data, b"hello"),
            other => panic!("expected inline content, got {other:?}"),
        }
        let stub = atts.iter().find(|a| a.name == "old.txt").unwrap();
        assert!(matches!(stub.content, PulledAttachmentContent::Stub));
    }
}
