//! `multipart/x-mixed-replace` (MJPEG over HTTP) body splitting.
//!
//! IP cameras serve live video as one endless response whose parts are
//! whole JPEG images:
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: 5321\r\n      (optional)
//! \r\n
//! <jpeg bytes>\r\n
//! --frame\r\n
//! ...
//! ```
//!
//! With `Content-Length` a part is complete as soon as its bytes arrive;
//! without it the part ends at the next delimiter.

const MULTIPART_MIME: &str = "multipart/x-mixed-replace";

/// Boundary of a `multipart/x-mixed-replace` content type, `None` for any
/// other type.
pub fn stream_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.eq_ignore_ascii_case(MULTIPART_MIME) {
        return None;
    }
    params
        .find_map(|param| {
            let (name, value) = param.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("boundary")
                .then(|| value.trim().trim_matches('"').to_string())
        })
        .filter(|boundary| !boundary.is_empty())
}

/// Incremental splitter: feed body chunks with [`push`](Self::push), take
/// finished part payloads with [`next_part`](Self::next_part).
#[derive(Debug)]
pub struct MultipartSplitter {
    delimiter: Vec<u8>,
    buf: Vec<u8>,
}

impl MultipartSplitter {
    pub fn new(boundary: &str) -> Self {
        Self {
            delimiter: format!("--{boundary}").into_bytes(),
            buf: Vec::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes held waiting for a part to complete.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Payload of the next complete part, if one is buffered.
    pub fn next_part(&mut self) -> Option<Vec<u8>> {
        let start = find(&self.buf, &self.delimiter)?;
        let headers_at = start + self.delimiter.len();
        let header_end = headers_at + find(&self.buf[headers_at..], b"\r\n\r\n")?;
        let body_at = header_end + 4;

        let body_end = match content_length(&self.buf[headers_at..header_end]) {
            Some(len) if self.buf.len() >= body_at + len => body_at + len,
            Some(_) => return None,
            None => {
                let next = body_at + find(&self.buf[body_at..], &self.delimiter)?;
                if self.buf[body_at..next].ends_with(b"\r\n") {
                    next - 2
                } else {
                    next
                }
            }
        };

        let part = self.buf[body_at..body_end].to_vec();
        self.buf.drain(..body_end);
        Some(part)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn content_length(headers: &[u8]) -> Option<usize> {
    std::str::from_utf8(headers)
        .ok()?
        .split("\r\n")
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
}
