//! HTTP/1.0 exchange over a unix socket
//!
//! Backends bound to a unix socket are driven by hand: the request line,
//! headers and body are written to the raw stream, then the reader loops over
//! status lines, discarding interim `1xx` responses, until a final response
//! arrives whose body is read according to its framing.

use crate::error::ProxyError;
use crate::proxy::canonical_header_name;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::{HeaderMap, Method, StatusCode};
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

/// Longest status, header or chunk-size line accepted from a backend
const MAX_LINE_LEN: u64 = 16 * 1024;
/// Most header lines accepted in one response head
const MAX_HEADERS: usize = 128;

/// A final response read from a unix socket backend
#[derive(Debug)]
pub struct UnixResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Where the reader is within the response
enum ReadState {
    StatusLine,
    Headers(StatusCode),
    Body(StatusCode, HeaderMap),
}

/// Perform one request against the backend listening on `socket`.
///
/// A body without a `Content-Length` header is buffered so its length can be
/// declared; HTTP/1.0 has no other way to delimit it.
pub async fn send(
    socket: &Path,
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Option<BoxBody<Bytes, hyper::Error>>,
) -> Result<UnixResponse, ProxyError> {
    let stream = UnixStream::connect(socket).await?;
    let (read_half, mut write_half) = stream.into_split();

    write_request(&mut write_half, method, path_and_query, headers, body).await?;

    let mut reader = BufReader::new(read_half);
    read_response(&mut reader, method).await
}

async fn write_request<W>(
    writer: &mut W,
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Option<BoxBody<Bytes, hyper::Error>>,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let (streamed, buffered) = match body {
        Some(body) if headers.contains_key(CONTENT_LENGTH) => (Some(body), None),
        Some(body) => (None, Some(body.collect().await?.to_bytes())),
        None => (None, None),
    };

    let mut head = Vec::with_capacity(512);
    head.extend_from_slice(format!("{} {} HTTP/1.0\r\n", method, path_and_query).as_bytes());
    for (name, value) in headers {
        if name == CONNECTION {
            continue;
        }
        head.extend_from_slice(canonical_header_name(name.as_str()).as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    if let Some(ref bytes) = buffered {
        head.extend_from_slice(format!("Content-Length: {}\r\n", bytes.len()).as_bytes());
    }
    head.extend_from_slice(b"Connection: close\r\n\r\n");
    writer.write_all(&head).await?;

    if let Some(bytes) = buffered {
        writer.write_all(&bytes).await?;
    }
    if let Some(mut body) = streamed {
        while let Some(frame) = body.frame().await {
            if let Ok(data) = frame?.into_data() {
                writer.write_all(&data).await?;
            }
        }
    }

    writer.flush().await?;
    Ok(())
}

/// Read status lines until a final response, then its headers and body
pub(crate) async fn read_response<R>(reader: &mut R, method: &Method) -> Result<UnixResponse, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut state = ReadState::StatusLine;
    loop {
        state = match state {
            ReadState::StatusLine => {
                let line = read_line(reader)
                    .await?
                    .ok_or_else(|| malformed("connection closed before status line"))?;
                if line.is_empty() {
                    ReadState::StatusLine
                } else {
                    ReadState::Headers(parse_status_line(&line)?)
                }
            }
            ReadState::Headers(status) => {
                let headers = read_headers(reader).await?;
                if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
                    debug!(status = status.as_u16(), "Discarding interim response");
                    ReadState::StatusLine
                } else {
                    ReadState::Body(status, headers)
                }
            }
            ReadState::Body(status, headers) => {
                let body = if response_permits_body(method, status) {
                    read_body(reader, &headers).await?
                } else {
                    Bytes::new()
                };
                return Ok(UnixResponse {
                    status,
                    headers,
                    body,
                });
            }
        };
    }
}

/// HEAD responses and 1xx/204/304 never carry a body
pub fn response_permits_body(method: &Method, status: StatusCode) -> bool {
    !(method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

fn parse_status_line(line: &[u8]) -> Result<StatusCode, ProxyError> {
    let line = std::str::from_utf8(line).map_err(|_| malformed("status line is not UTF-8"))?;
    let mut parts = line.splitn(3, ' ');

    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(malformed(format!("invalid status line {:?}", line)));
    }

    let code = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| malformed(format!("invalid status line {:?}", line)))?;

    StatusCode::from_u16(code).map_err(|_| malformed(format!("invalid status code {}", code)))
}

async fn read_headers<R>(reader: &mut R) -> Result<HeaderMap, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();
    loop {
        let line = read_line(reader)
            .await?
            .ok_or_else(|| malformed("connection closed inside headers"))?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(malformed("too many headers"));
        }

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| malformed("header line without colon"))?;
        let name = HeaderName::from_bytes(trim(&line[..colon]))
            .map_err(|e| malformed(format!("invalid header name: {}", e)))?;
        let value = HeaderValue::from_bytes(trim(&line[colon + 1..]))
            .map_err(|e| malformed(format!("invalid header value: {}", e)))?;
        headers.append(name, value);
    }
}

async fn read_body<R>(reader: &mut R, headers: &HeaderMap) -> Result<Bytes, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    if is_chunked(headers) {
        return read_chunked(reader).await;
    }

    if let Some(value) = headers.get(CONTENT_LENGTH) {
        let length: u64 = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| malformed("invalid Content-Length"))?;
        return read_exact(reader, length).await;
    }

    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;
    Ok(Bytes::from(body))
}

async fn read_chunked<R>(reader: &mut R) -> Result<Bytes, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let line = read_line(reader)
            .await?
            .ok_or_else(|| malformed("connection closed inside chunked body"))?;
        let size = chunk_size(&line)?;

        if size == 0 {
            // Trailers are read and dropped
            while let Some(trailer) = read_line(reader).await? {
                if trailer.is_empty() {
                    break;
                }
            }
            return Ok(Bytes::from(body));
        }

        body.extend_from_slice(&read_exact(reader, size).await?);
        match read_line(reader).await? {
            Some(ref end) if end.is_empty() => {}
            _ => return Err(malformed("chunk not terminated by CRLF")),
        }
    }
}

fn chunk_size(line: &[u8]) -> Result<u64, ProxyError> {
    let line = std::str::from_utf8(line).map_err(|_| malformed("chunk size is not UTF-8"))?;
    let size = line.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16).map_err(|_| malformed(format!("invalid chunk size {:?}", size)))
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

async fn read_exact<R>(reader: &mut R, length: u64) -> Result<Bytes, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(length.min(64 * 1024) as usize);
    (&mut *reader).take(length).read_to_end(&mut buf).await?;
    if (buf.len() as u64) < length {
        return Err(malformed(format!(
            "body truncated ({} of {} bytes)",
            buf.len(),
            length
        )));
    }
    Ok(Bytes::from(buf))
}

/// Read one CRLF- or LF-terminated line without its terminator. `None` at EOF.
async fn read_line<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        return Err(malformed("line too long or truncated"));
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn malformed(message: impl Into<String>) -> ProxyError {
    ProxyError::MalformedResponse(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use tokio::net::UnixListener;

    async fn parse(raw: &[u8], method: Method) -> Result<UnixResponse, ProxyError> {
        let mut reader = raw;
        read_response(&mut reader, &method).await
    }

    fn full(body: &'static str) -> BoxBody<Bytes, hyper::Error> {
        Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed()
    }

    /// Accept one connection, capture the request, write `response` and close
    async fn one_shot_server(listener: UnixListener, response: &'static [u8]) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        stream.write_all(response).await.unwrap();
        stream.shutdown().await.unwrap();
        String::from_utf8(request).unwrap()
    }

    #[tokio::test]
    async fn test_content_length_body() {
        let response = parse(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhelloEXTRA",
            Method::GET,
        )
        .await
        .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get("content-type").unwrap(), "text/plain");
        assert_eq!(&response.body[..], b"hello");
    }

    #[tokio::test]
    async fn test_interim_continue_is_discarded() {
        let response = parse(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 100 Continue\r\nX-Interim: yes\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok",
            Method::POST,
        )
        .await
        .unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
        assert!(response.headers.get("x-interim").is_none());
        assert_eq!(&response.body[..], b"ok");
    }

    #[tokio::test]
    async fn test_chunked_body() {
        let response = parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: t\r\n\r\n",
            Method::GET,
        )
        .await
        .unwrap();

        assert_eq!(&response.body[..], b"Wikipedia");
        assert_eq!(response.headers.get("transfer-encoding").unwrap(), "chunked");
    }

    #[tokio::test]
    async fn test_body_until_eof() {
        let response = parse(b"HTTP/1.0 200 OK\nServer: old\n\nall of it", Method::GET)
            .await
            .unwrap();
        assert_eq!(&response.body[..], b"all of it");
    }

    #[tokio::test]
    async fn test_head_and_no_content_have_no_body() {
        let head = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n", Method::HEAD)
            .await
            .unwrap();
        assert!(head.body.is_empty());
        assert_eq!(head.headers.get("content-length").unwrap(), "42");

        let no_content = parse(b"HTTP/1.1 204 No Content\r\n\r\n", Method::DELETE)
            .await
            .unwrap();
        assert_eq!(no_content.status, StatusCode::NO_CONTENT);
        assert!(no_content.body.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_headers_are_kept() {
        let response = parse(
            b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nContent-Length: 0\r\n\r\n",
            Method::GET,
        )
        .await
        .unwrap();
        let cookies: Vec<_> = response.headers.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[tokio::test]
    async fn test_malformed_responses() {
        let cases: [&[u8]; 6] = [
            b"",
            b"SPDY/3 200 OK\r\n\r\n",
            b"HTTP/1.1 abc OK\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nno colon here\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort",
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",
        ];
        for raw in cases {
            let err = parse(raw, Method::GET).await.unwrap_err();
            assert!(
                matches!(err, ProxyError::MalformedResponse(_)),
                "{:?} gave {:?}",
                String::from_utf8_lossy(raw),
                err
            );
        }
    }

    #[test]
    fn test_response_permits_body() {
        assert!(response_permits_body(&Method::GET, StatusCode::OK));
        assert!(!response_permits_body(&Method::HEAD, StatusCode::OK));
        assert!(!response_permits_body(&Method::GET, StatusCode::NOT_MODIFIED));
        assert!(!response_permits_body(&Method::GET, StatusCode::CONTINUE));
    }

    #[tokio::test]
    async fn test_send_writes_http10_request() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("blog.dev");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(one_shot_server(
            listener,
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone",
        ));

        let mut headers = HeaderMap::new();
        headers.insert("x-custom", HeaderValue::from_static("v1"));
        headers.insert("content-length", HeaderValue::from_static("5"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));

        let response = send(&socket, &Method::POST, "/submit?x=1", &headers, Some(full("hello")))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"done");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /submit?x=1 HTTP/1.0\r\n"), "{}", request);
        assert!(request.contains("X-Custom: v1\r\n"));
        assert!(request.contains("Content-Length: 5\r\n"));
        assert!(request.contains("Connection: close\r\n"));
        assert!(!request.contains("keep-alive"));
        assert!(request.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn test_send_buffers_body_without_length() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.dev");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(one_shot_server(
            listener,
            b"HTTP/1.1 204 No Content\r\n\r\n",
        ));

        let response = send(&socket, &Method::PUT, "/", &HeaderMap::new(), Some(full("abc")))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);

        let request = server.await.unwrap();
        assert!(request.contains("Content-Length: 3\r\n"), "{}", request);
        assert!(request.ends_with("abc"));
    }

    #[tokio::test]
    async fn test_send_to_missing_socket_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = send(
            &dir.path().join("nobody.dev"),
            &Method::GET,
            "/",
            &HeaderMap::new(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::Io(_)), "got {:?}", err);
    }
}
