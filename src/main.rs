use std::cmp::min;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;

use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use nix::errno::Errno;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::socket::{
    self, sockopt, AddressFamily, InetAddr, Shutdown, SockAddr, SockFlag, SockProtocol, SockType,
    UnixAddr,
};
use nix::sys::stat::{stat, FileStat};
use nix::sys::time::TimeVal;
use nix::unistd::{
    chdir, chroot, close, fork, getgid, getuid, read, setgid, setgroups, setuid, write, ForkResult,
    Group, User,
};


/// Largest request header block we accept, in bytes.
const HEADER_MAX: usize = 4096;
/// Largest decoded request target, including the terminator slot.
const PATH_MAX: usize = 4096;
/// Largest value of a recognized request field, including the terminator slot.
const FIELD_MAX: usize = 200;
/// Chunk size for streaming file bodies.
const BUF_SIZE: usize = 8192;
/// Per-connection receive and send timeout.
const TIMEOUT_SECS: libc::time_t = 30;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Extension to content-type map. Matching is case-sensitive and the first
/// match wins.
const DEFAULT_MIMES: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("txt", "text/plain"),
    ("asc", "text/plain"),
    ("xml", "application/xml"),
    ("xsl", "application/xml"),
    ("dtd", "application/xml-dtd"),
    ("xslt", "application/xslt+xml"),
    ("gif", "image/gif"),
    ("jpeg", "image/jpeg"),
    ("jpe", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("png", "image/png"),
    ("svg", "image/svg+xml"),
    ("pdf", "application/pdf"),
    ("wasm", "application/wasm"),
    ("zip", "application/zip"),
    ("ogg", "application/ogg"),
    ("mp2", "audio/mpeg"),
    ("mp3", "audio/mpeg"),
    ("mpga", "audio/mpeg"),
    ("mpeg", "video/mpeg"),
    ("mpe", "video/mpeg"),
    ("mpg", "video/mpeg"),
    ("mp4", "video/mp4"),
    ("qt", "video/quicktime"),
    ("mov", "video/quicktime"),
    ("avi", "video/x-msvideo"),
];

/// Every status code this server can emit, with its canonical reason phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok = 200,
    PartialContent = 206,
    MovedPermanently = 301,
    NotModified = 304,
    BadRequest = 400,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    RequestTimeout = 408,
    RequestTooLarge = 431,
    InternalServerError = 500,
    VersionNotSupported = 505,
}

impl Status {
    fn code(self) -> u16 {
        self as u16
    }
    fn phrase(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::PartialContent => "Partial Content",
            Status::MovedPermanently => "Moved Permanently",
            Status::NotModified => "Not Modified",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::RequestTimeout => "Request Time-out",
            Status::RequestTooLarge => "Request Header Fields Too Large",
            Status::InternalServerError => "Internal Server Error",
            Status::VersionNotSupported => "HTTP Version not supported",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.phrase())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Head,
}

const METHODS: &[(&str, Method)] = &[("GET", Method::Get), ("HEAD", Method::Head)];

/// Request fields the server recognizes. Everything else is skipped.
#[derive(Debug, Clone, Copy)]
enum Field {
    Range = 0,
    IfModifiedSince = 1,
}

const NUM_FIELDS: usize = 2;

const FIELDS: &[(&str, Field)] = &[
    ("Range", Field::Range),
    ("If-Modified-Since", Field::IfModifiedSince),
];

#[derive(Debug)]
struct Request {
    method: Method,
    target: String,
    fields: [String; NUM_FIELDS],
}

impl Request {
    /// Value of a recognized field, empty when the field was absent.
    fn field(&self, field: Field) -> &str {
        &self.fields[field as usize]
    }
}

/// Process-wide configuration, fixed at startup and passed by reference to
/// every component. The defaults take the place of a compile-time config
/// header.
#[derive(Debug)]
struct Config {
    host: String,
    port: String,
    udsname: Option<String>,
    servedir: String,
    user: Option<String>,
    group: Option<String>,
    docindex: String,
    listdirs: bool,
    mimes: &'static [(&'static str, &'static str)],
    maxnprocs: u64,
}

impl Config {
    fn new() -> Self {
        Self {
            host: String::from("0.0.0.0"),
            port: String::from("80"),
            udsname: None,
            servedir: String::from("."),
            user: None,
            group: None,
            docindex: String::from("index.html"),
            listdirs: true,
            mimes: DEFAULT_MIMES,
            maxnprocs: 512,
        }
    }
}

/// RFC 1123 formatted date.
struct HttpDate(libc::time_t);

impl fmt::Display for HttpDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = Utc.timestamp(self.0, 0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// ISO 8601 formatted date for the request log.
struct LogDate(libc::time_t);

impl fmt::Display for LogDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = Utc.timestamp(self.0, 0);
        write!(f, "{}", datetime.format("%Y-%m-%dT%H:%M:%S"))
    }
}

/// Decode a request target: `+` becomes space, `%HH` (any case) becomes the
/// byte it names. Malformed escapes are copied verbatim.
fn url_decode(src: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        let c = src[i];
        if c == b'+' {
            decoded.push(b' ');
            i += 1;
        } else if c == b'%'
            && i + 2 < src.len()
            && src[i + 1].is_ascii_hexdigit()
            && src[i + 2].is_ascii_hexdigit()
        {
            decoded.push(hex_to_digit(src[i + 1]) * 16 + hex_to_digit(src[i + 2]));
            i += 3;
        } else {
            decoded.push(c);
            i += 1;
        }
    }
    decoded
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if hex >= b'A' && hex <= b'F' {
        hex - b'A' + 10
    } else if hex >= b'a' && hex <= b'f' {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

/// Encode a path for the Location header: control and non-ASCII bytes become
/// `%XX`, everything else (slashes and reserved characters included) is
/// copied verbatim. This is not general URL-encoding.
struct LocationEncoded<'a>(&'a str);

impl<'a> fmt::Display for LocationEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0.as_bytes() {
            if b < 0x20 || b > 0x7f {
                write!(f, "%{:02X}", b)?;
            } else {
                write!(f, "{}", b as char)?;
            }
        }
        Ok(())
    }
}

/// Collapse empty, `.`, and `..` components of an absolute path.
///
/// Returns None if the path does not start with a slash. A `..` component
/// pops the previously retained component; at the root it is dropped on its
/// own. The result starts with `/` and contains no `//`, `/./`, or `/../`;
/// a trailing slash is dropped.
fn normalize_path(path: &str) -> Option<String> {
    if !path.starts_with('/') {
        return None;
    }

    let mut kept: Vec<&str> = Vec::new();
    for component in path[1..].split('/') {
        match component {
            "" | "." => {}
            ".." => {
                kept.pop();
            }
            _ => kept.push(component),
        }
    }

    Some(format!("/{}", kept.join("/")))
}

/// Map a filename suffix to a content type.
fn content_type(mimes: &[(&'static str, &'static str)], path: &str) -> &'static str {
    let ext = match path.rfind('.') {
        Some(i) => &path[i + 1..],
        None => return DEFAULT_MIME_TYPE,
    };
    mimes
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, t)| *t)
        .unwrap_or(DEFAULT_MIME_TYPE)
}

/// Return index of first occurrence of `needle` in `haystack`.
fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    for i in 0..haystack.len() {
        if haystack[i..].starts_with(needle) {
            return Some(i);
        }
    }
    None
}

/// Write an entire buffer to the socket, retrying short writes.
fn send(fd: RawFd, mut buf: &[u8]) -> nix::Result<()> {
    while !buf.is_empty() {
        let sent = write(fd, buf)?;
        if sent == 0 {
            return Err(nix::Error::Sys(Errno::EPIPE));
        }
        buf = &buf[sent..];
    }
    Ok(())
}

/// Emit a status line and a minimal HTML body for any status code.
///
/// Returns the status for logging, or 408 if the write failed.
fn send_status(fd: RawFd, status: Status) -> Status {
    let allow = if status == Status::MethodNotAllowed {
        "Allow: HEAD, GET\r\n"
    } else {
        ""
    };
    let response = format!(
        "HTTP/1.1 {}\r\n\
        Date: {}\r\n\
        Connection: close\r\n\
        {}\
        Content-Type: text/html\r\n\
        \r\n\
        <!DOCTYPE html>\n<html>\n\t<head>\n\t\t<title>{}</title>\n\t</head>\n\
        \t<body>\n\t\t<h1>{}</h1>\n\t</body>\n</html>\n",
        status,
        HttpDate(Utc::now().timestamp()),
        allow,
        status,
        status,
    );
    match send(fd, response.as_bytes()) {
        Ok(()) => status,
        Err(_) => Status::RequestTimeout,
    }
}

/// Read and parse one request from the socket.
///
/// On failure the returned status is the one the caller should emit.
fn get_request(fd: RawFd) -> std::result::Result<Request, Status> {
    let mut header = [0; HEADER_MAX];
    let mut len = 0;

    // receive the header block
    loop {
        let received = match read(fd, &mut header[len..]) {
            Ok(0) => return Err(Status::BadRequest),
            Ok(received) => received,
            Err(_) => return Err(Status::RequestTimeout),
        };
        len += received;
        if header[..len].ends_with(b"\r\n\r\n") {
            break;
        }
        if len == HEADER_MAX {
            return Err(Status::RequestTooLarge);
        }
    }

    // drop the terminating empty line, leaving a CRLF after every field
    let header = &header[..len - 2];

    // METHOD, longest match first
    let (method_name, method) = METHODS
        .iter()
        .filter(|(name, _)| header.starts_with(name.as_bytes()))
        .max_by_key(|(name, _)| name.len())
        .ok_or(Status::MethodNotAllowed)?;
    let mut pos = method_name.len();

    // a single space must follow the method
    if header.get(pos) != Some(&b' ') {
        return Err(Status::BadRequest);
    }
    pos += 1;

    // TARGET
    let target_end = pos + find(b" ", &header[pos..]).ok_or(Status::BadRequest)?;
    let target_raw = &header[pos..target_end];
    if target_raw.len() + 1 > PATH_MAX {
        return Err(Status::RequestTooLarge);
    }
    let decoded = url_decode(target_raw);
    if decoded.contains(&0) {
        return Err(Status::BadRequest);
    }
    let target = String::from_utf8(decoded).map_err(|_| Status::BadRequest)?;
    pos = target_end + 1;

    // HTTP-VERSION
    if !header[pos..].starts_with(b"HTTP/") {
        return Err(Status::BadRequest);
    }
    pos += 5;
    if !header[pos..].starts_with(b"1.0") && !header[pos..].starts_with(b"1.1") {
        return Err(Status::VersionNotSupported);
    }
    pos += 3;
    if !header[pos..].starts_with(b"\r\n") {
        return Err(Status::BadRequest);
    }
    pos += 2;

    // request fields, later duplicates overwriting earlier ones
    let mut fields: [String; NUM_FIELDS] = Default::default();
    while pos < header.len() {
        let matched = FIELDS
            .iter()
            .filter(|(name, _)| header[pos..].starts_with(name.as_bytes()))
            .max_by_key(|(name, _)| name.len());
        let (name, field) = match matched {
            Some(&(name, field)) => (name, field),
            None => {
                // unmatched field, skip this line
                pos += find(b"\r\n", &header[pos..]).ok_or(Status::BadRequest)? + 2;
                continue;
            }
        };
        pos += name.len();

        // a single colon must follow the field name
        if header.get(pos) != Some(&b':') {
            return Err(Status::BadRequest);
        }
        pos += 1;

        // skip whitespace
        while header.get(pos) == Some(&b' ') {
            pos += 1;
        }

        // extract field content
        let value_end = pos + find(b"\r\n", &header[pos..]).ok_or(Status::BadRequest)?;
        let value = &header[pos..value_end];
        if value.len() + 1 > FIELD_MAX {
            return Err(Status::RequestTooLarge);
        }
        fields[field as usize] = String::from_utf8_lossy(value).into_owned();
        pos = value_end + 2;
    }

    Ok(Request {
        method: *method,
        target,
        fields,
    })
}

/// Parse a `bytes=lower-upper` range field against a file size.
///
/// Either bound may be empty. The given upper bound is inclusive; the
/// returned one is exclusive and clamped to the file size.
fn parse_range(
    field: &str,
    size: libc::off_t,
) -> std::result::Result<(libc::off_t, libc::off_t, bool), Status> {
    if field.is_empty() {
        return Ok((0, size, false));
    }

    let bounds = field.strip_prefix("bytes=").ok_or(Status::BadRequest)?;
    let mut parts = bounds.splitn(2, '-');
    let left = parts.next().unwrap_or("");
    let right = parts.next().ok_or(Status::BadRequest)?;

    let lower = if left.is_empty() { 0 } else { parse_bound(left)? };
    let upper = if right.is_empty() {
        size
    } else {
        parse_bound(right)?
            .checked_add(1)
            .ok_or(Status::BadRequest)?
    };

    if lower > upper {
        return Err(Status::BadRequest);
    }

    Ok((lower, min(size, upper), true))
}

/// Strictly parse one range bound. Overflow or trailing junk is an error.
fn parse_bound(s: &str) -> std::result::Result<libc::off_t, Status> {
    s.parse::<libc::off_t>()
        .ok()
        .filter(|&n| n >= 0)
        .ok_or(Status::BadRequest)
}

/// Marker appended to a listing entry name, like `ls -F`.
fn type_suffix(file_type: std::fs::FileType) -> &'static str {
    use std::os::unix::fs::FileTypeExt;

    if file_type.is_dir() {
        "/"
    } else if file_type.is_fifo() {
        "|"
    } else if file_type.is_symlink() {
        "@"
    } else if file_type.is_socket() {
        "="
    } else {
        ""
    }
}

/// Render a sorted HTML listing for a directory target.
fn send_dir(fd: RawFd, name: &str, request: &Request) -> Status {
    let mut entries: Vec<_> = match std::fs::read_dir(name) {
        Ok(entries) => entries.filter_map(|entry| entry.ok()).collect(),
        Err(_) => return send_status(fd, Status::Forbidden),
    };

    // directories first, then byte-wise by name
    entries.sort_by_key(|entry| {
        let is_dir = entry
            .file_type()
            .map(|file_type| file_type.is_dir())
            .unwrap_or(false);
        (!is_dir, entry.file_name())
    });

    // send header as late as possible
    let header = format!(
        "HTTP/1.1 {}\r\n\
        Date: {}\r\n\
        Connection: close\r\n\
        Content-Type: text/html\r\n\
        \r\n",
        Status::Ok,
        HttpDate(Utc::now().timestamp()),
    );
    if send(fd, header.as_bytes()).is_err() {
        return Status::RequestTimeout;
    }

    if request.method == Method::Get {
        let mut body = format!(
            "<!DOCTYPE html>\n<html>\n\t<head>\
            <title>Index of {}</title></head>\n\
            \t<body>\n\t\t<a href=\"..\">..</a>",
            name
        );
        for entry in &entries {
            let entry_name = entry.file_name();
            let entry_name = entry_name.to_string_lossy();

            // skip hidden files
            if entry_name.starts_with('.') {
                continue;
            }

            // skip entries whose type can no longer be determined
            let suffix = match entry.file_type() {
                Ok(file_type) => type_suffix(file_type),
                Err(_) => continue,
            };
            body.push_str(&format!(
                "<br />\n\t\t<a href=\"{0}\">{0}{1}</a>",
                entry_name, suffix
            ));
        }
        body.push_str("\n\t</body>\n</html>\n");

        if send(fd, body.as_bytes()).is_err() {
            return Status::RequestTimeout;
        }
    }

    Status::Ok
}

/// Stream a file with response headers, honoring HEAD and range bounds.
///
/// `upper` is exclusive; the body is exactly `upper - lower` bytes.
fn send_file(
    fd: RawFd,
    name: &str,
    request: &Request,
    st: &FileStat,
    mime: &str,
    lower: libc::off_t,
    upper: libc::off_t,
    ranged: bool,
) -> Status {
    let mut file = match File::open(name) {
        Ok(file) => file,
        Err(_) => return send_status(fd, Status::Forbidden),
    };

    if file.seek(SeekFrom::Start(lower as u64)).is_err() {
        return send_status(fd, Status::InternalServerError);
    }

    let status = if ranged {
        Status::PartialContent
    } else {
        Status::Ok
    };
    let mut header = format!(
        "HTTP/1.1 {}\r\n\
        Date: {}\r\n\
        Connection: close\r\n\
        Last-Modified: {}\r\n\
        Content-Type: {}\r\n\
        Content-Length: {}\r\n",
        status,
        HttpDate(Utc::now().timestamp()),
        HttpDate(st.st_mtime),
        mime,
        upper - lower,
    );
    if ranged {
        header.push_str(&format!(
            "Content-Range: bytes {}-{}/{}\r\n",
            lower,
            upper - 1,
            st.st_size
        ));
    }
    header.push_str("\r\n");
    if send(fd, header.as_bytes()).is_err() {
        return Status::RequestTimeout;
    }

    if request.method == Method::Get {
        // headers are flushed, failures from here on cannot be reported
        let mut remaining = upper - lower;
        let mut buf = [0; BUF_SIZE];
        while remaining > 0 {
            let want = min(BUF_SIZE as libc::off_t, remaining) as usize;
            let bread = match file.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(bread) => bread,
                Err(_) => return Status::InternalServerError,
            };
            remaining -= bread as libc::off_t;
            if send(fd, &buf[..bread]).is_err() {
                return Status::RequestTimeout;
            }
        }
    }

    status
}

/// Generate and send the response for a parsed request.
fn send_response(fd: RawFd, config: &Config, request: &Request) -> Status {
    // normalize the target
    let mut realtarget = match normalize_path(&request.target) {
        Some(path) => path,
        None => return send_status(fd, Status::BadRequest),
    };

    // reject hidden targets
    if realtarget.starts_with('.') || realtarget.contains("/.") {
        return send_status(fd, Status::Forbidden);
    }

    // stat the target
    let mut st = match stat(realtarget.as_str()) {
        Ok(st) => st,
        Err(e) => {
            let status = if e.as_errno() == Some(Errno::EACCES) {
                Status::Forbidden
            } else {
                Status::NotFound
            };
            return send_status(fd, status);
        }
    };

    // add / to directory targets if not present
    let is_dir = (st.st_mode & libc::S_IFMT) == libc::S_IFDIR;
    if is_dir && !realtarget.ends_with('/') {
        if realtarget.len() >= PATH_MAX - 2 {
            return send_status(fd, Status::RequestTooLarge);
        }
        realtarget.push('/');
    }

    // redirect if the canonical target differs
    if realtarget != request.target {
        let response = format!(
            "HTTP/1.1 {}\r\n\
            Date: {}\r\n\
            Connection: close\r\n\
            Location: {}\r\n\
            \r\n",
            Status::MovedPermanently,
            HttpDate(Utc::now().timestamp()),
            LocationEncoded(&realtarget),
        );
        return match send(fd, response.as_bytes()) {
            Ok(()) => Status::MovedPermanently,
            Err(_) => Status::RequestTimeout,
        };
    }

    if is_dir {
        // serve the directory index when it is a regular file
        if realtarget.len() + config.docindex.len() >= PATH_MAX {
            return send_status(fd, Status::RequestTooLarge);
        }
        let index = format!("{}{}", realtarget, config.docindex);
        match stat(index.as_str()) {
            Ok(index_st) if (index_st.st_mode & libc::S_IFMT) == libc::S_IFREG => {
                st = index_st;
                realtarget = index;
            }
            result => {
                if config.listdirs {
                    return send_dir(fd, &realtarget, request);
                }
                let status = match result {
                    // exists, but is not a regular file
                    Ok(_) => Status::Forbidden,
                    Err(e) if e.as_errno() == Some(Errno::EACCES) => Status::Forbidden,
                    Err(_) => Status::NotFound,
                };
                return send_status(fd, status);
            }
        }
    }

    // modified since
    let modified_since = request.field(Field::IfModifiedSince);
    if !modified_since.is_empty() {
        let since = match Utc.datetime_from_str(modified_since, "%a, %d %b %Y %H:%M:%S GMT") {
            Ok(datetime) => datetime.timestamp(),
            Err(_) => return send_status(fd, Status::BadRequest),
        };
        if st.st_mtime <= since {
            let response = format!(
                "HTTP/1.1 {}\r\n\
                Date: {}\r\n\
                Connection: close\r\n\
                \r\n",
                Status::NotModified,
                HttpDate(Utc::now().timestamp()),
            );
            return match send(fd, response.as_bytes()) {
                Ok(()) => Status::NotModified,
                Err(_) => Status::RequestTimeout,
            };
        }
    }

    // range
    let (lower, upper, ranged) = match parse_range(request.field(Field::Range), st.st_size) {
        Ok(range) => range,
        Err(status) => return send_status(fd, status),
    };

    let mime = content_type(config.mimes, &realtarget);

    send_file(fd, &realtarget, request, &st, mime, lower, upper, ranged)
}

/// Handle one accepted connection in a forked worker, then exit.
fn handle_connection(config: &Config, infd: RawFd, peer: &str) -> ! {
    // set connection timeouts
    let timeout = TimeVal::from(libc::timeval {
        tv_sec: TIMEOUT_SECS,
        tv_usec: 0,
    });
    if socket::setsockopt(infd, sockopt::ReceiveTimeout, &timeout).is_err()
        || socket::setsockopt(infd, sockopt::SendTimeout, &timeout).is_err()
    {
        eprintln!(
            "{}: setsockopt: failed to set connection timeouts",
            env!("CARGO_PKG_NAME")
        );
        std::process::exit(1);
    }

    // handle the request
    let (status, target) = match get_request(infd) {
        Ok(request) => {
            let status = send_response(infd, config, &request);
            (status, request.target)
        }
        Err(status) => (send_status(infd, status), String::from("-")),
    };

    // one line per request, atomic for sub-PIPE_BUF writes
    println!(
        "{}\t{}\t{}\t{}",
        LogDate(Utc::now().timestamp()),
        peer,
        status.code(),
        target
    );

    // clean up and finish
    socket::shutdown(infd, Shutdown::Read).ok();
    socket::shutdown(infd, Shutdown::Write).ok();
    close(infd).ok();
    std::process::exit(0);
}

/// Textual peer address for the request log. Unix-domain peers have no
/// address worth printing.
fn peer_name(infd: RawFd) -> String {
    match socket::getpeername(infd) {
        Ok(SockAddr::Inet(addr)) => addr.ip().to_std().to_string(),
        _ => String::from("-"),
    }
}

/// Accept connections forever, dispatching one forked worker per connection.
fn serve(config: &Config, insock: RawFd) -> ! {
    loop {
        let infd = match socket::accept(insock) {
            Ok(infd) => infd,
            Err(e) => {
                eprintln!("{}: accept: {}", env!("CARGO_PKG_NAME"), e);
                continue;
            }
        };

        let peer = peer_name(infd);

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                // the worker must not hold the listening socket
                close(insock).ok();
                handle_connection(config, infd, &peer);
            }
            Ok(ForkResult::Parent { .. }) => {
                close(infd).ok();
            }
            Err(e) => {
                eprintln!("{}: fork: {}", env!("CARGO_PKG_NAME"), e);
                close(infd).ok();
            }
        }
    }
}

/// Safe wrapper for `libc::setrlimit` on RLIMIT_NPROC.
fn raise_nproc_limit(limit: u64) -> std::io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: limit as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NPROC, &rlim) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Create the TCP listening socket, trying each resolved address in turn.
fn create_ip_socket(config: &Config) -> Result<RawFd> {
    let port: u16 = config
        .port
        .parse()
        .with_context(|| format!("invalid port {}", config.port))?;
    let addrs: Vec<SocketAddr> = (config.host.as_str(), port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {}:{}", config.host, port))?
        .collect();

    let mut last_error = None;
    for addr in &addrs {
        let domain = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        let insock = match socket::socket(
            domain,
            SockType::Stream,
            SockFlag::empty(),
            SockProtocol::Tcp,
        ) {
            Ok(insock) => insock,
            Err(e) => {
                last_error = Some(e);
                continue;
            }
        };
        socket::setsockopt(insock, sockopt::ReuseAddr, &true)
            .context("failed to set SO_REUSEADDR")?;
        match socket::bind(insock, &SockAddr::Inet(InetAddr::from_std(addr))) {
            Ok(()) => {
                socket::listen(insock, libc::SOMAXCONN as usize)
                    .context("failed to listen on socket")?;
                return Ok(insock);
            }
            Err(e) => {
                close(insock).ok();
                last_error = Some(e);
            }
        }
    }
    Err(match last_error {
        Some(e) => anyhow!("failed to bind {}:{}: {}", config.host, port, e),
        None => anyhow!("no addresses resolved for {}:{}", config.host, port),
    })
}

/// Create the Unix-domain listening socket, replacing a stale socket file.
fn create_unix_socket(udsname: &str) -> Result<RawFd> {
    let insock = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .context("failed to create unix socket")?;

    // a leftover socket file would make bind fail
    std::fs::remove_file(udsname).ok();

    let addr =
        UnixAddr::new(udsname).with_context(|| format!("invalid socket path {}", udsname))?;
    socket::bind(insock, &SockAddr::Unix(addr))
        .with_context(|| format!("failed to bind {}", udsname))?;
    socket::listen(insock, libc::SOMAXCONN as usize).context("failed to listen on socket")?;
    Ok(insock)
}

/// Print usage to standard error and exit with code 1.
fn usage(argv0: &str) -> ! {
    eprintln!(
        "usage: {} [-v] [[[-h host] [-p port]] | [-U udsocket]] [-d dir] [-u user] [-g group]",
        argv0
    );
    std::process::exit(1);
}

fn parse_commandline(config: &mut Config) {
    let mut args = std::env::args();
    let argv0 = args
        .next()
        .unwrap_or_else(|| String::from(env!("CARGO_PKG_NAME")));

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-d" => config.servedir = args.next().unwrap_or_else(|| usage(&argv0)),
            "-g" => config.group = Some(args.next().unwrap_or_else(|| usage(&argv0))),
            "-h" => config.host = args.next().unwrap_or_else(|| usage(&argv0)),
            "-p" => config.port = args.next().unwrap_or_else(|| usage(&argv0)),
            "-u" => config.user = Some(args.next().unwrap_or_else(|| usage(&argv0))),
            "-U" => config.udsname = Some(args.next().unwrap_or_else(|| usage(&argv0))),
            "-v" => {
                eprintln!("{}-{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            _ => usage(&argv0),
        }
    }
}

fn main() -> Result<()> {
    let mut config = Config::new();
    parse_commandline(&mut config);

    // reap children automatically
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }
        .context("failed to set SIG_IGN on SIGCHLD")?;

    // raise the process limit
    raise_nproc_limit(config.maxnprocs).context("failed to raise RLIMIT_NPROC")?;

    // resolve identities before the chroot hides the user database
    let pwd = match &config.user {
        Some(name) => Some(
            User::from_name(name)
                .with_context(|| format!("failed to look up user {}", name))?
                .with_context(|| format!("invalid user {}", name))?,
        ),
        None => None,
    };
    let grp = match &config.group {
        Some(name) => Some(
            Group::from_name(name)
                .with_context(|| format!("failed to look up group {}", name))?
                .with_context(|| format!("invalid group {}", name))?,
        ),
        None => None,
    };

    // bind socket
    let insock = match &config.udsname {
        Some(udsname) => create_unix_socket(udsname)?,
        None => create_ip_socket(&config)?,
    };

    // chroot
    chdir(config.servedir.as_str())
        .with_context(|| format!("failed to change directory to {}", config.servedir))?;
    chroot(".").context("failed to chroot")?;

    // drop root
    if let Some(grp) = &grp {
        setgroups(&[grp.gid]).context("failed to set supplementary groups")?;
        setgid(grp.gid).with_context(|| format!("failed to set group ID to {}", grp.gid))?;
    }
    if let Some(pwd) = &pwd {
        setuid(pwd.uid).with_context(|| format!("failed to set user ID to {}", pwd.uid))?;
    }
    if getuid().is_root() {
        return Err(anyhow!("refusing to run as the root user"));
    }
    if getgid().as_raw() == 0 {
        return Err(anyhow!("refusing to run as the root group"));
    }

    serve(&config, insock)
}
