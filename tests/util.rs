use std::collections::HashMap;
use std::fs::{create_dir, File};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use nix::unistd::{Group, User};
use tempfile::TempDir;

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("localhost", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if let Ok(_) = TcpStream::connect(("localhost", port)) {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
}

impl Server {
    /// Spawn the server against a fresh document root, dropping privileges
    /// to `nobody`. Returns None when the suite runs unprivileged, since
    /// chroot needs root.
    pub fn spawn() -> Option<Self> {
        if !nix::unistd::Uid::effective().is_root() {
            eprintln!("skipping: this test needs root for chroot");
            return None;
        }

        let (user, group) = unprivileged_identity();

        // A dot-free prefix, so the tempdir itself never looks hidden.
        let root = tempfile::Builder::new()
            .prefix("quark-test-")
            .tempdir()
            .expect("failed to create tempdir");

        // Assumes the port won't be reused before the server starts.
        let port = get_unused_port().expect("failed to get unused port");

        let child = Command::new(env!("CARGO_BIN_EXE_quark"))
            .args(&[
                "-d",
                root.path().to_str().expect("path is not valid UTF-8"),
                "-h",
                "127.0.0.1",
                "-p",
                &format!("{}", port),
                "-u",
                &user,
                "-g",
                &group,
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn quark")
            .into();

        assert!(wait_for_port(port), "failed to connect to quark");

        Some(Self {
            _child: child,
            port,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn create_dir(&self, name: &str) {
        create_dir(self.root().join(name)).expect("failed to create directory");
    }

    pub fn create_file(&self, name: &str, content: &[u8]) {
        let mut file = File::create(self.root().join(name)).expect("failed to create file");
        file.write_all(content).expect("failed to write file");
    }

    fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("localhost", self.port)).expect("failed to connect to quark");
        // Keep a hung server from hanging the suite.
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send raw request bytes and collect the raw response. One request per
    /// connection, the server closes when it is done.
    pub fn send(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = self.stream();
        stream.write_all(request).unwrap();
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .expect("failed to read response");
        buf
    }

    pub fn get(&self, path: &str) -> Response {
        Response::parse(&self.send(format!("GET {} HTTP/1.1\r\n\r\n", path).as_bytes()))
    }
}

/// Server listening on a Unix-domain socket. The socket lives outside the
/// document root because it is bound before the chroot.
pub struct UnixServer {
    _child: ScopedChild,
    _sockdir: TempDir,
    socket_path: std::path::PathBuf,
    root: TempDir,
}

impl UnixServer {
    pub fn spawn() -> Option<Self> {
        if !nix::unistd::Uid::effective().is_root() {
            eprintln!("skipping: this test needs root for chroot");
            return None;
        }

        let (user, group) = unprivileged_identity();

        let root = tempfile::Builder::new()
            .prefix("quark-test-")
            .tempdir()
            .expect("failed to create tempdir");
        let sockdir = tempfile::tempdir().expect("failed to create tempdir");
        let socket_path = sockdir.path().join("quark.sock");

        let child: ScopedChild = Command::new(env!("CARGO_BIN_EXE_quark"))
            .args(&[
                "-d",
                root.path().to_str().expect("path is not valid UTF-8"),
                "-U",
                socket_path.to_str().expect("path is not valid UTF-8"),
                "-u",
                &user,
                "-g",
                &group,
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn quark")
            .into();

        for _ in 0..1000 {
            if UnixStream::connect(&socket_path).is_ok() {
                return Some(Self {
                    _child: child,
                    _sockdir: sockdir,
                    socket_path,
                    root,
                });
            }
            sleep(Duration::from_millis(1));
        }
        panic!("failed to connect to quark over unix socket");
    }

    pub fn create_file(&self, name: &str, content: &[u8]) {
        let mut file = File::create(self.root.path().join(name)).expect("failed to create file");
        file.write_all(content).expect("failed to write file");
    }

    pub fn send(&self, request: &[u8]) -> Vec<u8> {
        let mut stream =
            UnixStream::connect(&self.socket_path).expect("failed to connect to quark");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(request).unwrap();
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .expect("failed to read response");
        buf
    }
}

/// Identity to drop to: `nobody` and whatever its primary group is called.
fn unprivileged_identity() -> (String, String) {
    let user = User::from_name("nobody")
        .expect("getpwnam failed")
        .expect("no `nobody` user to drop to");
    let group = Group::from_gid(user.gid)
        .expect("getgrgid failed")
        .expect("nobody's group has no entry");
    (user.name, group.name)
}

/// Parsed HTTP response. The server closes the connection after one
/// response, so the body is simply everything after the blank line.
pub struct Response {
    pub response_line: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn parse(raw: &[u8]) -> Self {
        let split = raw
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .expect("no header terminator in response");
        let head = std::str::from_utf8(&raw[..split]).expect("response head is not valid UTF-8");
        let body = raw[split + 4..].to_vec();

        let mut header_lines = head.split("\r\n");
        let response_line = header_lines.next().expect("empty response").to_string();
        let mut headers = HashMap::new();
        for header_line in header_lines {
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }

        Self {
            response_line,
            headers,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|name| name.as_str())
    }
}
