//! Reference backend implementing the devgate launch contract
//!
//! Usage: `devgate-echo [<bootstrap>] [<target> [<ready-fd>]]`
//!
//! `<target>` is a TCP port or a unix socket path. Without arguments the
//! target comes from `PORT` or `DEVGATE_SOCKET` and the readiness descriptor
//! from `DEVGATE_READY_FD`. Every request is answered with a plain-text echo
//! of its request line, headers and body.
//!
//! - `/status/<code>` answers with that status code
//! - `/exit` answers, then exits the process shortly after

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::fs::File;
use std::io::Write;
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};

const READY_SENTINEL: &[u8] = b"!";

enum Listen {
    Tcp(u16),
    Unix(PathBuf),
}

struct Launch {
    listen: Listen,
    ready_fd: Option<RawFd>,
}

impl Launch {
    fn from_args_and_env() -> anyhow::Result<Self> {
        let mut args: Vec<String> = std::env::args().skip(1).collect();
        // A leading bootstrap script path is accepted and ignored
        if args.len() == 3 {
            args.remove(0);
        }

        let listen = match args.first() {
            Some(target) => parse_target(target),
            None => match (std::env::var("PORT"), std::env::var("DEVGATE_SOCKET")) {
                (Ok(port), _) => Listen::Tcp(port.parse()?),
                (_, Ok(socket)) => Listen::Unix(PathBuf::from(socket)),
                _ => anyhow::bail!("no target: pass a port or socket path, or set PORT / DEVGATE_SOCKET"),
            },
        };

        let ready_fd = match args.get(1) {
            Some(fd) => Some(fd.parse()?),
            None => match std::env::var("DEVGATE_READY_FD") {
                Ok(fd) => Some(fd.parse()?),
                Err(_) => None,
            },
        };

        Ok(Self { listen, ready_fd })
    }
}

fn parse_target(target: &str) -> Listen {
    match target.parse::<u16>() {
        Ok(port) => Listen::Tcp(port),
        Err(_) => Listen::Unix(PathBuf::from(target)),
    }
}

/// Write the readiness byte and close the descriptor
fn signal_ready(fd: Option<RawFd>) -> anyhow::Result<()> {
    if let Some(fd) = fd {
        // SAFETY: the descriptor was handed to this process for exactly this use
        let mut pipe = unsafe { File::from_raw_fd(fd) };
        pipe.write_all(READY_SENTINEL)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let launch = Launch::from_args_and_env()?;
    let host = std::env::var("DEVGATE_HOST").unwrap_or_else(|_| "-".to_string());

    match launch.listen {
        Listen::Tcp(port) => {
            let listener = TcpListener::bind(("127.0.0.1", port)).await?;
            signal_ready(launch.ready_fd)?;
            println!("devgate-echo serving {} on port {}", host, port);
            loop {
                let (stream, _) = listener.accept().await?;
                tokio::spawn(serve(stream));
            }
        }
        Listen::Unix(path) => {
            let listener = UnixListener::bind(&path)?;
            signal_ready(launch.ready_fd)?;
            println!("devgate-echo serving {} on {}", host, path.display());
            loop {
                let (stream, _) = listener.accept().await?;
                tokio::spawn(serve(stream));
            }
        }
    }
}

async fn serve<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service_fn(echo))
        .await
    {
        eprintln!("devgate-echo connection error: {}", e);
    }
}

async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let status = match path.strip_prefix("/status/") {
        Some(code) => code
            .parse::<u16>()
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::BAD_REQUEST),
        None => StatusCode::OK,
    };

    let request_line = format!(
        "{} {}\n",
        req.method(),
        req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );
    let mut text = request_line.into_bytes();
    for (name, value) in req.headers() {
        text.extend_from_slice(name.as_str().as_bytes());
        text.extend_from_slice(b": ");
        text.extend_from_slice(value.as_bytes());
        text.push(b'\n');
    }
    text.push(b'\n');
    text.extend_from_slice(&req.into_body().collect().await?.to_bytes());

    if path == "/exit" {
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::process::exit(0);
        });
    }

    let mut response = Response::new(Full::new(Bytes::from(text)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
        .headers_mut()
        .insert("x-echo-pid", HeaderValue::from(std::process::id()));
    Ok(response)
}
