//! Roster daemon entrypoint.
//!
//! A small service that coordinates multi-client editing of a shared record
//! list: a Unix socket listener, one thread per connection, and a single
//! coordinator owning the advisory lock table and the SQLite-backed store.
//! Connections stay open; requests arrive as newline-delimited JSON and
//! state flows back as server-push frames on the same socket.

use fs_err as fs;
use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use roster_daemon_protocol::{
    parse_identified_record, parse_new_record, ErrorInfo, Method, Request, ServerMessage,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod hub;
mod locks;
mod state;
mod store;

use state::SharedState;
use store::Store;

const SOCKET_NAME: &str = "daemon.sock";
const DB_NAME: &str = "roster.db";

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

fn main() {
    init_logging();

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    let db_path = match daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let store = match Store::new(db_path) {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, "Failed to initialize record store");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "Roster daemon started");

    let shared_state = Arc::new(SharedState::new(store));

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("ROSTER_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_home() -> Result<PathBuf, String> {
    if let Ok(home) = env::var("ROSTER_HOME") {
        if !home.trim().is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".roster"))
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    Ok(daemon_home()?.join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    Ok(daemon_home()?.join("daemon").join(DB_NAME))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

/// One thread per connection: a writer thread drains the push channel onto
/// the socket while this thread reads request frames until EOF. Whatever
/// ends the connection, the coordinator's disconnect path runs exactly once.
fn handle_connection(stream: UnixStream, state: Arc<SharedState>) {
    let conn_id = format!("conn-{}", NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed));

    let writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(err) => {
            warn!(conn_id = %conn_id, error = %err, "Failed to clone stream for writer");
            return;
        }
    };

    let (tx, rx) = mpsc::channel::<ServerMessage>();
    let writer_conn = conn_id.clone();
    let writer_handle = thread::spawn(move || {
        let mut writer = writer;
        for message in rx {
            if let Err(err) = write_message(&mut writer, &message) {
                debug!(conn_id = %writer_conn, error = %err, "Writer stopped");
                // Unblock the read loop so the connection tears down fully.
                let _ = writer.shutdown(Shutdown::Both);
                break;
            }
        }
    });

    state.hub().register(&conn_id, tx);
    state.on_connected(&conn_id);

    read_requests(stream, &state, &conn_id);

    state.on_disconnected(&conn_id);
    info!(conn_id = %conn_id, "Connection closed");

    // Dropping the hub's sender above ends the writer's receive loop.
    let _ = writer_handle.join();
}

fn read_requests(stream: UnixStream, state: &Arc<SharedState>, conn_id: &str) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        let mut limited = reader.by_ref().take((MAX_REQUEST_BYTES + 1) as u64);
        match limited.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if line.len() > MAX_REQUEST_BYTES {
                    send_error(
                        state,
                        conn_id,
                        None,
                        ErrorInfo::new("request_too_large", "request exceeded maximum size"),
                    );
                    break;
                }
                let frame = line.trim();
                if frame.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Request>(frame) {
                    Ok(request) => dispatch(state, conn_id, request),
                    Err(err) => {
                        warn!(conn_id = %conn_id, error = %err, "Rejected malformed request");
                        send_error(
                            state,
                            conn_id,
                            None,
                            ErrorInfo::new(
                                "invalid_json",
                                format!("request was not valid JSON: {}", err),
                            ),
                        );
                    }
                }
            }
            Err(err) => {
                debug!(conn_id = %conn_id, error = %err, "Read loop ended");
                break;
            }
        }
    }
}

fn dispatch(state: &Arc<SharedState>, conn_id: &str, request: Request) {
    if request.protocol_version != PROTOCOL_VERSION {
        send_error(
            state,
            conn_id,
            request.id,
            ErrorInfo::new("protocol_mismatch", "unsupported protocol version"),
        );
        return;
    }

    debug!(conn_id = %conn_id, method = ?request.method, id = ?request.id, "Request received");

    match request.method {
        Method::GetHealth => {
            state
                .hub()
                .send_to(conn_id, ServerMessage::Health(state.health_snapshot()));
        }
        Method::TakeLock => match record_params(request.params, parse_identified_record) {
            Ok(record) => state.take_lock(conn_id, record),
            Err(err) => send_error(state, conn_id, request.id, err),
        },
        Method::Add => match record_params(request.params, parse_new_record) {
            Ok(record) => state.add(conn_id, request.id, record),
            Err(err) => send_error(state, conn_id, request.id, err),
        },
        Method::Delete => match record_params(request.params, parse_identified_record) {
            Ok(record) => state.delete(conn_id, request.id, record),
            Err(err) => send_error(state, conn_id, request.id, err),
        },
        Method::Update => match record_params(request.params, parse_identified_record) {
            Ok(record) => state.update(conn_id, request.id, record),
            Err(err) => send_error(state, conn_id, request.id, err),
        },
    }
}

fn record_params<T>(
    params: Option<serde_json::Value>,
    parse: impl FnOnce(serde_json::Value) -> Result<T, ErrorInfo>,
) -> Result<T, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::new("invalid_params", "record is required"))?;
    parse(params)
}

fn send_error(state: &Arc<SharedState>, conn_id: &str, request_id: Option<String>, err: ErrorInfo) {
    state
        .hub()
        .send_to(conn_id, ServerMessage::Error(err.into_frame(request_id)));
}

fn write_message(stream: &mut UnixStream, message: &ServerMessage) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, message)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
