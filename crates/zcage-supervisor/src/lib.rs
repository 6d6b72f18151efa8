use std::io;
use std::net::Shutdown;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::io::FromRawFd as _;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use zcage_wire as wire;

const ACCEPT_ATTEMPTS: usize = 5;
const REQUEST_ATTEMPTS: usize = 3;
const MAX_WORKER_DEATHS: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct WorkerHandle {
    pid: libc::pid_t,
}

impl WorkerHandle {
    pub fn from_pid(pid: libc::pid_t) -> WorkerHandle {
        WorkerHandle { pid }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }
}

pub trait SpawnWorker: Send {
    fn spawn(&self, sock_path: &Path) -> Result<WorkerHandle>;
}

// Production spawn strategy: execute a worker binary with the socket path as
// its sole argument, so the child starts from a clean process image and does
// not have to clean up inherited supervisor resources.
pub struct ExecSpawner {
    worker_bin: PathBuf,
}

impl ExecSpawner {
    pub fn new(worker_bin: impl Into<PathBuf>) -> ExecSpawner {
        ExecSpawner {
            worker_bin: worker_bin.into(),
        }
    }
}

impl SpawnWorker for ExecSpawner {
    fn spawn(&self, sock_path: &Path) -> Result<WorkerHandle> {
        let child = Command::new(&self.worker_bin)
            .arg(sock_path)
            .spawn()
            .with_context(|| format!("spawn worker: {}", self.worker_bin.display()))?;
        Ok(WorkerHandle::from_pid(child.id() as libc::pid_t))
    }
}

// One supervisor per caller process. The listening socket is bound once and
// kept for the whole session; only the worker and its connection turn over.
pub struct Supervisor {
    listener: UnixListener,
    conn: UnixStream,
    worker: WorkerHandle,
    sock_path: PathBuf,
    spawner: Box<dyn SpawnWorker>,
    deaths: u32,
}

impl Supervisor {
    pub fn init(sock_path: impl Into<PathBuf>, spawner: Box<dyn SpawnWorker>) -> Result<Supervisor> {
        let sock_path = sock_path.into();
        let listener = listen_unix(&sock_path)?;
        let (worker, conn) = spawn_and_accept(&listener, spawner.as_ref(), &sock_path)?;
        Ok(Supervisor {
            listener,
            conn,
            worker,
            sock_path,
            spawner,
            deaths: 0,
        })
    }

    pub fn worker_pid(&self) -> libc::pid_t {
        self.worker.pid()
    }

    pub fn deaths(&self) -> u32 {
        self.deaths
    }

    // Single attempt; every failure is soft and leaves restart decisions to
    // the caller.
    pub fn compress(&mut self, input: &[u8], out: &mut [u8]) -> Result<usize> {
        self.request(wire::Command::Compress, input, out)
    }

    pub fn decompress(&mut self, input: &[u8], out: &mut [u8]) -> Result<usize> {
        self.request(wire::Command::Decompress, input, out)
    }

    pub fn compress_reliably(&mut self, input: &[u8], out: &mut [u8]) -> usize {
        self.request_reliably(wire::Command::Compress, input, out)
    }

    pub fn decompress_reliably(&mut self, input: &[u8], out: &mut [u8]) -> usize {
        self.request_reliably(wire::Command::Decompress, input, out)
    }

    fn request(&mut self, cmd: wire::Command, input: &[u8], out: &mut [u8]) -> Result<usize> {
        if input.len() > wire::MAX_PAYLOAD {
            bail!(
                "payload of {} bytes exceeds the {} byte limit",
                input.len(),
                wire::MAX_PAYLOAD
            );
        }
        let hdr = wire::encode_header(cmd, input.len() as u32);
        wire::write_u32_reliably(&mut self.conn, hdr).context("send request header")?;
        wire::write_reliably(&mut self.conn, input).context("send request payload")?;
        let result_len = wire::read_u32_reliably(&mut self.conn).context("read response length")?;
        let result_len = result_len as usize;
        let limit = out.len().min(wire::MAX_PAYLOAD);
        if result_len > limit {
            bail!("response of {result_len} bytes exceeds the {limit} byte output limit");
        }
        wire::read_reliably(&mut self.conn, &mut out[..result_len])
            .context("read response payload")?;
        Ok(result_len)
    }

    // Bounded retry: up to 3 attempts, restarting the worker between attempts
    // when it is found dead. Together with the death limit this either
    // completes the request or terminates the process; it never retries
    // unboundedly.
    fn request_reliably(&mut self, cmd: wire::Command, input: &[u8], out: &mut [u8]) -> usize {
        for _ in 0..REQUEST_ATTEMPTS {
            match self.request(cmd, input, out) {
                Ok(n) => return n,
                Err(err) => {
                    eprintln!("zcage-supervisor: request attempt failed: {err:#}");
                    if self.worker_is_dead() {
                        eprintln!("zcage-supervisor: worker {} has died", self.worker.pid());
                        self.restart_worker();
                    }
                }
            }
        }
        fatal("the worker has repeatedly failed to answer the same request");
    }

    fn worker_is_dead(&self) -> bool {
        let mut wstatus: libc::c_int = 0;
        let rc = unsafe { libc::waitpid(self.worker.pid(), &mut wstatus, libc::WNOHANG) };
        match rc {
            -1 => fatal("waitpid on the worker failed"),
            0 => false,
            _ => true,
        }
    }

    fn restart_worker(&mut self) {
        self.deaths += 1;
        if self.deaths >= MAX_WORKER_DEATHS {
            fatal(&format!(
                "the worker has died too many times ({} deaths)",
                self.deaths
            ));
        }
        // The stale connection must be gone before the replacement worker
        // attaches; the descriptor itself is released on reassignment below.
        let _ = self.conn.shutdown(Shutdown::Both);
        match spawn_and_accept(&self.listener, self.spawner.as_ref(), &self.sock_path) {
            Ok((worker, conn)) => {
                self.worker = worker;
                self.conn = conn;
            }
            Err(err) => fatal(&format!("worker restart failed: {err:#}")),
        }
    }
}

fn fatal(msg: &str) -> ! {
    eprintln!("zcage-supervisor: fatal: {msg}");
    std::process::exit(1);
}

fn spawn_and_accept(
    listener: &UnixListener,
    spawner: &dyn SpawnWorker,
    sock_path: &Path,
) -> Result<(WorkerHandle, UnixStream)> {
    let worker = spawner.spawn(sock_path)?;
    for _ in 0..ACCEPT_ATTEMPTS {
        match listener.accept() {
            Ok((conn, _)) => return Ok((worker, conn)),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                continue;
            }
            Err(err) => return Err(err).context("accept worker connection"),
        }
    }
    bail!("no worker connection after {ACCEPT_ATTEMPTS} accept attempts")
}

fn listen_unix(sock_path: &Path) -> Result<UnixListener> {
    match std::fs::remove_file(sock_path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("remove stale socket: {}", sock_path.display()));
        }
    }

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error()).context("create listening socket");
    }
    // The listener owns fd from here on and releases it on any error below.
    let listener = unsafe { UnixListener::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let path_bytes = sock_path.as_os_str().as_bytes();
    if path_bytes.len() + 1 > addr.sun_path.len() {
        bail!("socket path is too long: {}", sock_path.display());
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(path_bytes) {
        *dst = *src as libc::c_char;
    }

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("bind {}", sock_path.display()));
    }

    // One worker, one connection: no queued backlog wanted.
    let rc = unsafe { libc::listen(fd, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("listen");
    }

    Ok(listener)
}
