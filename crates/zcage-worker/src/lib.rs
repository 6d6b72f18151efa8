use std::io::Write as _;
use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::{bail, Context, Result};
use zcage_wire as wire;
use zcage_wire::status;

mod codec;
mod sandbox;

use codec::Codec;

pub const COMPRESSION_LEVEL: i32 = 9;

// An init failure paired with the exit status it maps to.
struct Fatal {
    status: i32,
    error: anyhow::Error,
}

fn fail(status: i32) -> impl FnOnce(anyhow::Error) -> Fatal {
    move |error| Fatal { status, error }
}

struct Worker {
    conn: UnixStream,
    codec: Codec,
    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
}

// Runs a worker to completion and returns its exit status. A worker never
// finishes successfully; its lifecycle always ends in a fatal condition or
// in the supervisor dropping the connection.
pub fn run(sock_path: &Path) -> i32 {
    let mut worker = match Worker::init(sock_path) {
        Ok(worker) => worker,
        Err(fatal) => {
            // stderr may already be closed, depending on how far init got
            let _ = writeln!(std::io::stderr(), "zcage-worker: {:#}", fatal.error);
            return fatal.status;
        }
    };
    worker.serve()
}

// Fork-and-serve spawn path for tests and fuzz harnesses. Production callers
// execute a worker binary instead, so the child starts from a clean image.
pub fn fork_serving_worker(sock_path: &Path) -> Result<libc::pid_t> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error()).context("fork worker");
    }
    if pid == 0 {
        let code = run(sock_path);
        std::process::exit(code);
    }
    Ok(pid)
}

impl Worker {
    // Ordering is the security invariant here: contexts, buffers and the
    // codec's internal workspaces all come into existence before the syscall
    // allow-list, and stdio stays open until after the connect so failures
    // up to that point can still be reported.
    fn init(sock_path: &Path) -> Result<Worker, Fatal> {
        let mut codec = Codec::new(COMPRESSION_LEVEL).map_err(fail(status::CODEC_INIT_FAIL))?;
        let mut in_buf = allocate_payload_buf().map_err(fail(status::ALLOC_FAIL))?;
        let mut out_buf = allocate_payload_buf().map_err(fail(status::ALLOC_FAIL))?;
        run_self_test(&mut codec, &mut in_buf, &mut out_buf).map_err(fail(status::CODEC_FAIL))?;

        let conn = UnixStream::connect(sock_path)
            .with_context(|| format!("connect to supervisor socket: {}", sock_path.display()))
            .map_err(fail(status::BAD_COMM_SOCKET))?;
        close_stdio().map_err(fail(status::FD_CLOSE_FAIL))?;
        sandbox::install_syscall_allowlist().map_err(fail(status::SANDBOX_FAIL))?;

        Ok(Worker {
            conn,
            codec,
            in_buf,
            out_buf,
        })
    }

    // Request/response loop. Every error terminates the worker; recovery is
    // exclusively the supervisor's business, through a process restart.
    fn serve(&mut self) -> i32 {
        loop {
            let hdr = match wire::read_u32_reliably(&mut self.conn) {
                Ok(hdr) => hdr,
                Err(_) => return status::COMM_FAIL,
            };
            let (raw_cmd, payload_len) = wire::decode_header(hdr);
            let payload_len = payload_len as usize;
            if payload_len > self.in_buf.len() {
                return status::BAD_MESSAGE;
            }
            if wire::read_reliably(&mut self.conn, &mut self.in_buf[..payload_len]).is_err() {
                return status::COMM_FAIL;
            }

            let result_len = match wire::Command::from_raw(raw_cmd) {
                Some(wire::Command::Compress) => {
                    match self
                        .codec
                        .compress(&self.in_buf[..payload_len], &mut self.out_buf)
                    {
                        Ok(n) => n,
                        Err(_) => return status::CODEC_FAIL,
                    }
                }
                Some(wire::Command::Decompress) => {
                    match self
                        .codec
                        .decompress(&self.in_buf[..payload_len], &mut self.out_buf)
                    {
                        Ok(n) => n,
                        Err(_) => return status::CODEC_FAIL,
                    }
                }
                None => return status::COMM_FAIL,
            };

            if wire::write_u32_reliably(&mut self.conn, result_len as u32).is_err() {
                return status::COMM_FAIL;
            }
            if wire::write_reliably(&mut self.conn, &self.out_buf[..result_len]).is_err() {
                return status::COMM_FAIL;
            }
        }
    }
}

// Fixed-capacity payload buffer, alive for the whole process. Allocation
// failure must surface as a status, not an abort, so the reservation is
// explicit.
fn allocate_payload_buf() -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(wire::MAX_PAYLOAD)
        .context("allocate payload buffer")?;
    buf.resize(wire::MAX_PAYLOAD, 0);
    Ok(buf)
}

// Full-size round trip through both contexts. The point is not the result
// but the side effect: it forces the codec to perform every internal
// allocation it will ever need, while asking the OS for memory is still
// allowed.
fn run_self_test(codec: &mut Codec, in_buf: &mut [u8], out_buf: &mut [u8]) -> Result<()> {
    in_buf.fill(0);
    let c_len = codec.compress(in_buf, out_buf).context("self-test compress")?;
    let d_len = codec
        .decompress(&out_buf[..c_len], in_buf)
        .context("self-test decompress")?;
    if d_len != in_buf.len() {
        bail!(
            "self-test round trip produced {d_len} bytes, expected {}",
            in_buf.len()
        );
    }
    if in_buf.iter().any(|&b| b != 0) {
        bail!("self-test round trip corrupted the buffer");
    }
    Ok(())
}

fn close_stdio() -> Result<()> {
    for fd in 0..=2 {
        let rc = unsafe { libc::close(fd) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("close fd {fd}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_test_passes_on_fresh_buffers() {
        let mut codec = Codec::new(COMPRESSION_LEVEL).unwrap();
        let mut in_buf = vec![0u8; 256 * 1024];
        let mut out_buf = vec![0u8; 256 * 1024];
        run_self_test(&mut codec, &mut in_buf, &mut out_buf).unwrap();
        assert!(in_buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn self_test_zeroes_a_dirty_input_buffer() {
        let mut codec = Codec::new(COMPRESSION_LEVEL).unwrap();
        let mut in_buf = vec![0xFFu8; 64 * 1024];
        let mut out_buf = vec![0u8; 64 * 1024];
        run_self_test(&mut codec, &mut in_buf, &mut out_buf).unwrap();
    }

    #[test]
    fn payload_buffers_have_the_full_capacity() {
        let buf = allocate_payload_buf().unwrap();
        assert_eq!(buf.len(), wire::MAX_PAYLOAD);
    }
}
